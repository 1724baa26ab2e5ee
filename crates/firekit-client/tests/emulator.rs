//! Firestore emulator integration tests.
//!
//! Start the emulator and export `FIRESTORE_EMULATOR_HOST` before running
//! with `--ignored`.

use firekit_client::{
    BulkWriterOptions, Firestore, FirestoreConfig, FirestoreError, Query, ToFirestoreValue, TransactionOptions,
};
use firekit_client::{Fields, FromFirestoreValue};

async fn client() -> Firestore {
    dotenvy::dotenv().ok();
    let _ = tracing_subscriber::fmt().with_env_filter("firekit_client=debug").try_init();

    let host = std::env::var("FIRESTORE_EMULATOR_HOST").unwrap_or_else(|_| "localhost:8080".to_string());
    let config = FirestoreConfig::new("firekit-test").with_emulator(host);
    Firestore::new(config).expect("Failed to create Firestore client")
}

fn counter_fields(n: i64) -> Fields {
    Fields::from([("n".to_string(), n.to_firestore_value())])
}

/// Test basic reads and batch writes.
#[tokio::test]
#[ignore = "requires Firestore emulator"]
async fn test_batch_write_and_read() {
    let db = client().await;
    let alice = db.doc("emulator_batch/alice").unwrap();
    let bob = db.doc("emulator_batch/bob").unwrap();

    let mut batch = db.batch();
    batch.set(&alice, counter_fields(1)).set(&bob, counter_fields(2));
    let results = batch.commit().await.expect("Failed to commit batch");
    assert_eq!(results.len(), 2);

    let snapshots = db.get_all(&[bob.clone(), alice.clone()]).await.unwrap();
    assert_eq!(snapshots[0].reference(), &bob);
    assert_eq!(snapshots[1].get("n").and_then(i64::from_firestore_value), Some(1));

    db.recursive_delete(&db.collection("emulator_batch").unwrap(), None)
        .await
        .expect("Failed to clean up");
}

/// Test concurrent transactions on one document.
#[tokio::test]
#[ignore = "requires Firestore emulator"]
async fn test_concurrent_increments() {
    let db = client().await;
    let counter = db.doc("emulator_txn/counter").unwrap();
    let mut batch = db.batch();
    batch.set(&counter, counter_fields(0));
    batch.commit().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let db = db.clone();
        let counter = counter.clone();
        tasks.push(tokio::spawn(async move {
            db.run_transaction(
                |txn| {
                    let counter = counter.clone();
                    async move {
                        let snapshot = txn.get(&counter).await?;
                        let n = snapshot.get("n").and_then(i64::from_firestore_value).unwrap_or(0);
                        txn.set(&counter, counter_fields(n + 1))?;
                        Ok(())
                    }
                },
                TransactionOptions::default().with_max_attempts(20),
            )
            .await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("Transaction failed");
    }

    let snapshot = db.get_document(&counter).await.unwrap();
    assert_eq!(snapshot.get("n").and_then(i64::from_firestore_value), Some(5));
}

/// Test a read-only transaction rejects writes.
#[tokio::test]
#[ignore = "requires Firestore emulator"]
async fn test_read_only_transaction() {
    let db = client().await;
    let doc = db.doc("emulator_ro/doc").unwrap();

    let result = db
        .run_transaction(
            |txn| {
                let doc = doc.clone();
                async move {
                    txn.get(&doc).await?;
                    txn.set(&doc, counter_fields(1))
                }
            },
            TransactionOptions::read_only(),
        )
        .await;

    assert!(matches!(result, Err(FirestoreError::ReadOnlyTransaction)));
}

/// Test bulk writes followed by a recursive delete.
#[tokio::test]
#[ignore = "requires Firestore emulator"]
async fn test_bulk_write_then_recursive_delete() {
    let db = client().await;
    let root = db.doc("emulator_bulk/root").unwrap();
    let items = root.collection("items").unwrap();

    let writer = db.bulk_writer_with_options(BulkWriterOptions::default()).unwrap();
    let root_write = writer.set(&root, counter_fields(0)).unwrap();
    let handles: Vec<_> = (0..50)
        .map(|i| writer.set(&items.doc(&format!("item-{}", i)).unwrap(), counter_fields(i)).unwrap())
        .collect();
    writer.close().await;
    root_write.await.expect("Bulk write failed");
    for handle in handles {
        handle.await.expect("Bulk write failed");
    }

    let listed = db.run_query(&Query::collection(&items)).await.unwrap();
    assert_eq!(listed.len(), 50);

    db.recursive_delete(&root, None).await.expect("Recursive delete failed");

    let listed = db.run_query(&Query::collection(&items)).await.unwrap();
    assert!(listed.is_empty());
    assert!(!db.get_document(&root).await.unwrap().exists());
}
