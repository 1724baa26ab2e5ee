//! Tests for the transaction retry protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use firekit_models::{Code, Fields, Value};
use serde_json::json;

use crate::backoff::BackoffSettings;
use crate::error::FirestoreError;
use crate::funnel::RequestFunnel;
use crate::reference::DocumentReference;
use crate::test_support::{doc_name, fast_retry, mock_pool, test_database, MockTransport, Reply};
use crate::transaction::{run_transaction, TransactionOptions};
use crate::transport::Method;

// =============================================================================
// Test Helpers
// =============================================================================

fn funnel(mock: &Arc<MockTransport>) -> RequestFunnel {
    RequestFunnel::new(mock_pool(mock), test_database(), fast_retry())
}

fn options() -> TransactionOptions {
    TransactionOptions::default().with_backoff(BackoffSettings {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        backoff_factor: 1.5,
        jitter_factor: 0.0,
    })
}

fn account() -> DocumentReference {
    DocumentReference::parse("accounts/a").unwrap()
}

fn balance(amount: i64) -> Fields {
    Fields::from([("balance".to_string(), Value::IntegerValue(amount.to_string()))])
}

/// Every read that begins a transaction gets a fresh token `tx1`, `tx2`, ...
fn serve_reads(mock: &MockTransport) {
    let issued = Arc::new(AtomicUsize::new(0));
    mock.on(Method::BatchGetDocuments, move |request| {
        let mut items = Vec::new();
        if request.get("newTransaction").is_some() {
            let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
            items.push(Ok(json!({ "transaction": format!("tx{n}") })));
        }
        items.push(Ok(json!({
            "found": {
                "name": doc_name("accounts/a"),
                "fields": { "balance": { "integerValue": "10" } },
                "updateTime": "2024-01-01T00:00:00Z"
            },
            "readTime": "2024-01-01T00:00:01Z"
        })));
        Reply::Stream(items)
    });
    mock.on(Method::Rollback, |_| Reply::Unary(Ok(json!({}))));
}

fn aborted() -> Reply {
    Reply::Fail(FirestoreError::rpc(Code::Aborted, "Transaction lock timeout"))
}

// =============================================================================
// Retry protocol
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_contention_retries_from_scratch_until_commit() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    mock.push(Method::Commit, aborted());
    mock.push(Method::Commit, aborted());
    mock.push(Method::Commit, Reply::Unary(Ok(json!({ "commitTime": "t" }))));

    let calls = Arc::new(AtomicUsize::new(0));
    let result = run_transaction(
        &funnel(&mock),
        |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let snap = tx.get(&account()).await?;
                assert!(snap.exists());
                tx.set(&account(), balance(20))?;
                Ok("done")
            }
        },
        options(),
    )
    .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(mock.count(Method::Commit), 3);
    assert_eq!(mock.count(Method::Rollback), 2);

    let commits = mock.requests(Method::Commit);
    let committed: Vec<_> = commits.iter().map(|c| c["transaction"].clone()).collect();
    assert_eq!(committed, vec![json!("tx1"), json!("tx2"), json!("tx3")]);

    let reads = mock.requests(Method::BatchGetDocuments);
    assert!(reads[0]["newTransaction"]["readWrite"].get("retryTransaction").is_none());
    assert_eq!(reads[1]["newTransaction"]["readWrite"]["retryTransaction"], "tx1");
    assert_eq!(reads[2]["newTransaction"]["readWrite"]["retryTransaction"], "tx2");

    let rollbacks: Vec<_> = mock
        .requests(Method::Rollback)
        .iter()
        .map(|r| r["transaction"].clone())
        .collect();
    assert_eq!(rollbacks, vec![json!("tx1"), json!("tx2")]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausting_attempts_returns_last_error() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    mock.on(Method::Commit, |_| aborted());

    let calls = Arc::new(AtomicUsize::new(0));
    let result: Result<(), _> = run_transaction(
        &funnel(&mock),
        |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.get(&account()).await?;
                tx.update(&account(), balance(5))?;
                Ok(())
            }
        },
        options().with_max_attempts(3),
    )
    .await;

    assert_eq!(result.unwrap_err().code(), Some(Code::Aborted));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(mock.count(Method::Commit), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_read_error_reruns_attempt() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    // Expired transactions surface as INVALID_ARGUMENT.
    mock.push(
        Method::BatchGetDocuments,
        Reply::Fail(FirestoreError::rpc(
            Code::InvalidArgument,
            "The referenced transaction has expired or is no longer valid.",
        )),
    );
    mock.on(Method::Commit, |_| Reply::Unary(Ok(json!({}))));

    let calls = Arc::new(AtomicUsize::new(0));
    run_transaction(
        &funnel(&mock),
        |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.get(&account()).await?;
                Ok(())
            }
        },
        options(),
    )
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(mock.count(Method::Commit), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resource_exhausted_commit_is_retried() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    mock.push(
        Method::Commit,
        Reply::Fail(FirestoreError::rpc(Code::ResourceExhausted, "quota")),
    );
    mock.push(Method::Commit, Reply::Unary(Ok(json!({}))));

    run_transaction(
        &funnel(&mock),
        |tx| async move {
            tx.get(&account()).await?;
            tx.delete(&account())?;
            Ok(())
        },
        options(),
    )
    .await
    .unwrap();

    assert_eq!(mock.count(Method::Commit), 2);
}

// =============================================================================
// Ordering rules
// =============================================================================

#[tokio::test]
async fn test_write_before_read_fails_without_contacting_server() {
    let mock = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let result: Result<(), _> = run_transaction(
        &funnel(&mock),
        |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.set(&account(), balance(1))?;
                Ok(())
            }
        },
        options(),
    )
    .await;

    assert!(matches!(result, Err(FirestoreError::ReadBeforeWrite)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(mock.calls().is_empty());
}

#[tokio::test]
async fn test_read_after_write_is_rejected() {
    let mock = MockTransport::new();
    serve_reads(&mock);

    let result: Result<(), _> = run_transaction(
        &funnel(&mock),
        |tx| async move {
            tx.get(&account()).await?;
            tx.set(&account(), balance(1))?;
            tx.get(&account()).await?;
            Ok(())
        },
        options(),
    )
    .await;

    assert!(matches!(result, Err(FirestoreError::ReadAfterWrite)));
    assert_eq!(mock.count(Method::Commit), 0);
    // The begun transaction is released.
    assert_eq!(mock.count(Method::Rollback), 1);
}

#[tokio::test]
async fn test_user_error_is_not_retried() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    let calls = Arc::new(AtomicUsize::new(0));

    let result: Result<(), _> = run_transaction(
        &funnel(&mock),
        |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.get(&account()).await?;
                Err(FirestoreError::invalid_argument("insufficient balance"))
            }
        },
        options(),
    )
    .await;

    assert!(matches!(result, Err(FirestoreError::InvalidArgument(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.count(Method::Commit), 0);
}

#[tokio::test]
async fn test_zero_max_attempts_is_rejected() {
    let mock = MockTransport::new();
    let result: Result<(), _> =
        run_transaction(&funnel(&mock), |_tx| async { Ok(()) }, options().with_max_attempts(0)).await;
    assert!(matches!(result, Err(FirestoreError::InvalidArgument(_))));
}

// =============================================================================
// Read-only
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_read_only_runs_once_and_never_commits() {
    let mock = MockTransport::new();
    mock.on(Method::BatchGetDocuments, |_| {
        Reply::Fail(FirestoreError::rpc(Code::Aborted, "contention"))
    });
    let calls = Arc::new(AtomicUsize::new(0));

    let result: Result<(), _> = run_transaction(
        &funnel(&mock),
        |tx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.get(&account()).await?;
                Ok(())
            }
        },
        TransactionOptions::read_only(),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.count(Method::Commit), 0);
}

#[tokio::test]
async fn test_read_only_rejects_writes() {
    let mock = MockTransport::new();
    serve_reads(&mock);

    let result: Result<(), _> = run_transaction(
        &funnel(&mock),
        |tx| async move {
            tx.get(&account()).await?;
            tx.set(&account(), balance(1))?;
            Ok(())
        },
        TransactionOptions::read_only(),
    )
    .await;

    assert!(matches!(result, Err(FirestoreError::ReadOnlyTransaction)));
    assert_eq!(mock.count(Method::Commit), 0);
}

#[tokio::test]
async fn test_read_only_with_read_time_begins_explicitly() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    mock.push(
        Method::BeginTransaction,
        Reply::Unary(Ok(json!({ "transaction": "ro-1" }))),
    );
    let read_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let balance = run_transaction(
        &funnel(&mock),
        |tx| async move {
            let first = tx.get(&account()).await?;
            let second = tx.get(&account()).await?;
            assert_eq!(first.get("balance"), second.get("balance"));
            Ok(first.get("balance").cloned())
        },
        TransactionOptions::read_only().with_read_time(read_time),
    )
    .await
    .unwrap();

    assert_eq!(balance, Some(Value::IntegerValue("10".into())));
    assert_eq!(mock.count(Method::BeginTransaction), 1);
    assert_eq!(mock.count(Method::Commit), 0);

    let begin = &mock.requests(Method::BeginTransaction)[0];
    assert!(begin["options"]["readOnly"]["readTime"].is_string());
    for read in mock.requests(Method::BatchGetDocuments) {
        assert_eq!(read["transaction"], "ro-1");
    }
}

#[tokio::test]
async fn test_concurrent_first_reads_begin_once() {
    let mock = MockTransport::new();
    serve_reads(&mock);
    mock.on(Method::Commit, |_| Reply::Unary(Ok(json!({}))));

    run_transaction(
        &funnel(&mock),
        |tx| async move {
            let (first, second) = (account(), account());
            let (a, b) = tokio::join!(tx.get(&first), tx.get(&second));
            a?;
            b?;
            Ok(())
        },
        options(),
    )
    .await
    .unwrap();

    let reads = mock.requests(Method::BatchGetDocuments);
    let begun = reads.iter().filter(|r| r.get("newTransaction").is_some()).count();
    assert_eq!(begun, 1);
    assert_eq!(mock.requests(Method::Commit)[0]["transaction"], "tx1");
}
