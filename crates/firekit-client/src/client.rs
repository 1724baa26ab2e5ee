//! Firestore client entry point.
//!
//! [`Firestore`] wires configuration, credentials, the transport pool and
//! the request funnel together. It is cheap to clone; clones share the pool.

use std::future::Future;

use chrono::{DateTime, Utc};
use firekit_models::DatabaseId;
use tracing::info;

use crate::batch::WriteBatch;
use crate::bulk_writer::{BulkWriter, BulkWriterOptions};
use crate::config::FirestoreConfig;
use crate::error::{FirestoreError, FirestoreResult};
use crate::funnel::RequestFunnel;
use crate::pool::{ClientFactory, ClientPool};
use crate::query::Query;
use crate::read::{batch_get, run_query, Consistency};
use crate::recursive_delete::{recursive_delete, RecursiveDeleteOptions, RecursiveDeleteTarget};
use crate::reference::{CollectionReference, DocumentReference, DocumentSnapshot};
use crate::rest::RestTransportFactory;
use crate::transaction::{run_transaction, Transaction, TransactionOptions};
use crate::transport::SharedTransport;

/// Firestore client.
#[derive(Clone)]
pub struct Firestore {
    funnel: RequestFunnel,
}

impl Firestore {
    /// Create a client talking REST to production or an emulator. An unset
    /// `emulator_host` is taken from `FIRESTORE_EMULATOR_HOST`.
    pub fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let config = config.with_emulator_from_env();
        let factory = RestTransportFactory::from_config(&config)?;
        info!(
            project_id = %config.project_id,
            database_id = %config.database_id,
            emulator = config.is_emulator(),
            "Firestore client created"
        );
        Ok(Self::with_factory(&config, factory))
    }

    /// Create from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        Self::new(FirestoreConfig::from_env()?)
    }

    /// Create a client whose pool builds transports with `factory`.
    pub fn with_factory(config: &FirestoreConfig, factory: impl ClientFactory<SharedTransport> + 'static) -> Self {
        let pool = ClientPool::new(config.pool.clone(), factory);
        Self {
            funnel: RequestFunnel::new(pool, config.database(), config.retry.clone()),
        }
    }

    pub fn database(&self) -> &DatabaseId {
        self.funnel.database()
    }

    /// Reference to a document by relative path, e.g. `users/alice`.
    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        DocumentReference::parse(path)
    }

    /// Reference to a collection by relative path, e.g. `users/alice/posts`.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        CollectionReference::parse(path)
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch::new(self.funnel.clone())
    }

    /// Bulk writer with default throttling.
    pub fn bulk_writer(&self) -> FirestoreResult<BulkWriter> {
        self.bulk_writer_with_options(BulkWriterOptions::default())
    }

    pub fn bulk_writer_with_options(&self, options: BulkWriterOptions) -> FirestoreResult<BulkWriter> {
        BulkWriter::new(self.funnel.clone(), options)
    }

    /// Run `update_fn` inside a transaction, retrying it on contention.
    ///
    /// The closure may run several times and must not have side effects
    /// beyond the transaction it is given.
    pub async fn run_transaction<T, F, Fut>(&self, update_fn: F, options: TransactionOptions) -> FirestoreResult<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        run_transaction(&self.funnel, update_fn, options).await
    }

    pub async fn get_document(&self, doc: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        self.get_all(std::slice::from_ref(doc))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FirestoreError::StreamEnded(format!("no snapshot for {}", doc)))
    }

    /// Read several documents in one round trip. Snapshots come back in the
    /// order requested, missing documents included.
    pub async fn get_all(&self, docs: &[DocumentReference]) -> FirestoreResult<Vec<DocumentSnapshot>> {
        let outcome = batch_get(&self.funnel, docs, Consistency::Latest, "get_all").await?;
        Ok(outcome.snapshots)
    }

    /// Read documents as they were at `read_time`.
    pub async fn get_all_at(
        &self,
        docs: &[DocumentReference],
        read_time: DateTime<Utc>,
    ) -> FirestoreResult<Vec<DocumentSnapshot>> {
        let outcome = batch_get(&self.funnel, docs, Consistency::ReadTime(read_time), "get_all_at").await?;
        Ok(outcome.snapshots)
    }

    pub async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<DocumentSnapshot>> {
        let outcome = run_query(&self.funnel, query, Consistency::Latest, "run_query").await?;
        Ok(outcome.snapshots)
    }

    /// Delete a document or collection and everything below it.
    pub async fn recursive_delete(
        &self,
        target: impl Into<RecursiveDeleteTarget>,
        writer: Option<&BulkWriter>,
    ) -> FirestoreResult<()> {
        self.recursive_delete_with_options(target, writer, RecursiveDeleteOptions::default())
            .await
    }

    pub async fn recursive_delete_with_options(
        &self,
        target: impl Into<RecursiveDeleteTarget>,
        writer: Option<&BulkWriter>,
        options: RecursiveDeleteOptions,
    ) -> FirestoreResult<()> {
        recursive_delete(&self.funnel, target.into(), writer, options).await
    }

    /// Stop accepting work and wait for in-flight requests to finish.
    pub async fn terminate(&self) {
        self.funnel.pool().terminate().await;
        info!("Firestore client terminated");
    }
}
