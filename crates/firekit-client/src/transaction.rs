//! Optimistic-retry transactions.
//!
//! Each attempt gets a fresh [`Transaction`] handle. Reads go to the server
//! immediately (the first one begins the transaction inline); writes are
//! buffered and sent with `commit`. Contention and other retryable failures
//! roll the attempt back and re-run the caller's closure from scratch.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use firekit_models::wire::{self, BeginTransactionRequest, CommitRequest, RollbackRequest};
use firekit_models::{Code, Fields, Precondition, Write};
use tracing::{debug, info_span, warn, Instrument};

use crate::backoff::{BackoffSettings, ExponentialBackoff};
use crate::error::{FirestoreError, FirestoreResult};
use crate::funnel::RequestFunnel;
use crate::metrics::record_transaction_attempt;
use crate::query::Query;
use crate::read::{self, Consistency, ReadOutcome};
use crate::reference::{DocumentReference, DocumentSnapshot};
use crate::transport::{BeginTransaction, Commit, Rollback};
use crate::write::WriteBuilder;

/// Default number of attempts for read-write transactions.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Codes on which `beginTransaction` and `rollback` are retried in place.
const IDEMPOTENT_RETRY_CODES: [Code; 3] = [Code::Unavailable, Code::DeadlineExceeded, Code::ResourceExhausted];

/// Options for [`crate::Firestore::run_transaction`].
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Attempts for read-write transactions; read-only runs once.
    pub max_attempts: u32,
    pub read_only: bool,
    /// Snapshot time for read-only transactions.
    pub read_time: Option<DateTime<Utc>>,
    /// Delay between attempts.
    pub backoff: BackoffSettings,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            read_only: false,
            read_time: None,
            backoff: BackoffSettings::default(),
        }
    }
}

impl TransactionOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_read_time(mut self, read_time: DateTime<Utc>) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    fn validate(&self) -> FirestoreResult<()> {
        if self.max_attempts == 0 {
            return Err(FirestoreError::invalid_argument("max_attempts must be at least 1"));
        }
        if self.read_time.is_some() && !self.read_only {
            return Err(FirestoreError::invalid_argument(
                "read_time is only supported in read-only transactions",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct TransactionState {
    token: Option<String>,
    has_read: bool,
    writes: Vec<Write>,
}

struct TransactionInner {
    funnel: RequestFunnel,
    builder: WriteBuilder,
    read_only: bool,
    read_time: Option<DateTime<Utc>>,
    /// Token of the previous attempt, passed as `retryTransaction`.
    retry_token: Option<String>,
    tag: String,
    state: Mutex<TransactionState>,
    /// Held while the first read is beginning the transaction.
    begin_gate: tokio::sync::Mutex<()>,
}

/// Handle for one transaction attempt.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    fn new(funnel: RequestFunnel, options: &TransactionOptions, retry_token: Option<String>, tag: &str) -> Self {
        let builder = WriteBuilder::new(funnel.database().clone());
        Self {
            inner: Arc::new(TransactionInner {
                funnel,
                builder,
                read_only: options.read_only,
                read_time: options.read_time,
                retry_token,
                tag: tag.to_string(),
                state: Mutex::new(TransactionState::default()),
                begin_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Server token of this attempt, once a read or begin has produced one.
    pub fn id(&self) -> Option<String> {
        self.lock().token.clone()
    }

    fn set_token(&self, token: String) {
        self.lock().token = Some(token);
    }

    fn begin_options(&self) -> wire::TransactionOptions {
        if self.inner.read_only {
            wire::TransactionOptions::read_only(self.inner.read_time)
        } else {
            wire::TransactionOptions::read_write(self.inner.retry_token.clone())
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, doc: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        let mut snapshots = self.get_all(std::slice::from_ref(doc)).await?;
        Ok(snapshots
            .pop()
            .unwrap_or_else(|| DocumentSnapshot::missing(doc.clone(), None)))
    }

    /// Read several documents; snapshots come back in argument order.
    pub async fn get_all(&self, docs: &[DocumentReference]) -> FirestoreResult<Vec<DocumentSnapshot>> {
        let funnel = &self.inner.funnel;
        let tag = self.inner.tag.as_str();
        self.read(move |consistency| read::batch_get(funnel, docs, consistency, tag))
            .await
    }

    pub async fn get_query(&self, query: &Query) -> FirestoreResult<Vec<DocumentSnapshot>> {
        let funnel = &self.inner.funnel;
        let tag = self.inner.tag.as_str();
        self.read(move |consistency| read::run_query(funnel, query, consistency, tag))
            .await
    }

    async fn read<F, Fut>(&self, op: F) -> FirestoreResult<Vec<DocumentSnapshot>>
    where
        F: FnOnce(Consistency) -> Fut,
        Fut: Future<Output = FirestoreResult<ReadOutcome>>,
    {
        {
            let mut state = self.lock();
            if !state.writes.is_empty() {
                return Err(FirestoreError::ReadAfterWrite);
            }
            state.has_read = true;
        }

        if let Some(token) = self.id() {
            return Ok(op(Consistency::Transaction(token)).await?.snapshots);
        }

        let _gate = self.inner.begin_gate.lock().await;
        if let Some(token) = self.id() {
            return Ok(op(Consistency::Transaction(token)).await?.snapshots);
        }

        if self.inner.read_only && self.inner.read_time.is_some() {
            let token = self.begin().await?;
            return Ok(op(Consistency::Transaction(token)).await?.snapshots);
        }

        let outcome = op(Consistency::NewTransaction(self.begin_options())).await?;
        let token = outcome.transaction.ok_or_else(|| {
            FirestoreError::StreamEnded("read finished without beginning a transaction".to_string())
        })?;
        debug!(request_tag = %self.inner.tag, "Transaction begun by first read");
        self.set_token(token);
        Ok(outcome.snapshots)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn buffer(&self, write: Write) -> FirestoreResult<()> {
        if self.inner.read_only {
            return Err(FirestoreError::ReadOnlyTransaction);
        }
        let mut state = self.lock();
        if !state.has_read {
            return Err(FirestoreError::ReadBeforeWrite);
        }
        state.writes.push(write);
        Ok(())
    }

    pub fn create(&self, doc: &DocumentReference, fields: Fields) -> FirestoreResult<()> {
        self.buffer(self.inner.builder.create(doc, fields))
    }

    pub fn set(&self, doc: &DocumentReference, fields: Fields) -> FirestoreResult<()> {
        self.buffer(self.inner.builder.set(doc, fields))
    }

    pub fn set_merge(&self, doc: &DocumentReference, fields: Fields) -> FirestoreResult<()> {
        self.buffer(self.inner.builder.set_merge(doc, fields))
    }

    pub fn update(&self, doc: &DocumentReference, fields: Fields) -> FirestoreResult<()> {
        self.buffer(self.inner.builder.update(doc, fields))
    }

    pub fn delete(&self, doc: &DocumentReference) -> FirestoreResult<()> {
        self.buffer(self.inner.builder.delete(doc, None))
    }

    pub fn delete_with_precondition(&self, doc: &DocumentReference, precondition: Precondition) -> FirestoreResult<()> {
        self.buffer(self.inner.builder.delete(doc, Some(precondition)))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn begin(&self) -> FirestoreResult<String> {
        let request = BeginTransactionRequest {
            database: self.inner.funnel.database().database_root(),
            options: Some(self.begin_options()),
        };
        let response = self
            .inner
            .funnel
            .request::<BeginTransaction>(&request, &self.inner.tag, &IDEMPOTENT_RETRY_CODES)
            .await?;
        self.set_token(response.transaction.clone());
        Ok(response.transaction)
    }

    async fn commit(&self) -> FirestoreResult<()> {
        if self.inner.read_only {
            return Ok(());
        }

        let (token, writes) = {
            let mut state = self.lock();
            (state.token.clone(), std::mem::take(&mut state.writes))
        };

        let token = match token {
            Some(token) => token,
            None if writes.is_empty() => return Ok(()),
            // A write raced the read that would have begun the transaction.
            None => self.begin().await?,
        };

        let request = CommitRequest {
            database: self.inner.funnel.database().database_root(),
            writes,
            transaction: Some(token),
        };
        self.inner
            .funnel
            .request::<Commit>(&request, &self.inner.tag, &[])
            .await?;
        Ok(())
    }

    /// Best-effort rollback. The token is discarded either way.
    async fn rollback(&self) {
        let token = self.lock().token.take();
        let Some(token) = token else {
            return;
        };
        if self.inner.read_only {
            return;
        }

        let request = RollbackRequest {
            database: self.inner.funnel.database().database_root(),
            transaction: token,
        };
        if let Err(e) = self
            .inner
            .funnel
            .request::<Rollback>(&request, &self.inner.tag, &IDEMPOTENT_RETRY_CODES)
            .await
        {
            debug!(request_tag = %self.inner.tag, "Rollback failed (ignored): {}", e);
        }
    }
}

// =============================================================================
// Retry loop
// =============================================================================

/// Run `update_fn` inside a transaction, retrying on contention.
pub(crate) async fn run_transaction<T, F, Fut>(
    funnel: &RequestFunnel,
    mut update_fn: F,
    options: TransactionOptions,
) -> FirestoreResult<T>
where
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    options.validate()?;

    let max_attempts = if options.read_only { 1 } else { options.max_attempts };
    let tag = format!("txn-{:08x}", rand::random::<u32>());
    let mut backoff = ExponentialBackoff::new(options.backoff.clone());
    let mut previous_token: Option<String> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let tx = Transaction::new(funnel.clone(), &options, previous_token.take(), &tag);
        let span = info_span!(
            "firestore_transaction",
            request_tag = %tag,
            attempt,
            read_only = options.read_only
        );

        let result = async {
            let value = update_fn(tx.clone()).await?;
            tx.commit().await?;
            Ok::<T, FirestoreError>(value)
        }
        .instrument(span)
        .await;

        let error = match result {
            Ok(value) => {
                record_transaction_attempt("committed");
                debug!(request_tag = %tag, attempt, "Transaction committed");
                return Ok(value);
            }
            Err(e) => e,
        };

        let token = tx.id();
        tx.rollback().await;

        if !error.is_retryable_transaction_error() || attempt >= max_attempts {
            record_transaction_attempt("failed");
            return Err(error);
        }

        record_transaction_attempt("retried");
        warn!(
            request_tag = %tag,
            attempt,
            max_attempts,
            "Transaction attempt failed, retrying: {}",
            error
        );

        if error.code() == Some(Code::ResourceExhausted) {
            backoff.reset_to_max();
        }
        backoff.backoff_and_wait().await;
        previous_token = token;
    }
}
