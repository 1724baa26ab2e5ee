//! Self-throttling bulk writer.
//!
//! Callers enqueue writes synchronously and get a [`WriteHandle`] back. A
//! single scheduler task owns the queue and the rate limiter: it groups
//! ready operations into `batchWrite` calls, keeps at most one request per
//! document in flight, retries failed operations individually and adapts
//! its rate to server contention.

mod rate_limiter;

pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, DEFAULT_INITIAL_OPS_PER_SECOND, DEFAULT_MAX_OPS_PER_SECOND,
    MIN_OPS_PER_SECOND,
};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use firekit_models::wire::BatchWriteRequest;
use firekit_models::{Code, Fields, Precondition, Write, WriteResult};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::backoff::{BackoffSettings, ExponentialBackoff};
use crate::error::{FirestoreError, FirestoreResult};
use crate::funnel::RequestFunnel;
use crate::metrics::{record_bulk_writer_ops, record_bulk_writer_rate};
use crate::reference::DocumentReference;
use crate::transport::BatchWrite;
use crate::write::{WriteBuilder, WriteKind};

/// Server-side ceiling for one `batchWrite`.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;

/// Batch size once a batch carries a retried operation.
pub const DEFAULT_RETRY_BATCH_SIZE: usize = 10;

/// Attempts before the default error handler gives up on an operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

// =============================================================================
// Options and callbacks
// =============================================================================

#[derive(Debug, Clone)]
pub struct BulkWriterOptions {
    pub max_batch_size: usize,
    pub retry_batch_size: usize,
    pub throttling: RateLimiterConfig,
    /// Per-operation retry delays.
    pub backoff: BackoffSettings,
}

impl Default for BulkWriterOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry_batch_size: DEFAULT_RETRY_BATCH_SIZE,
            throttling: RateLimiterConfig::default(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl BulkWriterOptions {
    pub fn without_throttling(mut self) -> Self {
        self.throttling.enabled = false;
        self
    }

    pub fn with_throttling(mut self, throttling: RateLimiterConfig) -> Self {
        self.throttling = throttling;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    fn validate(&self) -> FirestoreResult<()> {
        if self.max_batch_size == 0 || self.retry_batch_size == 0 {
            return Err(FirestoreError::invalid_argument("batch sizes must be at least 1"));
        }
        let t = &self.throttling;
        if t.enabled && t.initial_ops_per_second > t.max_ops_per_second {
            return Err(FirestoreError::invalid_argument(format!(
                "initial_ops_per_second ({}) exceeds max_ops_per_second ({})",
                t.initial_ops_per_second, t.max_ops_per_second
            )));
        }
        Ok(())
    }
}

/// A failed attempt, as seen by the error handler.
#[derive(Debug, Clone)]
pub struct BulkWriterError {
    pub document: DocumentReference,
    pub kind: WriteKind,
    pub code: Code,
    pub message: String,
    /// Failed attempts so far, including this one.
    pub attempts: u32,
}

/// Decides whether a failed operation is retried.
pub type ErrorHandler = Arc<dyn Fn(&BulkWriterError) -> bool + Send + Sync>;

/// Observes successful operations.
pub type ResultHandler = Arc<dyn Fn(&DocumentReference, &WriteResult) + Send + Sync>;

/// Retry transient failures until an operation has failed ten times.
pub fn default_error_handler(error: &BulkWriterError) -> bool {
    matches!(
        error.code,
        Code::ResourceExhausted | Code::Aborted | Code::Unavailable | Code::DeadlineExceeded
    ) && error.attempts < DEFAULT_MAX_ATTEMPTS
}

// =============================================================================
// Handles
// =============================================================================

/// Resolves to the outcome of one enqueued operation.
#[must_use = "a write handle reports the write's outcome"]
pub struct WriteHandle {
    rx: oneshot::Receiver<FirestoreResult<WriteResult>>,
}

impl Future for WriteHandle {
    type Output = FirestoreResult<WriteResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FirestoreError::BulkWriterClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

enum Command {
    Enqueue(PendingOp),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
    OnWriteError(ErrorHandler),
    OnWriteResult(ResultHandler),
}

/// Batched, rate-limited writer for large numbers of independent writes.
pub struct BulkWriter {
    tx: mpsc::UnboundedSender<Command>,
    builder: WriteBuilder,
    backoff: BackoffSettings,
    closed: AtomicBool,
    next_seq: AtomicU64,
}

impl BulkWriter {
    pub(crate) fn new(funnel: RequestFunnel, options: BulkWriterOptions) -> FirestoreResult<Self> {
        options.validate()?;
        let builder = WriteBuilder::new(funnel.database().clone());
        let backoff = options.backoff.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler::new(funnel, options, rx);
        tokio::spawn(scheduler.run());

        Ok(Self {
            tx,
            builder,
            backoff,
            closed: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        })
    }

    fn enqueue(&self, document: &DocumentReference, kind: WriteKind, write: Write) -> FirestoreResult<WriteHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FirestoreError::BulkWriterClosed);
        }

        let (result_tx, rx) = oneshot::channel();
        let op = PendingOp {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            document: document.clone(),
            kind,
            write,
            attempts: 0,
            not_before: None,
            backoff: ExponentialBackoff::new(self.backoff.clone()),
            result_tx,
        };

        self.tx
            .send(Command::Enqueue(op))
            .map_err(|_| FirestoreError::BulkWriterClosed)?;
        Ok(WriteHandle { rx })
    }

    /// Create a document; fails if it already exists.
    pub fn create(&self, document: &DocumentReference, fields: Fields) -> FirestoreResult<WriteHandle> {
        let write = self.builder.create(document, fields);
        self.enqueue(document, WriteKind::Create, write)
    }

    pub fn set(&self, document: &DocumentReference, fields: Fields) -> FirestoreResult<WriteHandle> {
        let write = self.builder.set(document, fields);
        self.enqueue(document, WriteKind::Set, write)
    }

    pub fn set_merge(&self, document: &DocumentReference, fields: Fields) -> FirestoreResult<WriteHandle> {
        let write = self.builder.set_merge(document, fields);
        self.enqueue(document, WriteKind::Set, write)
    }

    pub fn update(&self, document: &DocumentReference, fields: Fields) -> FirestoreResult<WriteHandle> {
        let write = self.builder.update(document, fields);
        self.enqueue(document, WriteKind::Update, write)
    }

    pub fn delete(&self, document: &DocumentReference) -> FirestoreResult<WriteHandle> {
        let write = self.builder.delete(document, None);
        self.enqueue(document, WriteKind::Delete, write)
    }

    pub fn delete_with_precondition(
        &self,
        document: &DocumentReference,
        precondition: Precondition,
    ) -> FirestoreResult<WriteHandle> {
        let write = self.builder.delete(document, Some(precondition));
        self.enqueue(document, WriteKind::Delete, write)
    }

    /// Replace the retry predicate. Applies to failures seen after this call.
    pub fn on_write_error<F>(&self, handler: F)
    where
        F: Fn(&BulkWriterError) -> bool + Send + Sync + 'static,
    {
        let _ = self.tx.send(Command::OnWriteError(Arc::new(handler)));
    }

    /// Observe every successful write.
    pub fn on_write_result<F>(&self, handler: F)
    where
        F: Fn(&DocumentReference, &WriteResult) + Send + Sync + 'static,
    {
        let _ = self.tx.send(Command::OnWriteResult(Arc::new(handler)));
    }

    /// Wait until every operation enqueued before this call has settled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Reject further writes and wait for every enqueued operation,
    /// including retries, to settle.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

struct PendingOp {
    seq: u64,
    document: DocumentReference,
    kind: WriteKind,
    write: Write,
    /// Failed attempts so far.
    attempts: u32,
    not_before: Option<Instant>,
    backoff: ExponentialBackoff,
    result_tx: oneshot::Sender<FirestoreResult<WriteResult>>,
}

impl PendingOp {
    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

struct BatchOutcome {
    ops: Vec<PendingOp>,
    result: FirestoreResult<firekit_models::wire::BatchWriteResponse>,
}

/// Owns the queue and the rate limiter; the only mutator of both.
struct Scheduler {
    funnel: RequestFunnel,
    options: BulkWriterOptions,
    rx: mpsc::UnboundedReceiver<Command>,
    rx_open: bool,
    /// Ops waiting to be sent, by enqueue order.
    queue: BTreeMap<u64, PendingOp>,
    /// Documents with a request in flight.
    in_flight: HashSet<DocumentReference>,
    batches: FuturesUnordered<BoxFuture<'static, BatchOutcome>>,
    limiter: RateLimiter,
    /// Sequence numbers of ops that have not settled yet.
    unsettled: BTreeSet<u64>,
    /// Flush waiters and the highest sequence number they cover.
    flushes: Vec<(Option<u64>, oneshot::Sender<()>)>,
    closers: Vec<oneshot::Sender<()>>,
    closing: bool,
    highest_seq: Option<u64>,
    /// Earliest instant the rate limiter admits the next batch.
    throttled_until: Option<Instant>,
    on_error: ErrorHandler,
    on_result: Option<ResultHandler>,
}

impl Scheduler {
    fn new(funnel: RequestFunnel, options: BulkWriterOptions, rx: mpsc::UnboundedReceiver<Command>) -> Self {
        let limiter = RateLimiter::new(options.throttling.clone(), Instant::now());
        record_bulk_writer_rate(limiter.rate());
        Self {
            funnel,
            options,
            rx,
            rx_open: true,
            queue: BTreeMap::new(),
            in_flight: HashSet::new(),
            batches: FuturesUnordered::new(),
            limiter,
            unsettled: BTreeSet::new(),
            flushes: Vec::new(),
            closers: Vec::new(),
            closing: false,
            highest_seq: None,
            throttled_until: None,
            on_error: Arc::new(default_error_handler),
            on_result: None,
        }
    }

    async fn run(mut self) {
        loop {
            let now = Instant::now();
            self.dispatch(now);
            self.resolve_flushes();

            if self.closing && self.is_idle() {
                // Pick up anything sent while the close was in progress.
                match self.rx.try_recv() {
                    Ok(command) => {
                        self.handle(command);
                        continue;
                    }
                    Err(_) => break,
                }
            }

            let wake = self.next_wake(now);
            tokio::select! {
                command = self.rx.recv(), if self.rx_open => match command {
                    Some(command) => {
                        self.handle(command);
                        // Batch everything already queued before dispatching.
                        while let Ok(command) = self.rx.try_recv() {
                            self.handle(command);
                        }
                    }
                    None => {
                        self.rx_open = false;
                        self.closing = true;
                    }
                },
                Some(outcome) = self.batches.next(), if !self.batches.is_empty() => {
                    self.complete(outcome, Instant::now());
                }
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
                else => break,
            }
        }

        for closer in self.closers.drain(..) {
            let _ = closer.send(());
        }
        for (_, waiter) in self.flushes.drain(..) {
            let _ = waiter.send(());
        }
        debug!("Bulk writer scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(op) => {
                self.highest_seq = Some(op.seq);
                self.unsettled.insert(op.seq);
                self.queue.insert(op.seq, op);
            }
            Command::Flush(waiter) => self.flushes.push((self.highest_seq, waiter)),
            Command::Close(waiter) => {
                self.closing = true;
                self.closers.push(waiter);
            }
            Command::OnWriteError(handler) => self.on_error = handler,
            Command::OnWriteResult(handler) => self.on_result = Some(handler),
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.batches.is_empty()
    }

    /// When the scheduler has to look at the queue again without a command
    /// or a completed batch. While throttled nothing can be sent before the
    /// limiter admits more, so ops whose backoff has ended do not count.
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        if let Some(until) = self.throttled_until.filter(|t| *t > now) {
            return Some(until);
        }
        self.queue
            .values()
            .filter_map(|op| op.not_before)
            .filter(|t| *t > now)
            .min()
    }

    /// Send as many batches as ordering and the rate limit allow.
    fn dispatch(&mut self, now: Instant) {
        if self.throttled_until.is_some_and(|t| t > now) {
            return;
        }
        self.throttled_until = None;

        loop {
            let seqs = self.next_batch(now);
            if seqs.is_empty() {
                return;
            }

            if !self.limiter.try_make_request(seqs.len(), now) {
                let delay = self.limiter.next_request_delay(seqs.len(), now);
                let delay = delay.max(Duration::from_millis(1));
                debug!(
                    ops = seqs.len(),
                    delay_ms = delay.as_millis() as u64,
                    rate = self.limiter.rate(),
                    "Bulk writer throttled"
                );
                self.throttled_until = Some(now + delay);
                return;
            }

            let ops: Vec<PendingOp> = seqs.iter().filter_map(|seq| self.queue.remove(seq)).collect();
            self.send(ops);
        }
    }

    /// Pick the next batch: ready ops in enqueue order, one per document,
    /// never overtaking an earlier op on the same document.
    fn next_batch(&self, now: Instant) -> Vec<u64> {
        let mut limit = self.options.max_batch_size.min(self.limiter.capacity());
        let mut blocked: HashSet<&DocumentReference> = self.in_flight.iter().collect();
        let mut seqs = Vec::new();

        for (seq, op) in &self.queue {
            if seqs.len() >= limit {
                break;
            }
            if blocked.contains(&op.document) {
                continue;
            }
            blocked.insert(&op.document);
            if !op.is_ready(now) {
                continue;
            }
            if op.attempts > 0 {
                limit = limit.min(self.options.retry_batch_size);
                if seqs.len() >= limit {
                    break;
                }
            }
            seqs.push(*seq);
        }
        seqs
    }

    fn send(&mut self, ops: Vec<PendingOp>) {
        for op in &ops {
            self.in_flight.insert(op.document.clone());
        }

        let request = BatchWriteRequest {
            database: self.funnel.database().database_root(),
            writes: ops.iter().map(|op| op.write.clone()).collect(),
            labels: None,
        };
        let funnel = self.funnel.clone();
        let span = info_span!("bulk_writer_batch", ops = ops.len());
        debug!(ops = ops.len(), "Sending bulk writer batch");

        self.batches.push(
            async move {
                let result = funnel.request::<BatchWrite>(&request, "bulk_writer", &[]).await;
                BatchOutcome { ops, result }
            }
            .instrument(span)
            .boxed(),
        );
    }

    fn complete(&mut self, outcome: BatchOutcome, now: Instant) {
        for op in &outcome.ops {
            self.in_flight.remove(&op.document);
        }

        let mut exhausted = 0usize;
        match outcome.result {
            Ok(response) => {
                let statuses = response.status.unwrap_or_default();
                let mut results = response.write_results.unwrap_or_default().into_iter();
                // Statuses and results line up with the request's writes.
                for (i, op) in outcome.ops.into_iter().enumerate() {
                    match (statuses.get(i), results.next()) {
                        (Some(status), _) if !status.is_ok() => {
                            let code = status.code();
                            if code == Code::ResourceExhausted {
                                exhausted += 1;
                            }
                            let message = status.message.clone().unwrap_or_default();
                            self.fail(op, code, message, now);
                        }
                        (Some(_), Some(result)) => self.succeed(op, result),
                        (status, _) => {
                            let missing = if status.is_none() { "status" } else { "result" };
                            warn!(document = %op.document, "batchWrite response has no write {}", missing);
                            self.fail(op, Code::Internal, format!("missing write {}", missing), now);
                        }
                    }
                }
            }
            Err(e) => {
                let code = e.code().unwrap_or(Code::Unknown);
                warn!("Bulk writer batch failed: {}", e);
                if code == Code::ResourceExhausted {
                    exhausted = outcome.ops.len();
                }
                for op in outcome.ops {
                    self.fail(op, code, e.to_string(), now);
                }
            }
        }

        if self.limiter.is_enabled() && exhausted >= self.limiter.contention_threshold() {
            self.limiter.on_contention(now);
            record_bulk_writer_rate(self.limiter.rate());
            warn!(rate = self.limiter.rate(), exhausted, "Backing off bulk writer rate");
        }
    }

    fn succeed(&mut self, op: PendingOp, result: WriteResult) {
        if let Some(on_result) = &self.on_result {
            on_result(&op.document, &result);
        }
        record_bulk_writer_ops("success", 1);
        self.settle(op.seq);
        let _ = op.result_tx.send(Ok(result));
    }

    fn fail(&mut self, mut op: PendingOp, code: Code, message: String, now: Instant) {
        op.attempts += 1;
        let error = BulkWriterError {
            document: op.document.clone(),
            kind: op.kind,
            code,
            message,
            attempts: op.attempts,
        };

        if (self.on_error)(&error) {
            if code == Code::ResourceExhausted {
                op.backoff.reset_to_max();
            }
            let delay = op.backoff.next_delay();
            debug!(
                document = %op.document,
                attempts = op.attempts,
                code = %code,
                delay_ms = delay.as_millis() as u64,
                "Retrying bulk writer operation"
            );
            op.not_before = Some(now + delay);
            record_bulk_writer_ops("retry", 1);
            self.queue.insert(op.seq, op);
            return;
        }

        record_bulk_writer_ops("failure", 1);
        self.settle(op.seq);
        let _ = op.result_tx.send(Err(FirestoreError::BulkWriteFailed {
            path: error.document.path().clone(),
            code,
            message: error.message,
            attempts: error.attempts,
        }));
    }

    fn settle(&mut self, seq: u64) {
        self.unsettled.remove(&seq);
    }

    fn resolve_flushes(&mut self) {
        let oldest = self.unsettled.first().copied();
        let (done, waiting): (Vec<_>, Vec<_>) = self
            .flushes
            .drain(..)
            .partition(|(upto, _)| match (upto, oldest) {
                (None, _) | (_, None) => true,
                (Some(upto), Some(oldest)) => oldest > *upto,
            });
        self.flushes = waiting;
        for (_, waiter) in done {
            let _ = waiter.send(());
        }
    }
}
