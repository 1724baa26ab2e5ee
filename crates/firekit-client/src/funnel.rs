//! Single choke point for every RPC.
//!
//! The funnel serializes typed requests, attaches routing headers, borrows a
//! pooled transport for the call's lifetime and applies the retry policy:
//! unary calls retry inside one lease on caller-supplied codes; streaming
//! calls retry transient failures that happen before the first item.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use firekit_models::{Code, DatabaseId};
use futures::stream::FusedStream;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backoff::{BackoffSettings, ExponentialBackoff};
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_retry;
use crate::pool::{ClientPool, PoolLease};
use crate::retry::{with_retry, RetryConfig};
use crate::transport::{CallOptions, JsonStream, SharedTransport, StreamingRpc, UnaryRpc};

/// Attempts made to open a stream before giving up.
pub const MAX_STREAM_ATTEMPTS: u32 = 5;

/// Codes on which opening a stream is retried.
const STREAM_RETRY_CODES: [Code; 5] = [
    Code::Aborted,
    Code::ResourceExhausted,
    Code::Unavailable,
    Code::DeadlineExceeded,
    Code::Internal,
];

pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
pub const REQUEST_PARAMS_HEADER: &str = "x-goog-request-params";

/// Issues typed RPCs through the client pool.
#[derive(Clone)]
pub struct RequestFunnel {
    pool: ClientPool<SharedTransport>,
    database: DatabaseId,
    retry: RetryConfig,
    stream_backoff: BackoffSettings,
}

impl RequestFunnel {
    pub fn new(pool: ClientPool<SharedTransport>, database: DatabaseId, retry: RetryConfig) -> Self {
        Self {
            pool,
            database,
            retry,
            stream_backoff: BackoffSettings::default(),
        }
    }

    pub fn with_stream_backoff(mut self, settings: BackoffSettings) -> Self {
        self.stream_backoff = settings;
        self
    }

    pub fn database(&self) -> &DatabaseId {
        &self.database
    }

    pub fn pool(&self) -> &ClientPool<SharedTransport> {
        &self.pool
    }

    fn call_options(&self, tag: &str) -> CallOptions {
        let root = self.database.database_root();
        CallOptions {
            request_tag: tag.to_string(),
            headers: vec![
                (RESOURCE_PREFIX_HEADER.to_string(), root.clone()),
                (REQUEST_PARAMS_HEADER.to_string(), format!("database={}", root)),
            ],
        }
    }

    /// Issue a unary RPC, retrying on `retry_codes`.
    pub async fn request<M: UnaryRpc>(
        &self,
        request: &M::Request,
        tag: &str,
        retry_codes: &[Code],
    ) -> FirestoreResult<M::Response> {
        let payload = serde_json::to_value(request)?;
        let options = self.call_options(tag);

        let lease = self.pool.acquire(tag).await?;
        let transport = Arc::clone(lease.client());
        debug!(request_tag = %tag, method = M::METHOD.name(), "Sending request");

        let response = with_retry(&self.retry, M::METHOD.name(), retry_codes, || {
            let transport = Arc::clone(&transport);
            let payload = payload.clone();
            let options = options.clone();
            async move { transport.invoke_unary(M::METHOD, payload, &options).await }
        })
        .await;
        drop(lease);

        Ok(serde_json::from_value(response?)?)
    }

    /// Open a server-streaming RPC.
    ///
    /// Resolves once the first item (or a clean end) has arrived; the
    /// returned stream holds its pool slot until it finishes or is dropped.
    pub async fn request_stream<M: StreamingRpc>(
        &self,
        request: &M::Request,
        tag: &str,
    ) -> FirestoreResult<ResponseStream<M::Response>> {
        let payload = serde_json::to_value(request)?;
        let options = self.call_options(tag);
        let lease = self.pool.acquire(tag).await?;
        let mut backoff = ExponentialBackoff::new(self.stream_backoff.clone());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match open_stream(lease.client(), M::METHOD, payload.clone(), &options).await {
                Ok((first, rest)) => {
                    debug!(request_tag = %tag, method = M::METHOD.name(), attempt, "Stream ready");
                    return Ok(ResponseStream::new(lease, first, rest));
                }
                Err(e) => {
                    let retryable = e.code().is_some_and(|code| STREAM_RETRY_CODES.contains(&code));
                    if !retryable || attempt >= MAX_STREAM_ATTEMPTS {
                        return Err(e);
                    }
                    if e.code() == Some(Code::ResourceExhausted) {
                        backoff.reset_to_max();
                    }
                    warn!(
                        request_tag = %tag,
                        method = M::METHOD.name(),
                        attempt,
                        "Stream failed before first response, retrying: {}",
                        e
                    );
                    record_retry(M::METHOD.name());
                    backoff.backoff_and_wait().await;
                }
            }
        }
    }
}

async fn open_stream(
    transport: &SharedTransport,
    method: crate::transport::Method,
    payload: serde_json::Value,
    options: &CallOptions,
) -> FirestoreResult<(Option<serde_json::Value>, JsonStream)> {
    let mut stream = transport.invoke_stream(method, payload, options).await?;
    let first = stream.next().await.transpose()?;
    Ok((first, stream))
}

// =============================================================================
// Response stream
// =============================================================================

/// Typed stream of RPC responses.
///
/// Emits at most one terminal event: after an error or the end of the
/// stream it yields `None` forever.
pub struct ResponseStream<T> {
    lease: Option<PoolLease<SharedTransport>>,
    first: Option<serde_json::Value>,
    inner: Option<JsonStream>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ResponseStream<T> {
    fn new(lease: PoolLease<SharedTransport>, first: Option<serde_json::Value>, rest: JsonStream) -> Self {
        let mut stream = Self {
            lease: Some(lease),
            first,
            inner: Some(rest),
            _marker: PhantomData,
        };
        if stream.first.is_none() {
            stream.finish();
        }
        stream
    }

    fn finish(&mut self) {
        self.first = None;
        self.inner = None;
        self.lease = None;
    }

    fn decode(&mut self, item: serde_json::Value) -> FirestoreResult<T> {
        serde_json::from_value(item).map_err(|e| {
            self.finish();
            FirestoreError::from(e)
        })
    }
}

impl<T: DeserializeOwned> Stream for ResponseStream<T> {
    type Item = FirestoreResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(first) = this.first.take() {
            return Poll::Ready(Some(this.decode(first)));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(this.decode(item))),
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl<T: DeserializeOwned> FusedStream for ResponseStream<T> {
    fn is_terminated(&self) -> bool {
        self.first.is_none() && self.inner.is_none()
    }
}

// =============================================================================
// Tests
// =============================================================================
