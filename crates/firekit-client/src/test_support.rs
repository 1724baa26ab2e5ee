//! Scripted in-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use firekit_models::{Code, DatabaseId};
use serde_json::Value as Json;

use crate::error::{FirestoreError, FirestoreResult};
use crate::pool::{ClientPool, PoolConfig};
use crate::retry::RetryConfig;
use crate::transport::{CallOptions, JsonStream, Method, SharedTransport, Transport};

/// Canned outcome of one call.
pub(crate) enum Reply {
    Unary(FirestoreResult<Json>),
    /// Stream items, in order; an `Err` item ends the stream.
    Stream(Vec<FirestoreResult<Json>>),
    /// The call fails before any stream is produced.
    Fail(FirestoreError),
}

type Handler = Arc<dyn Fn(&Json) -> Reply + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: Method,
    pub request: Json,
    pub headers: Vec<(String, String)>,
}

/// Replays queued replies first, then falls back to per-method handlers.
#[derive(Default)]
pub(crate) struct MockTransport {
    queued: Mutex<HashMap<Method, VecDeque<Reply>>>,
    handlers: Mutex<HashMap<Method, Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, method: Method, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(reply);
    }

    pub fn on<F>(&self, method: Method, handler: F)
    where
        F: Fn(&Json) -> Reply + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().insert(method, Arc::new(handler));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn requests(&self, method: Method) -> Vec<Json> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .map(|c| c.request)
            .collect()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests(method).len()
    }

    fn reply(&self, method: Method, request: Json, options: &CallOptions) -> Reply {
        self.calls.lock().unwrap().push(RecordedCall {
            method,
            request: request.clone(),
            headers: options.headers.clone(),
        });

        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&method)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }

        let handler = self.handlers.lock().unwrap().get(&method).cloned();
        match handler {
            Some(handler) => handler(&request),
            None => Reply::Fail(FirestoreError::rpc(
                Code::Unimplemented,
                format!("no scripted reply for {}", method.name()),
            )),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke_unary(&self, method: Method, request: Json, options: &CallOptions) -> FirestoreResult<Json> {
        match self.reply(method, request, options) {
            Reply::Unary(result) => result,
            Reply::Fail(e) => Err(e),
            Reply::Stream(_) => panic!("stream reply scripted for unary {}", method.name()),
        }
    }

    async fn invoke_stream(&self, method: Method, request: Json, options: &CallOptions) -> FirestoreResult<JsonStream> {
        match self.reply(method, request, options) {
            Reply::Stream(items) => Ok(Box::pin(futures::stream::iter(items))),
            Reply::Fail(e) => Err(e),
            Reply::Unary(_) => panic!("unary reply scripted for stream {}", method.name()),
        }
    }
}

pub(crate) fn test_database() -> DatabaseId {
    DatabaseId::new("test-project", DatabaseId::DEFAULT)
}

/// Full resource name of a relative document path in the test database.
pub(crate) fn doc_name(relative: &str) -> String {
    format!("{}/{}", test_database().documents_root(), relative)
}

pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// Pool serving a single shared mock.
pub(crate) fn mock_pool(mock: &Arc<MockTransport>) -> ClientPool<SharedTransport> {
    let transport: SharedTransport = mock.clone();
    ClientPool::new(PoolConfig::default(), move || -> FirestoreResult<SharedTransport> {
        Ok(Arc::clone(&transport))
    })
}
