//! Transport seam.
//!
//! Every RPC the client issues is one variant of [`Method`]. Each variant
//! has a zero-sized marker implementing [`Rpc`] that ties it to its typed
//! request/response pair; transports only ever see JSON payloads.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use firekit_models::wire::{
    BatchGetDocumentsRequest, BatchGetDocumentsResponse, BatchWriteRequest, BatchWriteResponse,
    BeginTransactionRequest, BeginTransactionResponse, CommitRequest, CommitResponse, Empty,
    RollbackRequest, RunQueryRequest, RunQueryResponse,
};

use crate::error::FirestoreResult;

/// RPCs issued by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    BeginTransaction,
    Commit,
    Rollback,
    BatchWrite,
    BatchGetDocuments,
    RunQuery,
}

impl Method {
    /// RPC name as used in logs, metrics and REST routes.
    pub fn name(self) -> &'static str {
        match self {
            Method::BeginTransaction => "beginTransaction",
            Method::Commit => "commit",
            Method::Rollback => "rollback",
            Method::BatchWrite => "batchWrite",
            Method::BatchGetDocuments => "batchGet",
            Method::RunQuery => "runQuery",
        }
    }

    /// Server-streaming RPCs produce a sequence of response items.
    pub fn is_streaming(self) -> bool {
        matches!(self, Method::BatchGetDocuments | Method::RunQuery)
    }

    /// Request field naming the resource the call is routed to.
    pub fn routing_field(self) -> &'static str {
        match self {
            Method::RunQuery => "parent",
            _ => "database",
        }
    }
}

/// Typed binding of a [`Method`] to its request and response bodies.
pub trait Rpc {
    const METHOD: Method;
    type Request: Serialize + Send + Sync;
    type Response: DeserializeOwned + Send + 'static;
}

/// RPC returning a single response.
pub trait UnaryRpc: Rpc {}

/// RPC returning a stream of responses.
pub trait StreamingRpc: Rpc {}

macro_rules! rpc {
    ($marker:ident, $method:ident, $req:ty, $resp:ty, $kind:ident) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $marker;

        impl Rpc for $marker {
            const METHOD: Method = Method::$method;
            type Request = $req;
            type Response = $resp;
        }

        impl $kind for $marker {}
    };
}

rpc!(BeginTransaction, BeginTransaction, BeginTransactionRequest, BeginTransactionResponse, UnaryRpc);
rpc!(Commit, Commit, CommitRequest, CommitResponse, UnaryRpc);
rpc!(Rollback, Rollback, RollbackRequest, Empty, UnaryRpc);
rpc!(BatchWrite, BatchWrite, BatchWriteRequest, BatchWriteResponse, UnaryRpc);
rpc!(BatchGetDocuments, BatchGetDocuments, BatchGetDocumentsRequest, BatchGetDocumentsResponse, StreamingRpc);
rpc!(RunQuery, RunQuery, RunQueryRequest, RunQueryResponse, StreamingRpc);

/// Per-call metadata.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Correlates log lines belonging to one logical operation.
    pub request_tag: String,
    pub headers: Vec<(String, String)>,
}

/// Stream of raw response items.
pub type JsonStream = BoxStream<'static, FirestoreResult<serde_json::Value>>;

/// A client able to invoke Firestore RPCs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke_unary(
        &self,
        method: Method,
        request: serde_json::Value,
        options: &CallOptions,
    ) -> FirestoreResult<serde_json::Value>;

    async fn invoke_stream(
        &self,
        method: Method,
        request: serde_json::Value,
        options: &CallOptions,
    ) -> FirestoreResult<JsonStream>;
}

/// Transport shared between the pool and in-flight calls.
pub type SharedTransport = Arc<dyn Transport>;
