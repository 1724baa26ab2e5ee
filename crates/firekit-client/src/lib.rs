//! Firestore client.
//!
//! This crate provides:
//! - A pooled transport layer with a REST implementation (service account
//!   auth via gcp_auth, emulator support)
//! - Transactions with optimistic retry
//! - Atomic write batches
//! - A self-throttling bulk writer
//! - Recursive deletes built on the bulk writer

pub mod backoff;
pub mod batch;
pub mod bulk_writer;
pub mod client;
pub mod config;
pub mod error;
pub mod funnel;
pub mod metrics;
pub mod pool;
pub mod query;
mod read;
pub mod recursive_delete;
pub mod reference;
pub mod rest;
pub mod retry;
pub mod token_cache;
pub mod transaction;
pub mod transport;
pub mod write;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod transaction_tests;

pub use batch::WriteBatch;
pub use bulk_writer::{BulkWriter, BulkWriterError, BulkWriterOptions, RateLimiterConfig, WriteHandle};
pub use client::Firestore;
pub use config::FirestoreConfig;
pub use error::{FirestoreError, FirestoreResult};
pub use query::Query;
pub use recursive_delete::{RecursiveDeleteOptions, RecursiveDeleteTarget};
pub use reference::{CollectionReference, DocumentReference, DocumentSnapshot};
pub use transaction::{Transaction, TransactionOptions};
pub use firekit_models::{Code, DatabaseId, Fields, FromFirestoreValue, ToFirestoreValue, Value, WriteResult};
