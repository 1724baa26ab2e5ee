//! Shared data models for the firekit Firestore client.
//!
//! This crate provides Serde-serializable types for:
//! - Resource paths and database identifiers
//! - Firestore wire values and conversion traits
//! - gRPC status codes as reported by the REST surface
//! - Request/response bodies for the RPCs the client issues

pub mod path;
pub mod status;
pub mod value;
pub mod wire;

// Re-export common types
pub use path::{DatabaseId, PathError, PathResult, ResourcePath};
pub use status::Code;
pub use value::{ArrayValue, FromFirestoreValue, GeoPoint, MapValue, ToFirestoreValue, Value};
pub use wire::{Document, Fields, Precondition, Write, WriteResult};
