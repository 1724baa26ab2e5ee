//! Request and response bodies for the Firestore RPCs used by the client.
//!
//! Shapes follow the public REST/JSON mapping of `google.firestore.v1`.
//! Request types carry their `database`/`parent` routing field in the body;
//! the transport decides whether it travels in the URL or the payload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::Code;
use crate::value::Value;

/// Field map of a document.
pub type Fields = HashMap<String, Value>;

// ============================================================================
// Documents and writes
// ============================================================================

/// Firestore document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Full resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

impl Document {
    /// Document with a name and fields, as sent in writes.
    pub fn named(name: impl Into<String>, fields: Fields) -> Self {
        Self {
            name: Some(name.into()),
            fields: Some(fields),
            create_time: None,
            update_time: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|f| f.get(key))
    }
}

/// A single mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// Update or insert a document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Document>,

    /// Delete a document by full name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mask: Option<DocumentMask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_document: Option<Precondition>,
}

impl Write {
    /// Full name of the document this write targets.
    pub fn target_name(&self) -> Option<&str> {
        self.update
            .as_ref()
            .and_then(|doc| doc.name.as_deref())
            .or(self.delete.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMask {
    pub field_paths: Vec<String>,
}

/// Precondition for a write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Precondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

impl Precondition {
    pub fn exists(exists: bool) -> Self {
        Self {
            exists: Some(exists),
            update_time: None,
        }
    }

    pub fn last_update_time(update_time: impl Into<String>) -> Self {
        Self {
            exists: None,
            update_time: Some(update_time.into()),
        }
    }
}

/// Outcome of one applied write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

/// Per-write status inside a `batchWrite` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Numeric status code (0 = OK, absent also means OK).
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Status {
    pub fn code(&self) -> Code {
        self.code.map(Code::from_i32).unwrap_or(Code::Ok)
    }

    pub fn is_ok(&self) -> bool {
        self.code() == Code::Ok
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<ReadOnlyOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_write: Option<ReadWriteOptions>,
}

impl TransactionOptions {
    pub fn read_only(read_time: Option<DateTime<Utc>>) -> Self {
        Self {
            read_only: Some(ReadOnlyOptions { read_time }),
            read_write: None,
        }
    }

    pub fn read_write(retry_transaction: Option<String>) -> Self {
        Self {
            read_only: None,
            read_write: Some(ReadWriteOptions { retry_transaction }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOnlyOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadWriteOptions {
    /// Token of the attempt being retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_transaction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginTransactionRequest {
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<TransactionOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginTransactionResponse {
    pub transaction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub database: String,
    pub writes: Vec<Write>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    #[serde(default)]
    pub write_results: Option<Vec<WriteResult>>,
    #[serde(default)]
    pub commit_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub database: String,
    pub transaction: String,
}

/// Body of RPCs that return `google.protobuf.Empty`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

// ============================================================================
// Batch write
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteRequest {
    pub database: String,
    pub writes: Vec<Write>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteResponse {
    /// Results for each write, in request order.
    #[serde(default)]
    pub write_results: Option<Vec<WriteResult>>,
    /// Status for each write, in request order.
    #[serde(default)]
    pub status: Option<Vec<Status>>,
}

// ============================================================================
// Reads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetDocumentsRequest {
    pub database: String,
    pub documents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<DocumentMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_transaction: Option<TransactionOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetDocumentsResponse {
    #[serde(default)]
    pub found: Option<Document>,
    #[serde(default)]
    pub missing: Option<String>,
    /// Set on the first response when the request began a transaction.
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub read_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryRequest {
    pub parent: String,
    pub structured_query: StructuredQuery,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_transaction: Option<TransactionOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryResponse {
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub read_time: Option<String>,
    #[serde(default)]
    pub skipped_results: Option<i32>,
}

// ============================================================================
// Structured queries
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Projection>,
    pub from: Vec<CollectionSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#where: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Vec<Order>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub fields: Vec<FieldReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSelector {
    /// Absent selects every collection (kindless query).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_descendants: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReference {
    pub field_path: String,
}

impl FieldReference {
    /// Name of the pseudo-field holding the document's resource name.
    pub const DOCUMENT_ID: &'static str = "__name__";

    pub fn new(field_path: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
        }
    }

    pub fn document_id() -> Self {
        Self::new(Self::DOCUMENT_ID)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_filter: Option<CompositeFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_filter: Option<FieldFilter>,
}

impl Filter {
    pub fn field(field: FieldReference, op: FieldOperator, value: Value) -> Self {
        Self {
            composite_filter: None,
            field_filter: Some(FieldFilter { field, op, value }),
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Self {
            composite_filter: Some(CompositeFilter {
                op: CompositeOperator::And,
                filters,
            }),
            field_filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeFilter {
    pub op: CompositeOperator,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    pub field: FieldReference,
    pub op: FieldOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldOperator {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub field: FieldReference,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub values: Vec<Value>,
    /// `true` positions the cursor before the values, `false` just after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<bool>,
}
