//! Firestore error types.

use firekit_models::{Code, PathError, ResourcePath};
use serde::Deserialize;
use thiserror::Error;

/// Result type for Firestore operations.
pub type FirestoreResult<T> = Result<T, FirestoreError>;

/// Errors that can occur during Firestore operations.
#[derive(Debug, Error)]
pub enum FirestoreError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Status reported by the backend.
    #[error("{code}: {message}")]
    Rpc { code: Code, message: String },

    #[error("Rate limited, retry after {0}ms")]
    RateLimited(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Transactions require at least one read before the first write")]
    ReadBeforeWrite,

    #[error("Transactions require all reads to be executed before all writes")]
    ReadAfterWrite,

    #[error("Writes are not allowed in read-only transactions")]
    ReadOnlyTransaction,

    #[error("Client pool has been terminated")]
    PoolTerminated,

    #[error("BulkWriter has already been closed")]
    BulkWriterClosed,

    #[error("Write to {path} failed after {attempts} attempt(s): {code}: {message}")]
    BulkWriteFailed {
        path: ResourcePath,
        code: Code,
        message: String,
        attempts: u32,
    },

    #[error("{count} delete(s) failed. The last delete failed with: {last}")]
    RecursiveDeleteFailed { count: usize, last: String },

    #[error("Stream ended unexpectedly: {0}")]
    StreamEnded(String),
}

/// Error body returned by the REST surface.
#[derive(Debug, Deserialize)]
struct RestErrorBody {
    error: RestErrorDetail,
}

#[derive(Debug, Deserialize)]
struct RestErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl FirestoreError {
    pub fn auth_error(msg: impl Into<String>) -> Self {
        Self::AuthError(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn rpc(code: Code, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Map an HTTP status with an opaque body.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self::rpc(Code::from_http_status(status), message)
    }

    /// Map a REST error body (`{"error": {"code", "message", "status"}}`),
    /// falling back to the HTTP status when the body is not in that shape.
    pub fn from_rest_error_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<RestErrorBody>(body) {
            Ok(parsed) => {
                let code = parsed
                    .error
                    .status
                    .as_deref()
                    .and_then(Code::from_name)
                    .unwrap_or_else(|| Code::from_http_status(status));
                Self::rpc(code, parsed.error.message)
            }
            Err(_) => Self::from_http_status(status, body),
        }
    }

    /// Status code of this error, if it carries one.
    ///
    /// Usage errors and decode failures have no code.
    pub fn code(&self) -> Option<Code> {
        match self {
            FirestoreError::Rpc { code, .. } => Some(*code),
            FirestoreError::BulkWriteFailed { code, .. } => Some(*code),
            FirestoreError::RateLimited(_) => Some(Code::ResourceExhausted),
            FirestoreError::AuthError(_) => Some(Code::Unauthenticated),
            FirestoreError::Network(e) if e.is_timeout() => Some(Code::DeadlineExceeded),
            FirestoreError::Network(_) => Some(Code::Unavailable),
            _ => None,
        }
    }

    /// Check if error is transient (contention, exhaustion, unavailability, deadline).
    pub fn is_retryable(&self) -> bool {
        self.code().is_some_and(Code::is_transient)
    }

    /// Whether a failed transaction attempt may be retried from scratch.
    pub fn is_retryable_transaction_error(&self) -> bool {
        match self.code() {
            Some(
                Code::Aborted
                | Code::Cancelled
                | Code::Unknown
                | Code::DeadlineExceeded
                | Code::Internal
                | Code::Unavailable
                | Code::Unauthenticated
                | Code::ResourceExhausted,
            ) => true,
            // An expired transaction is reported as INVALID_ARGUMENT.
            Some(Code::InvalidArgument) => self.to_string().contains("transaction has expired"),
            _ => false,
        }
    }

    /// HTTP status equivalent of this error's code.
    pub fn http_status(&self) -> Option<u16> {
        let status = match self.code()? {
            Code::Ok => 200,
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => 400,
            Code::Unauthenticated => 401,
            Code::PermissionDenied => 403,
            Code::NotFound => 404,
            Code::Aborted | Code::AlreadyExists => 409,
            Code::ResourceExhausted => 429,
            Code::Cancelled => 499,
            Code::Unimplemented => 501,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
            Code::Unknown | Code::Internal | Code::DataLoss => 500,
        };
        Some(status)
    }

    /// Server-suggested delay before retrying.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            FirestoreError::RateLimited(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Copy of this error's observable shape, for fanning one failure out to
    /// many waiters.
    pub fn to_status_error(&self) -> Self {
        match self {
            FirestoreError::Rpc { code, message } => Self::rpc(*code, message.clone()),
            other => Self::rpc(other.code().unwrap_or(Code::Unknown), other.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
