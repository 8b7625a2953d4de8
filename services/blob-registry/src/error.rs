//! Error types for the registry

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::digest::{Digest, DigestError};
use crate::protocol::range_header;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The auth gate refused the request.
    #[error("authentication required: {0}")]
    Unauthorized(String),

    /// No blob with this digest has been committed.
    #[error("blob unknown to registry: {0}")]
    BlobNotFound(Digest),

    /// The upload session is unknown, committed or aborted.
    #[error("blob upload unknown to registry: {0}")]
    SessionNotFound(String),

    /// The upload session was reaped after sitting idle.
    #[error("blob upload expired: {0}")]
    SessionExpired(String),

    /// The digest text could not be parsed.
    #[error(transparent)]
    InvalidDigest(#[from] DigestError),

    /// The uploaded content does not hash to the claimed digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the client claimed
        expected: Digest,
        /// Digest of the bytes actually received
        actual: Digest,
    },

    /// A chunk did not start where the upload left off.
    #[error("chunk starts at byte {requested}, but upload is at byte {offset}")]
    RangeConflict {
        /// Bytes staged so far
        offset: u64,
        /// Where the rejected chunk claimed to start
        requested: u64,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// The upload request is malformed.
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// The operation did not finish within the configured deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Wire-level error codes, as defined by the distribution API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `BLOB_UNKNOWN`
    BlobUnknown,
    /// `BLOB_UPLOAD_INVALID`
    BlobUploadInvalid,
    /// `BLOB_UPLOAD_UNKNOWN`
    BlobUploadUnknown,
    /// `DIGEST_INVALID`
    DigestInvalid,
    /// `NAME_INVALID`
    NameInvalid,
    /// `RANGE_INVALID`
    RangeInvalid,
    /// `UNAUTHORIZED`
    Unauthorized,
    /// `UNSUPPORTED`
    Unsupported,
    /// `UNAVAILABLE`
    Unavailable,
    /// `UNKNOWN`
    Unknown,
}

/// The fixed description of an error code.
#[derive(Debug)]
pub struct ErrorDescriptor {
    /// Code as sent on the wire
    pub code: &'static str,
    /// Human readable summary
    pub message: &'static str,
    /// HTTP status sent with this code
    pub status: StatusCode,
}

macro_rules! descriptor {
    ($code:literal, $message:literal, $status:ident) => {
        ErrorDescriptor {
            code: $code,
            message: $message,
            status: StatusCode::$status,
        }
    };
}

/// Indexed by `ErrorCode as usize`.
static DESCRIPTORS: [ErrorDescriptor; 10] = [
    descriptor!("BLOB_UNKNOWN", "blob unknown to registry", NOT_FOUND),
    descriptor!("BLOB_UPLOAD_INVALID", "blob upload invalid", BAD_REQUEST),
    descriptor!("BLOB_UPLOAD_UNKNOWN", "blob upload unknown to registry", NOT_FOUND),
    descriptor!("DIGEST_INVALID", "provided digest did not match uploaded content", BAD_REQUEST),
    descriptor!("NAME_INVALID", "invalid repository name", BAD_REQUEST),
    descriptor!("RANGE_INVALID", "invalid content range", RANGE_NOT_SATISFIABLE),
    descriptor!("UNAUTHORIZED", "authentication required", UNAUTHORIZED),
    descriptor!("UNSUPPORTED", "the operation is unsupported", BAD_REQUEST),
    descriptor!("UNAVAILABLE", "service unavailable", SERVICE_UNAVAILABLE),
    descriptor!("UNKNOWN", "unknown error", INTERNAL_SERVER_ERROR),
];

impl ErrorCode {
    /// The static description of this code.
    pub fn descriptor(self) -> &'static ErrorDescriptor {
        &DESCRIPTORS[self as usize]
    }
}

impl RegistryError {
    /// The wire error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::Unauthorized(_) => ErrorCode::Unauthorized,
            RegistryError::BlobNotFound(_) => ErrorCode::BlobUnknown,
            RegistryError::SessionNotFound(_) | RegistryError::SessionExpired(_) => {
                ErrorCode::BlobUploadUnknown
            }
            RegistryError::InvalidDigest(DigestError::UnsupportedAlgorithm(_)) => {
                ErrorCode::Unsupported
            }
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                ErrorCode::DigestInvalid
            }
            RegistryError::RangeConflict { .. } => ErrorCode::RangeInvalid,
            RegistryError::InvalidRepository(_) => ErrorCode::NameInvalid,
            RegistryError::BlobUploadInvalid(_) => ErrorCode::BlobUploadInvalid,
            RegistryError::Timeout(_) => ErrorCode::Unavailable,
            RegistryError::Storage(error) if error.is_retryable() => ErrorCode::Unavailable,
            RegistryError::Storage(_) | RegistryError::Task(_) => ErrorCode::Unknown,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        self.code().descriptor().status
    }

    /// Whether the client can recover by correcting and retrying its request.
    pub fn is_client_recoverable(&self) -> bool {
        self.status_code().is_client_error()
    }

    fn detail(&self) -> serde_json::Value {
        match self {
            RegistryError::BlobNotFound(digest) => json!({ "digest": digest }),
            RegistryError::SessionNotFound(id) | RegistryError::SessionExpired(id) => {
                json!({ "session": id })
            }
            RegistryError::DigestMismatch { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            RegistryError::RangeConflict { offset, requested } => {
                json!({ "offset": offset, "requested": requested })
            }
            _ => serde_json::Value::Null,
        }
    }

    /// This error as an entry of the error envelope.
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code().descriptor().code.to_owned(),
            message: self.to_string(),
            detail: self.detail(),
        }
    }
}

/// The error envelope returned in every error body.
///
/// Several errors can be reported at once; the response status is taken from
/// the first.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// One entry per error condition
    pub errors: Vec<ErrorEntry>,
}

/// One error condition in an [`ErrorEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Wire error code, e.g. `BLOB_UNKNOWN`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Structured detail, or null
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl<'e> FromIterator<&'e RegistryError> for ErrorEnvelope {
    fn from_iter<T: IntoIterator<Item = &'e RegistryError>>(iter: T) -> Self {
        ErrorEnvelope {
            errors: iter.into_iter().map(RegistryError::entry).collect(),
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_client_recoverable() {
            tracing::debug!(error = %self, "request rejected");
        } else {
            tracing::error!(error = %self, "request failed");
        }

        let body: ErrorEnvelope = std::iter::once(&self).collect();
        let mut response = (status, axum::Json(body)).into_response();

        match self {
            RegistryError::RangeConflict { offset, .. } => {
                if let Ok(range) = HeaderValue::from_str(&range_header(offset)) {
                    response.headers_mut().insert(header::RANGE, range);
                }
            }
            RegistryError::Unauthorized(_) => {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"registry\""),
                );
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_matches_codes() {
        let codes = [
            (ErrorCode::BlobUnknown, "BLOB_UNKNOWN"),
            (ErrorCode::BlobUploadInvalid, "BLOB_UPLOAD_INVALID"),
            (ErrorCode::BlobUploadUnknown, "BLOB_UPLOAD_UNKNOWN"),
            (ErrorCode::DigestInvalid, "DIGEST_INVALID"),
            (ErrorCode::NameInvalid, "NAME_INVALID"),
            (ErrorCode::RangeInvalid, "RANGE_INVALID"),
            (ErrorCode::Unauthorized, "UNAUTHORIZED"),
            (ErrorCode::Unsupported, "UNSUPPORTED"),
            (ErrorCode::Unavailable, "UNAVAILABLE"),
            (ErrorCode::Unknown, "UNKNOWN"),
        ];

        for (code, name) in codes {
            assert_eq!(code.descriptor().code, name);
        }
    }

    #[test]
    fn statuses() {
        assert_eq!(
            RegistryError::Unauthorized("denied".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RegistryError::RangeConflict {
                offset: 5,
                requested: 0
            }
            .status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            RegistryError::SessionExpired("abc".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RegistryError::Timeout(Duration::from_secs(1)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn envelope_reports_every_error() {
        let errors = [
            RegistryError::InvalidRepository("Bad".into()),
            RegistryError::InvalidDigest(DigestError::InvalidFormat("nope".into())),
        ];
        let envelope: ErrorEnvelope = errors.iter().collect();

        let json = serde_json::to_value(&envelope).unwrap();
        let entries = json["errors"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["code"], "NAME_INVALID");
        assert_eq!(entries[1]["code"], "DIGEST_INVALID");
        assert!(entries[1].get("detail").is_some());
    }

    #[test]
    fn range_conflict_detail() {
        let entry = RegistryError::RangeConflict {
            offset: 10,
            requested: 4,
        }
        .entry();
        assert_eq!(entry.detail["offset"], 10);
        assert_eq!(entry.detail["requested"], 4);
    }
}
