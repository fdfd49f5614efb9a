//! Error type shared across the sync core.

use serde::{Deserialize, Serialize};

/// Fine-grained error codes, serialized as dotted lowercase strings
/// (e.g. `bad_request.duplicate`) when they cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed request, no finer classification.
    BadRequest,
    /// Input could not be parsed.
    BadRequestParseFailure,
    /// Input parsed but failed validation.
    BadRequestValidationFailure,
    /// A parameter is out of range or otherwise unusable.
    BadRequestInvalidParam,
    /// The request conflicts with existing state.
    BadRequestConflict,
    /// The entity already exists.
    BadRequestDuplicate,
    /// The requested entity does not exist.
    NotFound,
    /// Transient failure, no finer classification.
    Unavailable,
    /// A network call to a peer failed.
    UnavailableNetworkFailure,
    /// A local storage operation failed.
    UnavailableStorageFailure,
    /// Missing or invalid credentials.
    Unauthenticated,
    /// Credentials are valid but do not grant this operation.
    Unauthorized,
    /// Fallback.
    Unknown,
}

impl ErrorCode {
    /// The dotted string form used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::BadRequestParseFailure => "bad_request.parse_failure",
            ErrorCode::BadRequestValidationFailure => "bad_request.validation_failure",
            ErrorCode::BadRequestInvalidParam => "bad_request.invalid_param",
            ErrorCode::BadRequestConflict => "bad_request.conflict",
            ErrorCode::BadRequestDuplicate => "bad_request.duplicate",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::UnavailableNetworkFailure => "unavailable.network_failure",
            ErrorCode::UnavailableStorageFailure => "unavailable.storage_failure",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Parse the dotted string form, falling back to `Unknown`.
    pub fn parse(s: &str) -> ErrorCode {
        match s {
            "bad_request" => ErrorCode::BadRequest,
            "bad_request.parse_failure" => ErrorCode::BadRequestParseFailure,
            "bad_request.validation_failure" => ErrorCode::BadRequestValidationFailure,
            "bad_request.invalid_param" => ErrorCode::BadRequestInvalidParam,
            "bad_request.conflict" => ErrorCode::BadRequestConflict,
            "bad_request.duplicate" => ErrorCode::BadRequestDuplicate,
            "not_found" => ErrorCode::NotFound,
            "unavailable" => ErrorCode::Unavailable,
            "unavailable.network_failure" => ErrorCode::UnavailableNetworkFailure,
            "unavailable.storage_failure" => ErrorCode::UnavailableStorageFailure,
            "unauthenticated" => ErrorCode::Unauthenticated,
            "unauthorized" => ErrorCode::Unauthorized,
            _ => ErrorCode::Unknown,
        }
    }

    /// The coarse status a transport gateway maps this code to.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthenticated => StatusCode::Unauthenticated,
            ErrorCode::Unauthorized => StatusCode::PermissionDenied,
            ErrorCode::BadRequest
            | ErrorCode::BadRequestParseFailure
            | ErrorCode::BadRequestValidationFailure
            | ErrorCode::BadRequestInvalidParam
            | ErrorCode::BadRequestConflict
            | ErrorCode::BadRequestDuplicate => StatusCode::InvalidArgument,
            ErrorCode::NotFound => StatusCode::NotFound,
            ErrorCode::Unavailable
            | ErrorCode::UnavailableNetworkFailure
            | ErrorCode::UnavailableStorageFailure => StatusCode::Unavailable,
            ErrorCode::Unknown => StatusCode::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse wire status, the subset of gRPC status codes the hub emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Missing or invalid credentials.
    Unauthenticated,
    /// Operation not permitted.
    PermissionDenied,
    /// Malformed request.
    InvalidArgument,
    /// Entity not found.
    NotFound,
    /// Transient failure, retry later.
    Unavailable,
    /// Anything else.
    Unknown,
}

/// The error type for every fallible operation in the sync core.
///
/// Not an exception: errors are explicit results, classified by
/// [`ErrorCode`] so callers can route on the kind without string matching.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct HubError {
    /// Classification of the failure.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl HubError {
    /// Create an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A `bad_request.invalid_param` error.
    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequestInvalidParam, message)
    }

    /// A `bad_request.validation_failure` error.
    pub fn validation_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequestValidationFailure, message)
    }

    /// A `bad_request.duplicate` error.
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequestDuplicate, message)
    }

    /// A `not_found` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// An `unavailable.network_failure` error.
    pub fn network_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnavailableNetworkFailure, message)
    }

    /// An `unavailable.storage_failure` error.
    pub fn storage_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnavailableStorageFailure, message)
    }

    /// True for the one failure the sync engine repairs on its own: a merge
    /// rejected because the message's fid or signer is not known locally.
    pub fn is_missing_user_dependency(&self) -> bool {
        self.code == ErrorCode::BadRequestValidationFailure
            && (self.message.contains("unknown fid") || self.message.contains("invalid signer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings() {
        assert_eq!(ErrorCode::BadRequestDuplicate.as_str(), "bad_request.duplicate");
        assert_eq!(
            ErrorCode::UnavailableNetworkFailure.as_str(),
            "unavailable.network_failure"
        );
        assert_eq!(ErrorCode::NotFound.as_str(), "not_found");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::Unauthenticated.status(), StatusCode::Unauthenticated);
        assert_eq!(ErrorCode::Unauthorized.status(), StatusCode::PermissionDenied);
        assert_eq!(
            ErrorCode::BadRequestParseFailure.status(),
            StatusCode::InvalidArgument
        );
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NotFound);
        assert_eq!(ErrorCode::Unavailable.status(), StatusCode::Unavailable);
        assert_eq!(ErrorCode::Unknown.status(), StatusCode::Unknown);
    }

    #[test]
    fn test_missing_user_dependency() {
        assert!(HubError::validation_failure("unknown fid 42").is_missing_user_dependency());
        assert!(HubError::validation_failure("invalid signer").is_missing_user_dependency());
        assert!(!HubError::validation_failure("payload too large").is_missing_user_dependency());
        assert!(!HubError::not_found("unknown fid 42").is_missing_user_dependency());
    }
}
