use engine_pool::PoolError;
use thiserror::Error;

/// The external error taxonomy (spec.md §6/§7): every error the dispatch
/// front-end returns carries a message, a kind, and the kind's fixed HTTP
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Payload shape is not a mapping, or required fields are missing.
    InvalidRequest,
    /// No active instance, activation failed, or every candidate replica is
    /// over threshold with an empty fallback set.
    ServiceUnavailable,
    /// Unexpected failure during dispatch with no graceful error of its own.
    Internal,
}

impl ErrorKind {
    /// The HTTP status code this kind maps to.
    pub fn http_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::ServiceUnavailable => 503,
            Self::Internal => 500,
        }
    }

    /// The `type` string of the spec.md §6 error shape.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Internal => "internal_server_error",
        }
    }
}

/// An error returned by the [`crate::Dispatcher`] external interfaces.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DispatchError {
    /// Human-readable detail.
    pub message: String,
    /// Which of the three taxonomy buckets this falls into.
    pub kind: ErrorKind,
}

impl DispatchError {
    /// Construct an `InvalidRequest` error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::InvalidRequest,
        }
    }

    /// Construct a `ServiceUnavailable` error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::ServiceUnavailable,
        }
    }

    /// Construct an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Internal,
        }
    }

    /// The HTTP status code for this error.
    pub fn code(&self) -> u16 {
        self.kind.http_code()
    }

    /// The `type` string of the spec.md §6 error shape.
    pub fn error_type(&self) -> &'static str {
        self.kind.error_type()
    }
}

impl From<PoolError> for DispatchError {
    fn from(e: PoolError) -> Self {
        let kind = match &e {
            PoolError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PoolError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            PoolError::Internal(_) => ErrorKind::Internal,
        };
        Self {
            message: e.message(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_spec_codes() {
        assert_eq!(ErrorKind::InvalidRequest.http_code(), 400);
        assert_eq!(ErrorKind::ServiceUnavailable.http_code(), 503);
        assert_eq!(ErrorKind::Internal.http_code(), 500);
    }

    #[test]
    fn pool_error_conversion_preserves_kind() {
        let e: DispatchError = PoolError::ServiceUnavailable("down".to_string()).into();
        assert_eq!(e.kind, ErrorKind::ServiceUnavailable);
        assert_eq!(e.code(), 503);
    }
}
