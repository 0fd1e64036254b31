use thiserror::Error;

/// Errors surfaced by [`crate::pool_manager::PoolManager`] (spec.md §6/§7).
///
/// A small, closed set — `thiserror` rather than the boxed-inner-error
/// pattern used for `replica_router`/`fingerprint`'s one fallible seam,
/// because every variant here maps to one of exactly three wire error
/// shapes and none of them wrap an arbitrary downstream error type.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The payload didn't match any recognized request shape.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No engine could serve the request (empty pool, or activation failed).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An engine-side failure with no graceful error of its own.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// The `type` field of the spec.md §6 error shape.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_server_error",
        }
    }

    /// The `code` field of the spec.md §6 error shape.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::ServiceUnavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// The `message` field of the spec.md §6 error shape.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_taxonomy() {
        assert_eq!(PoolError::InvalidRequest("x".into()).code(), 400);
        assert_eq!(PoolError::ServiceUnavailable("x".into()).code(), 503);
        assert_eq!(PoolError::Internal("x".into()).code(), 500);
    }

    #[test]
    fn error_types_match_taxonomy() {
        assert_eq!(
            PoolError::InvalidRequest("x".into()).error_type(),
            "invalid_request_error"
        );
        assert_eq!(
            PoolError::ServiceUnavailable("x".into()).error_type(),
            "service_unavailable"
        );
        assert_eq!(PoolError::Internal("x".into()).error_type(), "internal_server_error");
    }
}
