//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Every failure an order operation can report to its caller is one of these
/// variants. Storage failures are folded into [`DomainError::Internal`] before
/// they leave the infrastructure layer, so the message carried there is never
/// an implementation detail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input, disabled payment method).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The referenced resource does not exist inside the caller's tenant.
    #[error("{0} not found")]
    NotFound(String),

    /// Insufficient stock, exhausted identifier space or a stale write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A state machine rejected the transition, or the current status forbids
    /// the operation.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The abuse-protection collaborator refused the call.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A plan or quota gate refused the call.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Storage failure or broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code, for transports that map errors to their
    /// own status vocabulary.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::InvalidId(_) => "invalid_id",
            DomainError::NotFound(_) => "not_found",
            DomainError::Conflict(_) => "conflict",
            DomainError::InvalidTransition(_) => "invalid_transition",
            DomainError::RateLimited { .. } => "rate_limited",
            DomainError::LimitExceeded(_) => "limit_exceeded",
            DomainError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DomainError::Conflict(_) | DomainError::RateLimited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_resource() {
        let err = DomainError::not_found("order");
        assert_eq!(err.to_string(), "order not found");
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn only_conflicts_and_rate_limits_are_retryable() {
        assert!(DomainError::conflict("insufficient stock").is_retryable());
        assert!(DomainError::rate_limited(3).is_retryable());
        assert!(!DomainError::validation("bad").is_retryable());
        assert!(!DomainError::invalid_transition("pending -> shipped").is_retryable());
        assert!(!DomainError::internal("storage failure").is_retryable());
    }
}
