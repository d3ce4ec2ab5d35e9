//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// This is the taxonomy collaborator layers (HTTP handlers, CLIs) map onto their
/// own representations. Infrastructure errors are folded into `Unavailable`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. progress outside 0-100).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure, blank id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource is not in a state that allows the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller may not see or act on the resource.
    #[error("unauthorized")]
    Unauthorized,

    /// A backing service (store, queue) could not serve the request.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation_error",
            DomainError::InvalidId(_) => "invalid_id",
            DomainError::NotFound(_) => "not_found",
            DomainError::Conflict(_) => "conflict",
            DomainError::Unauthorized => "unauthorized",
            DomainError::Unavailable(_) => "unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DomainError::validation("x").code(), "validation_error");
        assert_eq!(DomainError::not_found("job").code(), "not_found");
        assert_eq!(DomainError::conflict("x").code(), "conflict");
        assert_eq!(DomainError::Unauthorized.code(), "unauthorized");
    }

    #[test]
    fn display_includes_context() {
        let err = DomainError::conflict("cannot cancel job in completed status");
        assert_eq!(err.to_string(), "conflict: cannot cancel job in completed status");
    }
}
