//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Every mutating operation aborts its whole transaction on any of these, so a
/// caller never observes a partial write. `Validation` and `InsufficientStock`
/// point at the offending field or request line; `Conflict` and `Storage`
/// describe the operation as a whole.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input, rejected before any mutation.
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    /// A referenced batch, product, invoice or sale does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The requested quantity exceeds the pool it is drawn from.
    ///
    /// `available` is always the maximum quantity the caller could have asked
    /// for, so a UI can clamp and retry.
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock {
        line: Option<usize>,
        requested: i64,
        available: i64,
    },

    /// The operation conflicts with current state (business rule or
    /// concurrent writer). `retryable` conflicts may succeed on a fresh attempt.
    #[error("conflict: {message}")]
    Conflict { message: String, retryable: bool },

    /// The underlying persistence layer failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl DomainError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn insufficient_stock(requested: i64, available: i64) -> Self {
        Self::InsufficientStock {
            line: None,
            requested,
            available: available.max(0),
        }
    }

    /// A business-rule conflict; retrying without changing state will fail again.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            retryable: false,
        }
    }

    /// A concurrency conflict (lock timeout, serialization failure).
    pub fn contention(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                retryable: true,
                ..
            } | Self::Storage(_)
        )
    }

    /// Attribute this error to request line `index`.
    ///
    /// Stock shortages record the index; validation errors get their field
    /// path prefixed with `lines[index]`. Other variants pass through.
    pub fn at_line(self, index: usize) -> Self {
        match self {
            Self::InsufficientStock {
                requested,
                available,
                ..
            } => Self::InsufficientStock {
                line: Some(index),
                requested,
                available,
            },
            Self::Validation { field, message } => Self::Validation {
                field: format!("lines[{index}].{field}"),
                message,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_line_tags_shortages_and_validation_only() {
        let e = DomainError::insufficient_stock(10, 4).at_line(2);
        assert_eq!(
            e,
            DomainError::InsufficientStock {
                line: Some(2),
                requested: 10,
                available: 4
            }
        );

        let e = DomainError::validation("quantity", "must be positive").at_line(0);
        match e {
            DomainError::Validation { field, .. } => assert_eq!(field, "lines[0].quantity"),
            other => panic!("unexpected {other:?}"),
        }

        let e = DomainError::conflict("busy").at_line(1);
        assert_eq!(e, DomainError::conflict("busy"));
    }

    #[test]
    fn only_contention_and_storage_are_retryable() {
        assert!(DomainError::contention("lock timeout").is_retryable());
        assert!(DomainError::storage("io").is_retryable());
        assert!(!DomainError::conflict("allocated").is_retryable());
        assert!(!DomainError::insufficient_stock(1, 0).is_retryable());
    }

    #[test]
    fn available_is_never_negative() {
        match DomainError::insufficient_stock(3, -2) {
            DomainError::InsufficientStock { available, .. } => assert_eq!(available, 0),
            other => panic!("unexpected {other:?}"),
        }
    }
}
