use crate::types::EmployeeId;
use thiserror::Error;

/// Caller errors, rejected before any storage or comparison work.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("encoding component {index} is not finite")]
    NonFiniteComponent { index: usize },
    #[error("unknown or inactive employee: {0}")]
    UnknownEmployee(EmployeeId),
    #[error("invalid employee id {0:?}: must be 1-20 characters without surrounding whitespace")]
    InvalidEmployeeId(String),
    #[error("invalid {field} {value}: {reason}")]
    InvalidPolicy {
        field: &'static str,
        value: f32,
        reason: &'static str,
    },
}
