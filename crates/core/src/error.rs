//! Errors raised by the core primitives.

use thiserror::Error;

use crate::version::ExpectedVersion;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Text that does not parse as the named identifier type.
    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    #[error("version mismatch (expected {expected:?}, actual {actual})")]
    VersionMismatch { expected: ExpectedVersion, actual: u64 },
}
