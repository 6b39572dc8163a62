//! Error types for the jobgrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// The first group are infrastructure failures of the underlying store.
/// The second group are domain rejections that callers branch on and that
/// are never retried.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("identifier taken: {0}")]
    IdentifierTaken(String),
}

impl StateError {
    /// Domain errors describe the request, not the health of the store.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            StateError::NotFound(_)
                | StateError::BadInput(_)
                | StateError::Unauthorized(_)
                | StateError::IdentifierTaken(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }

    /// Status code an HTTP boundary should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            StateError::NotFound(_) => 404,
            StateError::BadInput(_) => 400,
            StateError::Unauthorized(_) => 403,
            StateError::IdentifierTaken(_) => 409,
            _ => 500,
        }
    }
}

impl jobgrid_core::Transient for StateError {
    /// Codec failures are neither domain errors nor worth retrying: the
    /// stored bytes will not change by waiting.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}
