//! Registry error types.

use thiserror::Error;

use jobgrid_core::Transient;
use jobgrid_state::ProcessKind;

/// Errors that can occur while registering or reaping processes.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("process {0} was terminated while registering")]
    Terminated(String),

    #[error("no free ordinal left for {0} processes")]
    OrdinalsExhausted(ProcessKind),

    #[error("state store error: {0}")]
    State(#[from] jobgrid_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

impl Transient for RegistryError {
    fn is_transient(&self) -> bool {
        match self {
            RegistryError::State(e) => e.is_transient(),
            _ => false,
        }
    }
}
