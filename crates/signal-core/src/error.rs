use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    /// Malformed candidate. Only that candidate is dropped, the cycle continues.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Treated as a missing input; neutral defaults apply.
    #[error("Provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    #[error("Provider error: {0}")]
    Provider(String),

    /// Rotation / removal aborted atomically; the previous active set stays authoritative.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Data not found: {0}")]
    DataNotFound(String),

    #[error("Generation cycle cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Illegal state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl SignalError {
    pub fn persistence(err: impl Display) -> Self {
        SignalError::Persistence(err.to_string())
    }

    pub fn provider(err: impl Display) -> Self {
        SignalError::Provider(err.to_string())
    }

    /// Per-symbol failures are isolated and counted; everything else aborts the operation.
    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            SignalError::Validation(_)
                | SignalError::ProviderTimeout(_)
                | SignalError::Provider(_)
                | SignalError::DataNotFound(_)
        )
    }
}

pub type SignalResult<T> = Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_policy() {
        assert!(SignalError::Validation("bad".into()).is_isolated());
        assert!(SignalError::ProviderTimeout(Duration::from_millis(10)).is_isolated());
        assert!(!SignalError::Persistence("disk".into()).is_isolated());
        assert!(!SignalError::Cancelled.is_isolated());
    }
}
