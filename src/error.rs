//! Error taxonomy of the execution engine.
//!
//! A crashing, misbehaving or slow user program is never an error here: those
//! end up in [`ExecutionOutcome`](crate::sandbox::ExecutionOutcome). Errors
//! describe why no outcome could be produced.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    /// The request itself is malformed or too large. Never worth retrying.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No execution slot became available before the deadline.
    #[error("no execution slot available")]
    Overloaded,

    /// The caller gave up before an outcome was produced.
    #[error("execution cancelled")]
    Cancelled,

    /// Spawning, filesystem or limiter setup failed on the host side.
    #[error("infrastructure failure: {0:#}")]
    Infrastructure(#[source] anyhow::Error),
}

impl ExecError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded)
    }
}

impl From<anyhow::Error> for ExecError {
    fn from(err: anyhow::Error) -> Self {
        Self::Infrastructure(err)
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        Self::Infrastructure(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_overload_is_retryable() {
        assert!(ExecError::Overloaded.is_retryable());
        assert!(!ExecError::invalid("empty code").is_retryable());
        assert!(!ExecError::Cancelled.is_retryable());
        assert!(!ExecError::Infrastructure(anyhow::anyhow!("spawn failed")).is_retryable());
    }

    #[test]
    fn test_infrastructure_keeps_context_chain() {
        use anyhow::Context;

        let err: anyhow::Result<()> = Err(std::io::Error::other("disk full"))
            .context("Failed to write source file");
        let err = ExecError::from(err.unwrap_err());
        let text = err.to_string();
        assert!(text.contains("Failed to write source file"));
        assert!(text.contains("disk full"));
    }
}
