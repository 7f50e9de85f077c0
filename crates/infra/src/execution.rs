//! The seam between the supervisor and whatever actually does the work.

use std::fmt;

use crate::lease_store::ClaimedItem;

/// How a failed attempt should be treated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying after backoff (timeouts, unavailable dependencies, panics).
    Transient,
    /// Retrying cannot help (undecodable payload, unknown job type).
    Terminal,
}

/// Error returned by an [`Executor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    kind: FailureKind,
    message: String,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == FailureKind::Terminal
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecutionError {}

impl From<anyhow::Error> for ExecutionError {
    /// Handler errors are transient unless stated otherwise; `{:#}` keeps the
    /// context chain in the stored message.
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }
}

/// Runs one claimed item to completion.
///
/// Implementations are invoked once per claim. `Ok(result)` marks the item
/// succeeded (storing `result` if present); an error is handed to the retry
/// handler.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, item: &ClaimedItem) -> Result<Option<serde_json::Value>, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_are_transient_and_keep_context() {
        let err = anyhow::anyhow!("connection refused").context("calling transcription service");
        let exec: ExecutionError = err.into();
        assert_eq!(exec.kind(), FailureKind::Transient);
        assert!(exec.message().contains("calling transcription service"));
        assert!(exec.message().contains("connection refused"));
    }

    #[test]
    fn terminal_errors_report_terminal() {
        let err = ExecutionError::terminal("bad payload");
        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "bad payload");
    }
}
