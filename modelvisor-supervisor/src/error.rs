//! Error types for supervisor operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model not tracked: {0}")]
    NotFound(String),

    #[error(transparent)]
    Core(#[from] modelvisor_core::error::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure taxonomy reported per model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Binary missing or not executable
    SpawnFailure,
    /// Port already claimed, or the server failed to bind
    PortConflict,
    /// Process exited before readiness was established
    PrematureExit,
    /// No readiness marker before the startup timeout (resolved by fallback promotion)
    ReadinessTimeout,
    /// Process ignored graceful termination (resolved by a forced kill)
    ShutdownTimeout,
    /// A ready server disappeared without a stop request
    UnexpectedExit,
    /// Descriptor is disabled
    Disabled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnFailure => "SpawnFailure",
            Self::PortConflict => "PortConflict",
            Self::PrematureExit => "PrematureExit",
            Self::ReadinessTimeout => "ReadinessTimeout",
            Self::ShutdownTimeout => "ShutdownTimeout",
            Self::UnexpectedExit => "UnexpectedExit",
            Self::Disabled => "Disabled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-id start failure, carrying the diagnostic context captured before exit
#[derive(Debug, Clone, Error)]
#[error("{model_id} failed to start ({kind}): {message}")]
pub struct StartFailure {
    pub model_id: String,
    pub port: u16,
    pub kind: ErrorKind,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: String,
    pub diagnostic_tail: Vec<String>,
}

impl StartFailure {
    pub(crate) fn new(
        model_id: impl Into<String>,
        port: u16,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            port,
            kind,
            pid: None,
            exit_code: None,
            message: message.into(),
            diagnostic_tail: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_by_name() {
        let json = serde_json::to_string(&ErrorKind::PrematureExit).unwrap();
        assert_eq!(json, "\"PrematureExit\"");
        assert_eq!(ErrorKind::PortConflict.to_string(), "PortConflict");
    }

    #[test]
    fn test_start_failure_display() {
        let failure = StartFailure::new("c", 8003, ErrorKind::PrematureExit, "exited with code 1");
        assert_eq!(
            failure.to_string(),
            "c failed to start (PrematureExit): exited with code 1"
        );
        assert!(failure.diagnostic_tail.is_empty());
    }
}
