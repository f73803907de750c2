//! Handle state machine
//!
//! ```text
//! Starting ──► Ready ──► Running
//!    │           │          │
//!    │           ├──────────┴──► Failed (UnexpectedExit)
//!    ├──► Failed (SpawnFailure, PrematureExit, PortConflict)
//!    └───────────┴──────────┴──► Stopping ──► Stopped { forced }
//! ```
//!
//! `Stopped` and `Failed` are terminal. No transition leaves a terminal state.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// How a handle became ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadinessReason {
    /// A readiness marker appeared in the diagnostic output
    MarkerMatched,
    /// The startup timeout elapsed with the process still alive
    TimeoutFallback,
}

impl std::fmt::Display for ReadinessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessReason::MarkerMatched => write!(f, "marker-matched"),
            ReadinessReason::TimeoutFallback => write!(f, "timeout-fallback"),
        }
    }
}

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Spawned, waiting for readiness
    Starting,
    /// Readiness established
    Ready,
    /// Ready and confirmed alive by a later liveness probe
    Running,
    /// Shutdown requested
    Stopping,
    /// Exited after a stop request
    Stopped {
        /// True when the process had to be force-killed
        forced: bool,
    },
    /// Failed to start or died unexpectedly
    Failed {
        /// Failure classification
        kind: ErrorKind,
    },
}

impl HandleState {
    /// Whether the state is `Stopped` or `Failed`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::Failed { .. })
    }

    /// Whether readiness has been established and the handle is serving
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Whether the state expects a live process
    pub fn expects_process(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Running)
    }

    /// Check whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &HandleState) -> bool {
        use HandleState::*;

        match (self, next) {
            (Starting, Ready) | (Starting, Failed { .. }) | (Starting, Stopping) => true,
            (Ready, Running) => true,
            (Ready | Running, Failed { .. }) | (Ready | Running, Stopping) => true,
            (Stopping, Stopped { .. }) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped { .. } => "stopped",
            Self::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped { forced: true } => write!(f, "stopped (forced)"),
            Self::Failed { kind } => write!(f, "failed ({})", kind),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graceful_path() {
        let path = [
            HandleState::Starting,
            HandleState::Ready,
            HandleState::Running,
            HandleState::Stopping,
            HandleState::Stopped { forced: false },
        ];

        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(&pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_terminal_states_never_regress() {
        let terminals = [
            HandleState::Stopped { forced: true },
            HandleState::Failed {
                kind: ErrorKind::PrematureExit,
            },
        ];
        let all = [
            HandleState::Starting,
            HandleState::Ready,
            HandleState::Running,
            HandleState::Stopping,
            HandleState::Stopped { forced: false },
            HandleState::Failed {
                kind: ErrorKind::UnexpectedExit,
            },
        ];

        for terminal in terminals {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(&next));
            }
        }
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!HandleState::Starting.can_transition_to(&HandleState::Running));
        assert!(!HandleState::Starting.can_transition_to(&HandleState::Stopped { forced: false }));
        assert!(!HandleState::Running.can_transition_to(&HandleState::Ready));
        assert!(!HandleState::Stopping.can_transition_to(&HandleState::Failed {
            kind: ErrorKind::UnexpectedExit
        }));
    }

    #[test]
    fn test_readiness_predicates() {
        assert!(HandleState::Ready.is_ready());
        assert!(HandleState::Running.is_ready());
        assert!(!HandleState::Starting.is_ready());
        assert!(HandleState::Starting.expects_process());
        assert!(!HandleState::Stopping.expects_process());
    }

    #[test]
    fn test_display() {
        assert_eq!(ReadinessReason::TimeoutFallback.to_string(), "timeout-fallback");
        assert_eq!(
            serde_json::to_string(&ReadinessReason::MarkerMatched).unwrap(),
            "\"marker-matched\""
        );
        assert_eq!(
            HandleState::Failed {
                kind: ErrorKind::PortConflict
            }
            .to_string(),
            "failed (PortConflict)"
        );
    }
}
