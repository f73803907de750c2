//! Readiness detection from unstructured diagnostic output
//!
//! Servers have no structured readiness protocol, so readiness is inferred from
//! their log lines. The first line containing any configured marker (compared
//! case-insensitively) promotes the handle to Ready. A server that never prints
//! a recognizable marker but is still alive when the tier's startup timeout
//! elapses is promoted anyway (`timeout-fallback`), which trades a small risk of
//! reporting a not-yet-serving server for never hanging on silent builds.

use crate::error::ErrorKind;
use crate::process::{DiagnosticStream, ExitInfo, ProcessHandle};
use crate::state::ReadinessReason;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to keep draining output after an exit, so the tail is complete
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Substrings in diagnostic output that indicate a bind failure
const BIND_FAILURE_PATTERNS: &[&str] = &[
    "address already in use",
    "couldn't bind",
    "could not bind",
    "failed to bind",
    "bind failed",
];

/// Ordered, case-insensitive readiness markers
#[derive(Debug, Clone)]
pub struct MarkerSet {
    markers: Vec<String>,
}

impl MarkerSet {
    /// Build a marker set; blank markers are dropped
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Index of the first marker contained in `line`
    pub fn find(&self, line: &str) -> Option<usize> {
        let line = line.to_lowercase();
        self.markers.iter().position(|m| line.contains(m.as_str()))
    }

    pub fn marker(&self, index: usize) -> Option<&str> {
        self.markers.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Result of monitoring a starting handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The handle transitioned to Ready
    Ready {
        reason: ReadinessReason,
        latency: Duration,
    },
    /// The process exited before readiness was established
    Exited { exit: ExitInfo },
}

/// Decides the Starting -> Ready transition for one handle
#[derive(Debug, Clone)]
pub struct ReadinessMonitor {
    markers: Arc<MarkerSet>,
    startup_timeout: Duration,
}

impl ReadinessMonitor {
    pub fn new(markers: Arc<MarkerSet>, startup_timeout: Duration) -> Self {
        Self {
            markers,
            startup_timeout,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Consume `stream` until the handle is ready or its process exits.
    ///
    /// On a marker match or timeout fallback the handle is moved to Ready before
    /// returning. A premature exit is reported but left for the caller to record.
    pub async fn run(&self, handle: &ProcessHandle, mut stream: DiagnosticStream) -> ReadinessOutcome {
        let deadline = tokio::time::sleep_until(handle.started_instant() + self.startup_timeout);
        tokio::pin!(deadline);
        let mut stream_open = true;

        loop {
            tokio::select! {
                line = stream.next_line(), if stream_open => match line {
                    Some(line) => {
                        if let Some(index) = self.markers.find(&line) {
                            let latency = handle.elapsed();
                            handle.mark_ready(ReadinessReason::MarkerMatched, latency).await;
                            info!(
                                "{} ready after {:?} (marker: {:?})",
                                handle.model_id(),
                                latency,
                                self.markers.marker(index).unwrap_or_default()
                            );
                            return ReadinessOutcome::Ready {
                                reason: ReadinessReason::MarkerMatched,
                                latency,
                            };
                        }
                    }
                    None => {
                        debug!("{}: diagnostic output closed", handle.model_id());
                        stream_open = false;
                    }
                },
                exit = handle.wait_exit() => {
                    drain(&mut stream).await;
                    return ReadinessOutcome::Exited { exit };
                }
                _ = &mut deadline => {
                    if !handle.is_alive() {
                        let exit = handle.wait_exit().await;
                        drain(&mut stream).await;
                        return ReadinessOutcome::Exited { exit };
                    }

                    let latency = handle.elapsed();
                    handle.mark_ready(ReadinessReason::TimeoutFallback, latency).await;
                    warn!(
                        "{}: no readiness marker within {:?}; assuming ready ({})",
                        handle.model_id(),
                        self.startup_timeout,
                        ErrorKind::ReadinessTimeout
                    );
                    return ReadinessOutcome::Ready {
                        reason: ReadinessReason::TimeoutFallback,
                        latency,
                    };
                }
            }
        }
    }
}

async fn drain(stream: &mut DiagnosticStream) {
    let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, async {
        while stream.next_line().await.is_some() {}
    })
    .await;
}

/// Classify a pre-readiness exit from the captured diagnostic tail
pub fn classify_exit(tail: &[String]) -> ErrorKind {
    let bind_failure = tail.iter().any(|line| {
        let line = line.to_lowercase();
        BIND_FAILURE_PATTERNS.iter().any(|p| line.contains(p))
    });

    if bind_failure {
        ErrorKind::PortConflict
    } else {
        ErrorKind::PrematureExit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelvisor_core::config::{DEFAULT_READINESS_MARKERS, SupervisorConfig};
    use modelvisor_core::descriptor::Descriptor;

    #[test]
    fn test_markers_are_case_insensitive_and_ordered() {
        let markers = MarkerSet::new(DEFAULT_READINESS_MARKERS.iter());

        assert_eq!(
            markers.find("main: HTTP Server Is Listening, hostname: 0.0.0.0, port: 8001"),
            Some(0)
        );
        assert_eq!(markers.find("INFO: Listening on 0.0.0.0:8001"), Some(2));
        assert_eq!(markers.find("llama_model_loader: loaded meta data"), None);
    }

    #[test]
    fn test_blank_markers_are_dropped() {
        let markers = MarkerSet::new(["", "  ", "Ready"]);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers.marker(0), Some("ready"));
        assert!(!markers.is_empty());
    }

    #[test]
    fn test_classify_exit() {
        let tail = vec![
            "main: loading model".to_string(),
            "couldn't bind HTTP server socket, hostname: 0.0.0.0, port: 8001".to_string(),
        ];
        assert_eq!(classify_exit(&tail), ErrorKind::PortConflict);

        let tail = vec!["error: failed to load model '/missing.gguf'".to_string()];
        assert_eq!(classify_exit(&tail), ErrorKind::PrematureExit);
        assert_eq!(classify_exit(&[]), ErrorKind::PrematureExit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_premature_exit_is_reported() {
        let config = SupervisorConfig::default();
        // `false` exits immediately with status 1 and prints nothing.
        let descriptor = Descriptor::new("f", "false", "m.gguf", 18996, "small");
        let (handle, stream) = ProcessHandle::start(&descriptor, &config).unwrap();

        let monitor = ReadinessMonitor::new(
            Arc::new(MarkerSet::new(DEFAULT_READINESS_MARKERS.iter())),
            Duration::from_secs(5),
        );

        match monitor.run(&handle, stream).await {
            ReadinessOutcome::Exited { exit } => assert_eq!(exit.code, Some(1)),
            other => panic!("expected exit, got {:?}", other),
        }
    }
}
