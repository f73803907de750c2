//! Supervisor trait and batch outcome types

use crate::error::{ErrorKind, Result, StartFailure};
use crate::lifecycle::StartResult;
use crate::process::HandleSnapshot;
use crate::state::ReadinessReason;
use crate::status::StatusSummary;
use async_trait::async_trait;
use modelvisor_core::descriptor::Descriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Supervisor for model server processes, as seen by the orchestration layer
#[async_trait]
pub trait ModelSupervisor: Send + Sync {
    /// Start every enabled descriptor concurrently
    async fn start_models(&self, descriptors: &[Descriptor]) -> BTreeMap<String, StartOutcome>;

    /// Stop every tracked server concurrently
    async fn stop_models(&self, timeout: Duration) -> BTreeMap<String, StopOutcome>;

    /// Stop one server
    async fn stop_model(&self, model_id: &str, timeout: Duration) -> Result<StopOutcome>;

    /// Current status of every tracked server
    async fn status_summary(&self) -> StatusSummary;

    /// Recent diagnostic output of one server
    async fn diagnostic_tail(&self, model_id: &str) -> Result<Vec<String>>;
}

/// Per-id result of a start request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_reason: Option<ReadinessReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_tail: Option<Vec<String>>,
}

impl StartOutcome {
    /// Report for a start result
    pub async fn from_result(result: &StartResult) -> Self {
        match result {
            Ok(handle) => Self::from_snapshot(&handle.snapshot().await),
            Err(failure) => Self::from_failure(failure),
        }
    }

    pub fn from_snapshot(snapshot: &HandleSnapshot) -> Self {
        Self {
            ok: true,
            pid: Some(snapshot.pid),
            port: snapshot.port,
            readiness_latency_ms: snapshot
                .readiness_latency
                .map(|d| d.as_millis() as u64),
            readiness_reason: snapshot.readiness_reason,
            error_kind: None,
            diagnostic_tail: None,
        }
    }

    pub fn from_failure(failure: &StartFailure) -> Self {
        Self {
            ok: false,
            pid: failure.pid,
            port: failure.port,
            readiness_latency_ms: None,
            readiness_reason: None,
            error_kind: Some(failure.kind),
            diagnostic_tail: Some(failure.diagnostic_tail.clone()),
        }
    }
}

/// Per-id result of a stop request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOutcome {
    /// The process exit was observed
    pub stopped: bool,
    /// Graceful termination timed out and the process was killed
    pub forced: bool,
}
