//! Read-only status snapshots of the registry

use crate::error::ErrorKind;
use crate::lifecycle::Registry;
use crate::process::{HandleSnapshot, ProcessHandle};
use crate::state::{HandleState, ReadinessReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Status of one tracked server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub model_id: String,
    pub port: u16,
    pub pid: u32,
    pub state: String,
    pub is_ready: bool,
    pub is_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub tier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_reason: Option<ReadinessReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub started_at: DateTime<Utc>,
}

impl From<&HandleSnapshot> for ServerStatus {
    fn from(snapshot: &HandleSnapshot) -> Self {
        let error_kind = match snapshot.state {
            HandleState::Failed { kind } => Some(kind),
            _ => None,
        };

        Self {
            model_id: snapshot.model_id.clone(),
            port: snapshot.port,
            pid: snapshot.pid,
            state: snapshot.state.as_str().to_string(),
            is_ready: snapshot.state.is_ready(),
            is_running: snapshot.alive && snapshot.state.expects_process(),
            uptime_seconds: snapshot.uptime.map(|d| d.as_secs()),
            tier: snapshot.tier.clone(),
            readiness_reason: snapshot.readiness_reason,
            error_kind,
            started_at: snapshot.started_at,
        }
    }
}

/// Aggregate status of every tracked server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub ready: usize,
    pub running: usize,
    pub servers: Vec<ServerStatus>,
}

impl StatusSummary {
    /// Entry for one model id
    pub fn server(&self, model_id: &str) -> Option<&ServerStatus> {
        self.servers.iter().find(|s| s.model_id == model_id)
    }
}

/// Produces status summaries without mutating the registry
#[derive(Debug, Clone)]
pub struct StatusReporter {
    registry: Arc<RwLock<Registry>>,
}

impl StatusReporter {
    pub(crate) fn new(registry: Arc<RwLock<Registry>>) -> Self {
        Self { registry }
    }

    /// Snapshot every tracked handle.
    ///
    /// The registry lock is held only long enough to copy the handle list, so
    /// in-flight starts and stops are never blocked by a status read.
    pub async fn snapshots(&self) -> Vec<(Arc<ProcessHandle>, HandleSnapshot)> {
        let handles = self.registry.read().await.handles();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let snapshot = handle.snapshot().await;
            snapshots.push((handle, snapshot));
        }
        snapshots
    }

    /// Current summary
    pub async fn get_summary(&self) -> StatusSummary {
        let snapshots: Vec<HandleSnapshot> = self
            .snapshots()
            .await
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .collect();
        Self::summarize(&snapshots)
    }

    /// Summarize a set of snapshots, ordered by model id
    pub fn summarize(snapshots: &[HandleSnapshot]) -> StatusSummary {
        let mut servers: Vec<ServerStatus> = snapshots.iter().map(ServerStatus::from).collect();
        servers.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        StatusSummary {
            total: servers.len(),
            ready: servers.iter().filter(|s| s.is_ready).count(),
            running: servers.iter().filter(|s| s.is_running).count(),
            servers,
        }
    }
}
