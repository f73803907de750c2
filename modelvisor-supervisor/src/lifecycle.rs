//! Lifecycle manager: registry ownership, start/stop and per-id serialization

use crate::error::{ErrorKind, Result, StartFailure, SupervisorError};
use crate::process::ProcessHandle;
use crate::readiness::{MarkerSet, ReadinessMonitor, ReadinessOutcome, classify_exit};
use crate::state::HandleState;
use crate::status::{StatusReporter, StatusSummary};
use crate::supervisor::{ModelSupervisor, StartOutcome, StopOutcome};
use async_trait::async_trait;
use futures::future::join_all;
use modelvisor_core::config::SupervisorConfig;
use modelvisor_core::descriptor::Descriptor;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Result of starting one descriptor
pub type StartResult = std::result::Result<Arc<ProcessHandle>, StartFailure>;

/// Tracked handles and the ports they claim
#[derive(Debug, Default)]
pub(crate) struct Registry {
    handles: HashMap<String, Arc<ProcessHandle>>,
    ports: HashMap<u16, String>,
    /// Ports of evicted processes whose exit has not been observed, by pid
    held_ports: HashMap<u16, u32>,
}

impl Registry {
    pub(crate) fn handles(&self) -> Vec<Arc<ProcessHandle>> {
        self.handles.values().cloned().collect()
    }

    fn get(&self, model_id: &str) -> Option<Arc<ProcessHandle>> {
        self.handles.get(model_id).cloned()
    }

    /// Remove `handle` if it is still the registered one, releasing its port
    fn evict(&mut self, handle: &Arc<ProcessHandle>) -> bool {
        let current = match self.handles.get(handle.model_id()) {
            Some(current) if Arc::ptr_eq(current, handle) => current.clone(),
            _ => return false,
        };

        self.handles.remove(current.model_id());
        if self.ports.get(&current.port()).map(String::as_str) == Some(current.model_id()) {
            self.ports.remove(&current.port());
        }
        true
    }

    fn release_port(&mut self, port: u16, model_id: &str) {
        if self.ports.get(&port).map(String::as_str) == Some(model_id) {
            self.ports.remove(&port);
        }
    }
}

/// Owns the registry of supervised processes.
///
/// Operations on different model ids run independently; operations on the same
/// id are serialized, so a stop always happens after an in-flight start for
/// that id has completed. Cloning is cheap and shares the same registry.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    config: Arc<SupervisorConfig>,
    markers: Arc<MarkerSet>,
    registry: Arc<RwLock<Registry>>,
    id_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LifecycleManager {
    /// Create a manager with an empty registry
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            markers: Arc::new(MarkerSet::new(&config.readiness_markers)),
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(Registry::default())),
            id_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Read-only status view over this manager's registry
    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter::new(self.registry.clone())
    }

    /// Tracked handle for a model id
    pub async fn handle(&self, model_id: &str) -> Option<Arc<ProcessHandle>> {
        self.registry.read().await.get(model_id)
    }

    /// Tracked model ids, sorted
    pub async fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().await.handles.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Recent diagnostic output of a tracked handle
    pub async fn logs(&self, model_id: &str) -> Option<Vec<String>> {
        let handle = self.handle(model_id).await?;
        Some(handle.tail().lines().await)
    }

    /// Start one descriptor and wait for readiness.
    ///
    /// Idempotent: a live handle already tracked for the id is returned as-is
    /// without spawning. The work runs on its own task, so dropping the returned
    /// future does not abandon a half-started process.
    pub async fn start_one(&self, descriptor: &Descriptor) -> StartResult {
        let manager = self.clone();
        let owned = descriptor.clone();

        let task = tokio::spawn(async move {
            let _guard = manager.lock_id(&owned.model_id).await;
            manager.start_locked(&owned).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(StartFailure::new(
                &descriptor.model_id,
                descriptor.port,
                ErrorKind::SpawnFailure,
                format!("start task failed: {}", e),
            )),
        }
    }

    /// Start every enabled descriptor concurrently.
    ///
    /// Each entry of the returned map succeeds or fails independently.
    pub async fn start_many(&self, descriptors: &[Descriptor]) -> BTreeMap<String, StartResult> {
        let enabled: Vec<&Descriptor> = descriptors
            .iter()
            .filter(|d| {
                if !d.enabled {
                    debug!("Skipping disabled descriptor {}", d.model_id);
                }
                d.enabled
            })
            .collect();

        info!(
            "Starting {} of {} descriptors",
            enabled.len(),
            descriptors.len()
        );

        let results = join_all(enabled.into_iter().map(|descriptor| async move {
            (descriptor.model_id.clone(), self.start_one(descriptor).await)
        }))
        .await;

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!("{} of {} servers failed to start", failed, results.len());
        }

        results.into_iter().collect()
    }

    /// Two-phase stop of one tracked handle, then eviction.
    ///
    /// Sends a graceful termination signal and waits up to `timeout`; if the
    /// process is still alive it is force-killed and given a short grace period.
    pub async fn stop_one(&self, model_id: &str, timeout: Duration) -> Result<StopOutcome> {
        let manager = self.clone();
        let id = model_id.to_string();

        let task = tokio::spawn(async move {
            let _guard = manager.lock_id(&id).await;
            let handle = manager
                .handle(&id)
                .await
                .ok_or_else(|| SupervisorError::NotFound(id.clone()))?;

            let outcome = manager.stop_handle(&handle, timeout).await;
            manager.evict(&handle).await;
            Ok::<_, SupervisorError>(outcome)
        });

        task.await
            .map_err(|e| SupervisorError::Other(anyhow::Error::from(e)))?
    }

    /// Stop every tracked handle concurrently with the same two-phase policy
    pub async fn stop_all(&self, timeout: Duration) -> BTreeMap<String, StopOutcome> {
        let ids = self.model_ids().await;
        info!("Stopping {} servers", ids.len());

        let results = join_all(ids.into_iter().map(|id| async move {
            let outcome = match self.stop_one(&id, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Stop of {} did not run: {}", id, e);
                    StopOutcome::default()
                }
            };
            (id, outcome)
        }))
        .await;

        results.into_iter().collect()
    }

    /// Stop a tracked handle for the descriptor's id (if any), then start it again
    pub async fn restart_one(&self, descriptor: &Descriptor, timeout: Duration) -> StartResult {
        let manager = self.clone();
        let owned = descriptor.clone();

        let task = tokio::spawn(async move {
            let _guard = manager.lock_id(&owned.model_id).await;
            if let Some(handle) = manager.handle(&owned.model_id).await {
                let outcome = manager.stop_handle(&handle, timeout).await;
                debug!("Restart of {}: stopped {:?}", owned.model_id, outcome);
                manager.evict(&handle).await;
            }
            manager.start_locked(&owned).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(StartFailure::new(
                &descriptor.model_id,
                descriptor.port,
                ErrorKind::SpawnFailure,
                format!("restart task failed: {}", e),
            )),
        }
    }

    /// Liveness sweep over serving handles.
    ///
    /// Ready handles found alive are promoted to Running; Ready or Running
    /// handles whose process is gone become `Failed(UnexpectedExit)`. Returns
    /// the ids that failed.
    pub async fn check_liveness(&self) -> Vec<String> {
        let handles = self.registry.read().await.handles();
        let mut failed = Vec::new();

        for handle in handles {
            match handle.reconcile_liveness().await {
                Some(HandleState::Failed { .. }) => {
                    let exit = handle.exit_info().unwrap_or_default();
                    let last_line = handle.tail().lines().await.pop().unwrap_or_default();
                    error!(
                        "{} (PID: {}) exited unexpectedly ({}); last output: {}",
                        handle.model_id(),
                        handle.pid(),
                        exit,
                        last_line
                    );
                    failed.push(handle.model_id().to_string());
                }
                Some(state) => debug!("{} is {}", handle.model_id(), state),
                None => {}
            }
        }

        failed.sort();
        failed
    }

    /// Status summary after a liveness sweep.
    ///
    /// Terminal handles included in the summary have now been observed by the
    /// caller and are evicted, freeing their ports.
    pub async fn get_status_summary(&self) -> StatusSummary {
        self.check_liveness().await;

        let snapshots = self.status_reporter().snapshots().await;
        let summary = StatusReporter::summarize(
            &snapshots
                .iter()
                .map(|(_, snapshot)| snapshot.clone())
                .collect::<Vec<_>>(),
        );

        for (handle, snapshot) in &snapshots {
            if snapshot.state.is_terminal() && self.evict(handle).await {
                debug!("Evicted {} after reporting {}", handle.model_id(), snapshot.state);
            }
        }

        summary
    }

    async fn lock_id(&self, model_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.id_locks.lock().await;
            locks
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Evict `handle` if it is still registered.
    ///
    /// A process that has not been reaped keeps its port held until the exit
    /// watcher reports the exit.
    async fn evict(&self, handle: &Arc<ProcessHandle>) -> bool {
        let mut registry = self.registry.write().await;
        if !registry.evict(handle) {
            return false;
        }
        if handle.exit_info().is_some() {
            return true;
        }

        warn!(
            "{} (PID: {}) evicted before exiting; port {} stays held until it does",
            handle.model_id(),
            handle.pid(),
            handle.port()
        );
        registry.held_ports.insert(handle.port(), handle.pid());
        drop(registry);

        let registry = self.registry.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let exit = handle.wait_exit().await;
            let mut registry = registry.write().await;
            if registry.held_ports.get(&handle.port()) == Some(&handle.pid()) {
                registry.held_ports.remove(&handle.port());
                info!(
                    "{} (PID: {}) exited ({}); port {} released",
                    handle.model_id(),
                    handle.pid(),
                    exit,
                    handle.port()
                );
            }
        });
        true
    }

    /// Start under the per-id lock
    async fn start_locked(&self, descriptor: &Descriptor) -> StartResult {
        let model_id = descriptor.model_id.as_str();

        if !descriptor.enabled {
            return Err(StartFailure::new(
                model_id,
                descriptor.port,
                ErrorKind::Disabled,
                "descriptor is disabled",
            ));
        }

        if let Some(existing) = self.handle(model_id).await {
            existing.reconcile_liveness().await;
            let state = existing.state().await;
            if !state.is_terminal() {
                debug!("{} already tracked ({}); not spawning", model_id, state);
                return Ok(existing);
            }
            self.evict(&existing).await;
        }

        self.reserve_port(descriptor).await?;

        let (handle, stream) = match ProcessHandle::start(descriptor, &self.config) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to spawn {}: {}", model_id, e);
                self.registry
                    .write()
                    .await
                    .release_port(descriptor.port, model_id);
                return Err(StartFailure::new(
                    model_id,
                    descriptor.port,
                    ErrorKind::SpawnFailure,
                    e.to_string(),
                ));
            }
        };

        let handle = Arc::new(handle);
        self.registry
            .write()
            .await
            .handles
            .insert(model_id.to_string(), handle.clone());

        let monitor = ReadinessMonitor::new(
            self.markers.clone(),
            self.config.startup_timeout_for(&descriptor.tier),
        );

        match monitor.run(&handle, stream).await {
            ReadinessOutcome::Ready { .. } => Ok(handle),
            ReadinessOutcome::Exited { exit } => {
                let diagnostic_tail = handle.tail().lines().await;
                let kind = classify_exit(&diagnostic_tail);
                handle.mark_failed(kind, exit.code).await;
                self.evict(&handle).await;

                error!(
                    "{} exited before becoming ready ({}, {})",
                    model_id, kind, exit
                );

                Err(StartFailure {
                    model_id: model_id.to_string(),
                    port: descriptor.port,
                    kind,
                    pid: Some(handle.pid()),
                    exit_code: exit.code,
                    message: format!("process exited before readiness: {}", exit),
                    diagnostic_tail,
                })
            }
        }
    }

    /// Claim the descriptor's port, failing if another live id holds it
    async fn reserve_port(&self, descriptor: &Descriptor) -> std::result::Result<(), StartFailure> {
        let mut registry = self.registry.write().await;

        if let Some(pid) = registry.held_ports.get(&descriptor.port) {
            warn!(
                "Port {} for {} is still held by unreaped PID {}",
                descriptor.port, descriptor.model_id, pid
            );
            return Err(StartFailure::new(
                &descriptor.model_id,
                descriptor.port,
                ErrorKind::PortConflict,
                format!(
                    "port {} is still held by unreaped PID {}",
                    descriptor.port, pid
                ),
            ));
        }

        if let Some(owner) = registry.ports.get(&descriptor.port).cloned() {
            if owner != descriptor.model_id {
                let stale = match registry.handles.get(&owner) {
                    Some(handle) => handle.state().await.is_terminal(),
                    None => false,
                };

                if !stale {
                    warn!(
                        "Port {} for {} is already claimed by {}",
                        descriptor.port, descriptor.model_id, owner
                    );
                    return Err(StartFailure::new(
                        &descriptor.model_id,
                        descriptor.port,
                        ErrorKind::PortConflict,
                        format!("port {} is already claimed by {}", descriptor.port, owner),
                    ));
                }
            }
        }

        registry
            .ports
            .insert(descriptor.port, descriptor.model_id.clone());
        Ok(())
    }

    /// Two-phase shutdown of one handle; caller holds the per-id lock
    async fn stop_handle(&self, handle: &ProcessHandle, timeout: Duration) -> StopOutcome {
        let model_id = handle.model_id();
        let state = handle.state().await;

        if state.is_terminal() {
            return StopOutcome {
                stopped: true,
                forced: matches!(state, HandleState::Stopped { forced: true }),
            };
        }

        handle.begin_stop().await;

        if let Some(exit) = handle.exit_info() {
            debug!("{} had already exited ({})", model_id, exit);
            handle.mark_stopped(false, exit.code).await;
            return StopOutcome {
                stopped: true,
                forced: false,
            };
        }

        info!("Stopping {} (PID: {})", model_id, handle.pid());
        if let Err(e) = handle.signal_terminate() {
            warn!("Failed to send graceful termination to {}: {}", model_id, e);
        }

        if let Some(exit) = handle.wait_for_exit(timeout).await {
            info!("{} stopped gracefully ({})", model_id, exit);
            handle.mark_stopped(false, exit.code).await;
            return StopOutcome {
                stopped: true,
                forced: false,
            };
        }

        warn!(
            "{} did not exit within {:?} ({}); force killing",
            model_id,
            timeout,
            ErrorKind::ShutdownTimeout
        );
        if let Err(e) = handle.signal_kill() {
            error!("Failed to kill {}: {}", model_id, e);
        }

        let exit = handle.wait_for_exit(self.config.kill_grace).await;
        handle
            .mark_stopped(true, exit.and_then(|exit| exit.code))
            .await;

        match exit {
            Some(exit) => info!("{} killed ({})", model_id, exit),
            None => error!(
                "{} (PID: {}) still not reaped {:?} after kill",
                model_id,
                handle.pid(),
                self.config.kill_grace
            ),
        }

        StopOutcome {
            stopped: exit.is_some(),
            forced: true,
        }
    }
}

#[async_trait]
impl ModelSupervisor for LifecycleManager {
    async fn start_models(&self, descriptors: &[Descriptor]) -> BTreeMap<String, StartOutcome> {
        let mut outcomes = BTreeMap::new();
        for (model_id, result) in self.start_many(descriptors).await {
            outcomes.insert(model_id, StartOutcome::from_result(&result).await);
        }
        outcomes
    }

    async fn stop_models(&self, timeout: Duration) -> BTreeMap<String, StopOutcome> {
        self.stop_all(timeout).await
    }

    async fn stop_model(&self, model_id: &str, timeout: Duration) -> Result<StopOutcome> {
        self.stop_one(model_id, timeout).await
    }

    async fn status_summary(&self) -> StatusSummary {
        self.get_status_summary().await
    }

    async fn diagnostic_tail(&self, model_id: &str) -> Result<Vec<String>> {
        self.logs(model_id)
            .await
            .ok_or_else(|| SupervisorError::NotFound(model_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = SupervisorConfig::default();
        config.readiness_markers.clear();
        assert!(LifecycleManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_disabled_descriptor_is_not_started() {
        let manager = LifecycleManager::new(SupervisorConfig::default()).unwrap();
        let descriptor = Descriptor::new("off", "/bin/true", "m.gguf", 18990, "small").disabled();

        let failure = manager.start_one(&descriptor).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Disabled);

        let results = manager.start_many(&[descriptor]).await;
        assert!(results.is_empty());
        assert!(manager.model_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_reports_spawn_failure() {
        let manager = LifecycleManager::new(SupervisorConfig::default()).unwrap();
        let descriptor = Descriptor::new("ghost", "/nonexistent/server", "m.gguf", 18991, "small");

        let failure = manager.start_one(&descriptor).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::SpawnFailure);
        assert!(manager.handle("ghost").await.is_none());

        // the failed attempt must not keep the port reserved
        assert!(manager.registry.read().await.ports.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_id() {
        let manager = LifecycleManager::new(SupervisorConfig::default()).unwrap();
        let err = manager
            .stop_one("nobody", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
        assert!(manager.stop_all(Duration::from_millis(10)).await.is_empty());
    }

    #[tokio::test]
    async fn test_managers_are_independent() {
        let first = LifecycleManager::new(SupervisorConfig::default()).unwrap();
        let second = LifecycleManager::new(SupervisorConfig::default()).unwrap();

        first
            .registry
            .write()
            .await
            .ports
            .insert(9000, "a".to_string());

        assert!(second.registry.read().await.ports.is_empty());
        assert!(first.clone().registry.read().await.ports.contains_key(&9000));
    }

    #[tokio::test]
    async fn test_held_port_rejects_other_ids() {
        let manager = LifecycleManager::new(SupervisorConfig::default()).unwrap();
        manager.registry.write().await.held_ports.insert(18993, 4242);

        let descriptor = Descriptor::new("b", "/nonexistent/server", "b.gguf", 18993, "small");
        let failure = manager.start_one(&descriptor).await.unwrap_err();

        assert_eq!(failure.kind, ErrorKind::PortConflict);
        assert!(failure.message.contains("4242"));
        assert!(failure.pid.is_none());
        assert!(manager.handle("b").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreaped_process_holds_port_until_exit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let manager = LifecycleManager::new(SupervisorConfig::default()).unwrap();
        let descriptor = Descriptor::new("a", &script, "a.gguf", 18994, "small");
        let (handle, _stream) = ProcessHandle::start(&descriptor, manager.config()).unwrap();
        let handle = Arc::new(handle);
        {
            let mut registry = manager.registry.write().await;
            registry.handles.insert("a".to_string(), handle.clone());
            registry.ports.insert(18994, "a".to_string());
        }

        // evicted while the process is still running
        assert!(manager.evict(&handle).await);
        assert!(manager.handle("a").await.is_none());
        assert_eq!(
            manager.registry.read().await.held_ports.get(&18994),
            Some(&handle.pid())
        );

        let other = Descriptor::new("b", &script, "b.gguf", 18994, "small");
        let failure = manager.start_one(&other).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::PortConflict);

        handle.signal_kill().unwrap();
        handle.wait_for_exit(Duration::from_secs(5)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !manager.registry.read().await.held_ports.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "port never released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(manager.registry.read().await.ports.is_empty());
    }
}
