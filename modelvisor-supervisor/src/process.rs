//! Process handle: one spawned server, its diagnostic readers and its exit watcher

use crate::error::{ErrorKind, Result, SupervisorError};
use crate::state::{HandleState, ReadinessReason};
use crate::tail::DiagnosticTail;
use chrono::{DateTime, Utc};
use modelvisor_core::config::SupervisorConfig;
use modelvisor_core::descriptor::Descriptor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lines buffered between the reader tasks and the readiness monitor
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Exit status observed for a supervised process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, absent when terminated by a signal
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Diagnostic lines as they arrive, for the readiness monitor
#[derive(Debug)]
pub struct DiagnosticStream {
    rx: mpsc::Receiver<String>,
}

impl DiagnosticStream {
    /// Next line, or `None` once every output stream reached EOF
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Consistent point-in-time view of a handle
#[derive(Debug, Clone)]
pub struct HandleSnapshot {
    pub model_id: String,
    pub port: u16,
    pub pid: u32,
    pub tier: String,
    pub state: HandleState,
    pub readiness_reason: Option<ReadinessReason>,
    pub readiness_latency: Option<Duration>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub uptime: Option<Duration>,
    pub alive: bool,
}

#[derive(Debug)]
struct HandleStatus {
    state: HandleState,
    readiness_reason: Option<ReadinessReason>,
    readiness_latency: Option<Duration>,
    exit_code: Option<i32>,
}

/// Owns one OS-level server process and its live metadata
#[derive(Debug)]
pub struct ProcessHandle {
    model_id: String,
    port: u16,
    tier: String,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    tail: DiagnosticTail,
    status: RwLock<HandleStatus>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill: Arc<Notify>,
}

impl ProcessHandle {
    /// Spawn the server binary described by `descriptor`.
    ///
    /// Stdout and stderr are drained by background reader tasks into the
    /// diagnostic tail and forwarded on the returned stream. The handle starts in
    /// [`HandleState::Starting`].
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Spawn`] if the binary cannot be executed.
    pub fn start(
        descriptor: &Descriptor,
        config: &SupervisorConfig,
    ) -> Result<(Self, DiagnosticStream)> {
        let args = descriptor.args(&config.bind_host);
        debug!(
            "Spawning {} for {}: {:?}",
            descriptor.binary_path.display(),
            descriptor.model_id,
            args
        );

        let mut cmd = Command::new(&descriptor.binary_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so signals reach helper processes the server forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            binary: descriptor.binary_path.display().to_string(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::Other(anyhow::anyhow!(
                "{} exited before its pid could be read",
                descriptor.model_id
            ))
        })?;

        let tail = DiagnosticTail::new(config.diagnostic_tail_lines, config.max_line_bytes);
        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(
                descriptor.model_id.clone(),
                stdout,
                config.max_line_bytes,
                tail.clone(),
                line_tx.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(
                descriptor.model_id.clone(),
                stderr,
                config.max_line_bytes,
                tail.clone(),
                line_tx.clone(),
            );
        }
        drop(line_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_requested = kill.clone();
        let model_id = descriptor.model_id.clone();

        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_requested.notified() => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        debug!("start_kill for {} failed: {}", model_id, e);
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => exit_info(status),
                Err(e) => {
                    warn!("Failed waiting on {}: {}", model_id, e);
                    ExitInfo::default()
                }
            };
            debug!("{} (pid {}) exited: {}", model_id, pid, exit);
            let _ = exit_tx.send(Some(exit));
        });

        info!(
            "Spawned {} (PID: {}, Port: {}, Tier: {})",
            descriptor.model_id, pid, descriptor.port, descriptor.tier
        );

        let handle = Self {
            model_id: descriptor.model_id.clone(),
            port: descriptor.port,
            tier: descriptor.tier.clone(),
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            tail,
            status: RwLock::new(HandleStatus {
                state: HandleState::Starting,
                readiness_reason: None,
                readiness_latency: None,
                exit_code: None,
            }),
            exit_rx,
            kill,
        };

        Ok((handle, DiagnosticStream { rx: line_rx }))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Instant the process was spawned
    pub fn started_instant(&self) -> Instant {
        self.started
    }

    /// Time since spawn, regardless of state
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn tail(&self) -> &DiagnosticTail {
        &self.tail
    }

    pub async fn state(&self) -> HandleState {
        self.status.read().await.state
    }

    /// Exit status, once the process has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Non-blocking liveness probe. Does not alter state.
    pub fn is_alive(&self) -> bool {
        self.exit_info().is_none() && os_process_exists(self.pid)
    }

    /// Elapsed time since start, defined only while Ready or Running
    pub async fn uptime(&self) -> Option<Duration> {
        let status = self.status.read().await;
        status.state.is_ready().then(|| self.started.elapsed())
    }

    /// Wait until the process exits
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                return (*rx.borrow()).unwrap_or_default();
            }
        }
    }

    /// Wait up to `timeout` for the process to exit
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.wait_exit()).await.ok()
    }

    /// Request graceful termination (SIGTERM). Does not block.
    pub fn signal_terminate(&self) -> Result<()> {
        if self.exit_info().is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGTERM)
        }

        #[cfg(not(unix))]
        {
            self.kill.notify_one();
            Ok(())
        }
    }

    /// Request forceful termination (SIGKILL). Does not block.
    pub fn signal_kill(&self) -> Result<()> {
        if self.exit_info().is_some() {
            return Ok(());
        }

        self.kill.notify_one();

        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGKILL)
        }

        #[cfg(not(unix))]
        {
            Ok(())
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::Other(anyhow::anyhow!(
                "failed to send {:?} to {} (pid {}): {}",
                signal,
                self.model_id,
                self.pid,
                e
            ))),
        }
    }

    /// Consistent snapshot of the handle's metadata
    pub async fn snapshot(&self) -> HandleSnapshot {
        let status = self.status.read().await;
        HandleSnapshot {
            model_id: self.model_id.clone(),
            port: self.port,
            pid: self.pid,
            tier: self.tier.clone(),
            state: status.state,
            readiness_reason: status.readiness_reason,
            readiness_latency: status.readiness_latency,
            exit_code: status.exit_code,
            started_at: self.started_at,
            uptime: status.state.is_ready().then(|| self.started.elapsed()),
            alive: self.is_alive(),
        }
    }

    /// Starting -> Ready
    pub(crate) async fn mark_ready(&self, reason: ReadinessReason, latency: Duration) -> bool {
        let mut status = self.status.write().await;
        if !status.state.can_transition_to(&HandleState::Ready) {
            debug!(
                "{}: ignoring readiness while {}",
                self.model_id, status.state
            );
            return false;
        }
        status.state = HandleState::Ready;
        status.readiness_reason = Some(reason);
        status.readiness_latency = Some(latency);
        true
    }

    pub(crate) async fn mark_failed(&self, kind: ErrorKind, exit_code: Option<i32>) -> bool {
        self.transition(HandleState::Failed { kind }, exit_code).await
    }

    pub(crate) async fn begin_stop(&self) -> bool {
        self.transition(HandleState::Stopping, None).await
    }

    pub(crate) async fn mark_stopped(&self, forced: bool, exit_code: Option<i32>) -> bool {
        self.transition(HandleState::Stopped { forced }, exit_code).await
    }

    /// Promote Ready to Running when alive, or fail a serving handle that died.
    ///
    /// Returns the new state when a transition happened.
    pub(crate) async fn reconcile_liveness(&self) -> Option<HandleState> {
        let mut status = self.status.write().await;
        if !status.state.is_ready() {
            return None;
        }

        if self.is_alive() {
            if status.state == HandleState::Ready {
                status.state = HandleState::Running;
                return Some(HandleState::Running);
            }
            return None;
        }

        let failed = HandleState::Failed {
            kind: ErrorKind::UnexpectedExit,
        };
        status.state = failed;
        status.exit_code = self.exit_info().and_then(|exit| exit.code);
        Some(failed)
    }

    async fn transition(&self, next: HandleState, exit_code: Option<i32>) -> bool {
        let mut status = self.status.write().await;
        if !status.state.can_transition_to(&next) {
            debug!(
                "{}: rejected transition {} -> {}",
                self.model_id, status.state, next
            );
            return false;
        }
        status.state = next;
        if exit_code.is_some() {
            status.exit_code = exit_code;
        }
        true
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_info().is_none() {
            debug!(
                "Dropping live handle for {}; killing PID {}",
                self.model_id, self.pid
            );
            let _ = self.signal_kill();
        }
    }
}

fn spawn_reader<R>(
    model_id: String,
    reader: R,
    max_line_bytes: usize,
    tail: DiagnosticTail,
    lines: mpsc::Sender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        let mut forward = Some(lines);

        loop {
            match read_capped_line(&mut reader, &mut buf, max_line_bytes).await {
                Ok(true) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    trace!(model_id = %model_id, "{}", line);
                    tail.push(line.clone()).await;

                    // The monitor drops its receiver once readiness is decided.
                    if let Some(tx) = &forward {
                        if tx.send(line).await.is_err() {
                            forward = None;
                        }
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    debug!("Diagnostic stream for {} closed: {}", model_id, e);
                    break;
                }
            }
        }
    });
}

/// Read one line into `buf`, keeping at most `max_bytes` of it.
///
/// The remainder of an overlong line is discarded without being buffered.
/// Returns `false` at EOF.
async fn read_capped_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = max_bytes.max(1);
    let read = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await?;

    if read == 0 {
        return Ok(false);
    }

    if read == limit && buf.last() != Some(&b'\n') {
        skip_line(reader).await?;
    }
    Ok(true)
}

async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(newline) => {
                reader.consume(newline + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}

#[cfg(unix)]
fn os_process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn os_process_exists(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_info_display() {
        assert_eq!(
            ExitInfo {
                code: Some(1),
                signal: None
            }
            .to_string(),
            "exit code 1"
        );
        assert_eq!(
            ExitInfo {
                code: None,
                signal: Some(9)
            }
            .to_string(),
            "signal 9"
        );
    }

    #[tokio::test]
    async fn test_overlong_lines_are_capped_while_reading() {
        let mut input = "x".repeat(100_000).into_bytes();
        input.extend_from_slice(b"\nshort line\r\n");
        input.extend_from_slice(&[b'y'; 16]);
        input.extend_from_slice(b"\nno newline at eof");

        let mut reader: &[u8] = &input;
        let mut buf = Vec::new();

        assert!(read_capped_line(&mut reader, &mut buf, 16).await.unwrap());
        assert_eq!(buf, vec![b'x'; 16]);
        assert!(buf.capacity() < 1024);

        assert!(read_capped_line(&mut reader, &mut buf, 16).await.unwrap());
        assert_eq!(buf, b"short line\r\n");

        // exactly at the cap; the newline is skipped, not returned as an empty line
        assert!(read_capped_line(&mut reader, &mut buf, 16).await.unwrap());
        assert_eq!(buf, vec![b'y'; 16]);

        assert!(read_capped_line(&mut reader, &mut buf, 16).await.unwrap());
        assert_eq!(buf, b"no newline at eo");

        assert!(!read_capped_line(&mut reader, &mut buf, 16).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let config = SupervisorConfig::default();
        let descriptor = Descriptor::new(
            "ghost",
            "/nonexistent/llama-server",
            "/models/ghost.gguf",
            18999,
            "small",
        );

        let err = ProcessHandle::start(&descriptor, &config).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_process_lifecycle() {
        let config = SupervisorConfig::default();
        // `echo` prints its arguments, which include the model path.
        let descriptor = Descriptor::new("echo", "echo", "/models/echo.gguf", 18998, "small");

        let (handle, mut stream) = ProcessHandle::start(&descriptor, &config).unwrap();
        assert_eq!(handle.state().await, HandleState::Starting);
        assert!(handle.uptime().await.is_none());

        let line = stream.next_line().await.unwrap();
        assert!(line.contains("/models/echo.gguf"));
        assert!(line.contains("--port 18998"));

        let exit = handle.wait_for_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(!handle.is_alive());
        assert_eq!(handle.tail().len().await, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transitions_are_guarded() {
        let config = SupervisorConfig::default();
        let descriptor = Descriptor::new("echo", "echo", "m.gguf", 18997, "small");
        let (handle, _stream) = ProcessHandle::start(&descriptor, &config).unwrap();

        assert!(handle.mark_ready(ReadinessReason::MarkerMatched, Duration::from_millis(5)).await);
        assert!(handle.uptime().await.is_some());
        assert!(!handle.mark_ready(ReadinessReason::TimeoutFallback, Duration::ZERO).await);
        assert!(handle.begin_stop().await);
        assert!(handle.mark_stopped(false, Some(0)).await);
        assert!(!handle.mark_failed(ErrorKind::UnexpectedExit, None).await);

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.state, HandleState::Stopped { forced: false });
        assert_eq!(snapshot.readiness_reason, Some(ReadinessReason::MarkerMatched));
        assert!(snapshot.uptime.is_none());
    }
}
