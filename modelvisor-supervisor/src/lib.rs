//! Modelvisor Supervisor - process lifecycle management for model servers
//!
//! Starts many externally launched server processes concurrently, decides when
//! each one is reachable by watching its diagnostic output, and shuts them down
//! with a graceful signal that escalates to a forced kill.
//!
//! ## Components
//!
//! - [`ProcessHandle`]: one spawned server with its pid, state, diagnostic tail and exit watcher
//! - [`ReadinessMonitor`]: drives the Starting -> Ready transition from log markers or a timeout
//! - [`LifecycleManager`]: the registry owner, with per-id serialized start/stop and batch concurrency
//! - [`StatusReporter`]: consistent, read-only status snapshots
//!
//! ## Example
//!
//! ```rust,no_run
//! use modelvisor_core::prelude::*;
//! use modelvisor_supervisor::LifecycleManager;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SupervisorConfig::load()?;
//!     let descriptors = vec![
//!         config.descriptor("a", "/models/a.gguf", 8001, "small"),
//!         config.descriptor("b", "/models/b.gguf", 8002, "large"),
//!     ];
//!
//!     let manager = LifecycleManager::new(config)?;
//!     for (model_id, result) in manager.start_many(&descriptors).await {
//!         match result {
//!             Ok(handle) => println!("{} ready on port {}", model_id, handle.port()),
//!             Err(failure) => println!("{} failed: {}", model_id, failure),
//!         }
//!     }
//!
//!     println!("{:?}", manager.get_status_summary().await);
//!     manager.stop_all(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

mod error;
mod lifecycle;
mod process;
mod readiness;
mod state;
mod status;
mod supervisor;
mod tail;

pub use error::{ErrorKind, Result, StartFailure, SupervisorError};
pub use lifecycle::{LifecycleManager, StartResult};
pub use process::{DiagnosticStream, ExitInfo, HandleSnapshot, ProcessHandle};
pub use readiness::{MarkerSet, ReadinessMonitor, ReadinessOutcome, classify_exit};
pub use state::{HandleState, ReadinessReason};
pub use status::{ServerStatus, StatusReporter, StatusSummary};
pub use supervisor::{ModelSupervisor, StartOutcome, StopOutcome};
pub use tail::DiagnosticTail;
