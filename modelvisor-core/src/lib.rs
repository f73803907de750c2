//! # Modelvisor Core
//!
//! Shared types for supervising externally launched model servers:
//! - [`Descriptor`](descriptor::Descriptor): the immutable record describing one server process
//! - [`LaunchParams`](descriptor::LaunchParams): command-line parameters derived from a tier
//! - [`SupervisorConfig`](config::SupervisorConfig): binary path, bind policy, timeouts,
//!   readiness markers and tier policies, loaded with figment from TOML and environment
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modelvisor_core::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let config = SupervisorConfig::load()?;
//!     let descriptor = config.descriptor("qwen-7b", "/models/qwen-7b.gguf", 8001, "medium");
//!     println!("{:?}", descriptor.args(&config.bind_host));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod descriptor;
pub mod error;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DEFAULT_READINESS_MARKERS, SupervisorConfig, TierPolicy};
    pub use crate::descriptor::{Descriptor, LaunchParams};
    pub use crate::error::{CoreError, Result};
}
