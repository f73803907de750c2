//! Descriptors for model server processes
//!
//! A [`Descriptor`] is the immutable input record handed to the supervisor by the
//! discovery/profile layer. It names one server process: which binary to run,
//! which model artifact to load, which port to bind and which tier it belongs to.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Launch parameters passed through to the server binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    /// Context window size in tokens
    pub context_size: u32,

    /// CPU thread count (server default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    /// Logical batch size
    pub batch_size: u32,

    /// Physical micro-batch size
    pub ubatch_size: u32,

    /// Number of layers to offload to the GPU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,

    /// Number of parallel decoding slots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<u32>,

    /// Extra arguments appended verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self {
            context_size: 4096,
            threads: None,
            batch_size: 512,
            ubatch_size: 512,
            gpu_layers: None,
            parallel: None,
            extra_args: Vec::new(),
        }
    }
}

impl LaunchParams {
    /// Render the server command line for a model file bound to `bind_host:port`.
    pub fn to_args(&self, file_path: &Path, bind_host: &str, port: u16) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            file_path.display().to_string(),
            "--host".to_string(),
            bind_host.to_string(),
            "--port".to_string(),
            port.to_string(),
            "-c".to_string(),
            self.context_size.to_string(),
            "-b".to_string(),
            self.batch_size.to_string(),
            "-ub".to_string(),
            self.ubatch_size.to_string(),
        ];

        if let Some(threads) = self.threads {
            args.push("-t".to_string());
            args.push(threads.to_string());
        }

        if let Some(layers) = self.gpu_layers {
            args.push("-ngl".to_string());
            args.push(layers.to_string());
        }

        if let Some(parallel) = self.parallel {
            args.push("-np".to_string());
            args.push(parallel.to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Immutable description of one server process to supervise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Unique key for the model
    pub model_id: String,

    /// Server binary to execute
    pub binary_path: PathBuf,

    /// Model artifact passed to the server
    pub file_path: PathBuf,

    /// Port the server binds
    pub port: u16,

    /// Tier label selecting launch parameters and timeouts
    pub tier: String,

    /// Disabled descriptors are never started
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Launch parameters derived from the tier
    #[serde(default)]
    pub launch_params: LaunchParams,
}

fn default_enabled() -> bool {
    true
}

impl Descriptor {
    /// Create an enabled descriptor with default launch parameters
    pub fn new(
        model_id: impl Into<String>,
        binary_path: impl Into<PathBuf>,
        file_path: impl Into<PathBuf>,
        port: u16,
        tier: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            binary_path: binary_path.into(),
            file_path: file_path.into(),
            port,
            tier: tier.into(),
            enabled: true,
            launch_params: LaunchParams::default(),
        }
    }

    /// Replace the launch parameters
    pub fn with_launch_params(mut self, params: LaunchParams) -> Self {
        self.launch_params = params;
        self
    }

    /// Mark the descriptor as disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Full argument vector for the server process
    pub fn args(&self, bind_host: &str) -> Vec<String> {
        self.launch_params
            .to_args(&self.file_path, bind_host, self.port)
    }
}
