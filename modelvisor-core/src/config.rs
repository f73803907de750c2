//! Configuration types for the supervisor

use crate::descriptor::{Descriptor, LaunchParams};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Readiness markers matched case-insensitively, in priority order
pub const DEFAULT_READINESS_MARKERS: &[&str] = &[
    "server is listening",
    "http server listening",
    "listening on",
    "server started",
    "all slots are idle",
];

/// Per-tier launch and startup policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// How long to wait for a readiness marker before promoting anyway
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Launch parameters for descriptors in this tier
    #[serde(default)]
    pub launch: LaunchParams,
}

/// Main configuration for the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Server binary used when building descriptors from config
    pub server_binary: PathBuf,

    /// Address servers bind to (all interfaces unless overridden)
    pub bind_host: String,

    /// Startup timeout for tiers without a policy
    #[serde(with = "humantime_serde")]
    pub default_startup_timeout: Duration,

    /// Graceful window before a stop escalates to a forced kill
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Bounded wait for OS cleanup after a forced kill
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Number of diagnostic lines retained per process
    pub diagnostic_tail_lines: usize,

    /// Longest diagnostic line kept, in bytes
    pub max_line_bytes: usize,

    /// Case-insensitive substrings that signal readiness
    pub readiness_markers: Vec<String>,

    /// Tier label to policy
    pub tiers: HashMap<String, TierPolicy>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "small".to_string(),
            TierPolicy {
                startup_timeout: Duration::from_secs(60),
                launch: LaunchParams::default(),
            },
        );
        tiers.insert(
            "medium".to_string(),
            TierPolicy {
                startup_timeout: Duration::from_secs(120),
                launch: LaunchParams {
                    context_size: 8192,
                    ..LaunchParams::default()
                },
            },
        );
        tiers.insert(
            "large".to_string(),
            TierPolicy {
                startup_timeout: Duration::from_secs(300),
                launch: LaunchParams {
                    context_size: 8192,
                    batch_size: 1024,
                    ..LaunchParams::default()
                },
            },
        );

        Self {
            server_binary: PathBuf::from("llama-server"),
            bind_host: "0.0.0.0".to_string(),
            default_startup_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(3),
            diagnostic_tail_lines: 200,
            max_line_bytes: 4096,
            readiness_markers: DEFAULT_READINESS_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            tiers,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (modelvisor.toml)
    /// 3. File named by MODELVISOR_CONFIG_PATH
    /// 4. Environment variable overrides (MODELVISOR_*, nested keys split on `__`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or validation fails.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(SupervisorConfig::default()))
            .merge(Toml::file("modelvisor.toml"));

        if let Ok(path) = std::env::var("MODELVISOR_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: SupervisorConfig = figment
            .merge(
                Env::prefixed("MODELVISOR_")
                    .ignore(&["config_path"])
                    .split("__"),
            )
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(CoreError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: SupervisorConfig =
            Figment::from(Serialized::defaults(SupervisorConfig::default()))
                .merge(Toml::file(path))
                .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.server_binary.as_os_str().is_empty() {
            return Err(CoreError::Configuration(
                "server_binary must not be empty".to_string(),
            ));
        }

        if self.readiness_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(CoreError::Configuration(
                "at least one readiness marker is required".to_string(),
            ));
        }

        if self.diagnostic_tail_lines == 0 {
            return Err(CoreError::Configuration(
                "diagnostic_tail_lines must be greater than zero".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(CoreError::Configuration(
                "shutdown_timeout must be greater than zero".to_string(),
            ));
        }

        if self.default_startup_timeout.is_zero() {
            return Err(CoreError::Configuration(
                "default_startup_timeout must be greater than zero".to_string(),
            ));
        }

        for (tier, policy) in &self.tiers {
            if policy.startup_timeout.is_zero() {
                return Err(CoreError::Configuration(format!(
                    "tier '{}' has a zero startup_timeout",
                    tier
                )));
            }
        }

        if is_loopback(&self.bind_host) {
            warn!(
                "bind_host {} is loopback-only; servers will not be reachable from other network contexts",
                self.bind_host
            );
        }

        Ok(())
    }

    /// Startup timeout for a tier, falling back to the default
    pub fn startup_timeout_for(&self, tier: &str) -> Duration {
        self.tiers
            .get(tier)
            .map(|p| p.startup_timeout)
            .unwrap_or(self.default_startup_timeout)
    }

    /// Launch parameters for a tier, falling back to the defaults
    pub fn launch_params_for(&self, tier: &str) -> LaunchParams {
        self.tiers
            .get(tier)
            .map(|p| p.launch.clone())
            .unwrap_or_default()
    }

    /// Build a descriptor using the configured binary and the tier's launch parameters
    pub fn descriptor(
        &self,
        model_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        port: u16,
        tier: impl Into<String>,
    ) -> Descriptor {
        let tier = tier.into();
        let params = self.launch_params_for(&tier);
        Descriptor::new(model_id, self.server_binary.clone(), file_path, port, tier)
            .with_launch_params(params)
    }
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "::1") || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_host, "0.0.0.0");
        assert_eq!(config.default_startup_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_tier_lookup_falls_back() {
        let config = SupervisorConfig::default();
        assert_eq!(config.startup_timeout_for("large"), Duration::from_secs(300));
        assert_eq!(
            config.startup_timeout_for("unknown"),
            config.default_startup_timeout
        );
        assert_eq!(config.launch_params_for("unknown"), LaunchParams::default());
        assert_eq!(config.launch_params_for("medium").context_size, 8192);
    }

    #[test]
    fn test_descriptor_uses_tier_params() {
        let config = SupervisorConfig::default();
        let descriptor = config.descriptor("a", "/models/a.gguf", 8001, "large");
        assert_eq!(descriptor.binary_path, PathBuf::from("llama-server"));
        assert_eq!(descriptor.launch_params.batch_size, 1024);
        assert!(descriptor.enabled);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SupervisorConfig::default();
        config.readiness_markers = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.diagnostic_tail_lines = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.shutdown_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("0.0.0.0"));
    }

    #[test]
    fn test_load_from_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "modelvisor.toml",
                r#"
                server_binary = "/opt/llama/llama-server"
                default_startup_timeout = "90s"

                [tiers.huge]
                startup_timeout = "10m"

                [tiers.huge.launch]
                context_size = 32768
                batch_size = 2048
                ubatch_size = 512
                "#,
            )?;
            jail.set_env("MODELVISOR_SHUTDOWN_TIMEOUT", "20s");

            let config = SupervisorConfig::load().map_err(|e| e.to_string())?;

            assert_eq!(config.server_binary, PathBuf::from("/opt/llama/llama-server"));
            assert_eq!(config.default_startup_timeout, Duration::from_secs(90));
            assert_eq!(config.shutdown_timeout, Duration::from_secs(20));
            assert_eq!(config.startup_timeout_for("huge"), Duration::from_secs(600));
            assert_eq!(config.launch_params_for("huge").context_size, 32768);
            // built-in tiers survive the merge
            assert_eq!(config.startup_timeout_for("small"), Duration::from_secs(60));
            Ok(())
        });
    }

    #[test]
    fn test_from_file_missing() {
        let err = SupervisorConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }
}
