//! Modelvisor CLI - start, watch and stop a set of model servers

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use modelvisor_core::config::SupervisorConfig;
use modelvisor_core::descriptor::Descriptor;
use modelvisor_supervisor::{LifecycleManager, ModelSupervisor};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "modelvisor")]
#[command(about = "Supervisor for locally launched model servers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every model in a models file and supervise until Ctrl-C
    Run {
        /// JSON array of model entries
        #[arg(short, long)]
        models: PathBuf,

        /// TOML configuration file (defaults to modelvisor.toml and MODELVISOR_* env)
        #[arg(short, long, env = "MODELVISOR_CONFIG_PATH")]
        config: Option<PathBuf>,

        /// How often to log the status summary
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        status_interval: Duration,
    },
    /// Print the resolved configuration
    Config {
        /// TOML configuration file
        #[arg(short, long, env = "MODELVISOR_CONFIG_PATH")]
        config: Option<PathBuf>,
    },
    /// Version information
    Version,
}

/// One entry of the models file
#[derive(Debug, Deserialize)]
struct ModelEntry {
    model_id: String,
    file_path: PathBuf,
    port: u16,
    #[serde(default = "default_tier")]
    tier: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_tier() -> String {
    "medium".to_string()
}

fn default_enabled() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("modelvisor {}", env!("CARGO_PKG_VERSION"));
            println!("modelvisor-core {}", modelvisor_core::VERSION);
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run {
            models,
            config,
            status_interval,
        } => {
            let config = load_config(config.as_deref())?;
            run(&models, config, status_interval).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    let config = match path {
        Some(path) => SupervisorConfig::from_file(path)?,
        None => SupervisorConfig::load()?,
    };
    Ok(config)
}

async fn run(models: &Path, config: SupervisorConfig, status_interval: Duration) -> Result<()> {
    let raw = std::fs::read_to_string(models)
        .with_context(|| format!("Failed to read models file {}", models.display()))?;
    let descriptors = parse_models(&raw, &config)?;
    let shutdown_timeout = config.shutdown_timeout;

    let manager = LifecycleManager::new(config)?;
    let started = manager.start_models(&descriptors).await;
    println!("{}", serde_json::to_string_pretty(&started)?);

    let failed = started.values().filter(|o| !o.ok).count();
    if failed > 0 {
        warn!("{} of {} models failed to start", failed, started.len());
    }

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = manager.status_summary().await;
                info!(
                    "{} servers tracked, {} ready, {} running",
                    summary.total, summary.ready, summary.running
                );
                for server in summary.servers.iter().filter(|s| !s.is_running) {
                    warn!(
                        "{} on port {} is {} ({:?})",
                        server.model_id, server.port, server.state, server.error_kind
                    );
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
        }
    }

    let stopped = manager.stop_models(shutdown_timeout).await;
    println!("{}", serde_json::to_string_pretty(&stopped)?);
    Ok(())
}

/// Build descriptors from the models file, rejecting duplicate ids
fn parse_models(raw: &str, config: &SupervisorConfig) -> Result<Vec<Descriptor>> {
    let entries: Vec<ModelEntry> =
        serde_json::from_str(raw).context("Models file is not a JSON array of model entries")?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(entries.len());

    for entry in entries {
        if !seen.insert(entry.model_id.clone()) {
            bail!("Duplicate model_id in models file: {}", entry.model_id);
        }

        let descriptor = config.descriptor(entry.model_id, entry.file_path, entry.port, entry.tier);
        descriptors.push(if entry.enabled {
            descriptor
        } else {
            descriptor.disabled()
        });
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_models_applies_tier_params() {
        let config = SupervisorConfig::default();
        let raw = r#"[
            {"model_id": "a", "file_path": "/models/a.gguf", "port": 8001, "tier": "large"},
            {"model_id": "b", "file_path": "/models/b.gguf", "port": 8002, "enabled": false}
        ]"#;

        let descriptors = parse_models(raw, &config).unwrap();
        assert_eq!(descriptors.len(), 2);

        assert_eq!(descriptors[0].binary_path, config.server_binary);
        assert_eq!(descriptors[0].launch_params.batch_size, 1024);
        assert!(descriptors[0].enabled);

        assert_eq!(descriptors[1].tier, "medium");
        assert!(!descriptors[1].enabled);
    }

    #[test]
    fn test_parse_models_rejects_duplicates() {
        let config = SupervisorConfig::default();
        let raw = r#"[
            {"model_id": "a", "file_path": "/models/a.gguf", "port": 8001},
            {"model_id": "a", "file_path": "/models/a2.gguf", "port": 8002}
        ]"#;

        let err = parse_models(raw, &config).unwrap_err();
        assert!(err.to_string().contains("Duplicate model_id"));
    }

    #[test]
    fn test_cli_parses_status_interval() {
        let cli = Cli::try_parse_from([
            "modelvisor",
            "run",
            "--models",
            "models.json",
            "--status-interval",
            "5s",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                status_interval, ..
            } => assert_eq!(status_interval, Duration::from_secs(5)),
            _ => panic!("expected run"),
        }
    }
}
