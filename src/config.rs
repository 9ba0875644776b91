//! Process environment and configuration-file handling.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration, deserialized from an optional TOML file and
/// overridable by CLI flags and the `NETTY_PORT` environment variable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    /// TCP bind port for the viewer endpoint.
    #[serde(default = "default_port")]
    pub port: u16,

    /// I/O worker thread count.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Viewer cap across the whole process.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// HTTP aggregator cap, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Reaper idle-grace threshold, in seconds.
    #[serde(default = "default_idle_grace_seconds")]
    pub idle_grace_seconds: u64,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub adapter: AdapterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            worker_threads: default_worker_threads(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            idle_grace_seconds: default_idle_grace_seconds(),
            session: SessionConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    /// Per-session outbound queue bound, in chunks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdapterConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_analyze_timeout_ms")]
    pub analyze_timeout_ms: u64,
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            analyze_timeout_ms: default_analyze_timeout_ms(),
            target_fps: default_target_fps(),
            gop_size: default_gop_size(),
        }
    }
}

fn default_port() -> u16 {
    8888
}
fn default_worker_threads() -> usize {
    num_cpus_or_four()
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_frame_size() -> usize {
    1024 * 1024
}
fn default_idle_grace_seconds() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    64
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    15_000
}
fn default_analyze_timeout_ms() -> u64 {
    10_000
}
fn default_target_fps() -> u32 {
    25
}
fn default_gop_size() -> u32 {
    25
}

fn num_cpus_or_four() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any key it does not set.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Apply the `NETTY_PORT` environment variable, which historically
    /// names the viewer-endpoint bind port for this relay.
    pub fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("NETTY_PORT") {
            if let Ok(port) = port.parse() {
                self.relay.port = port;
            } else {
                tracing::warn!(value = %port, "NETTY_PORT is not a valid port number, ignoring");
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
        }
    }
}

/// CLI overrides for [`Config`]: CLI flags win over the config file, which
/// wins over defaults.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Override `relay.port`.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override `relay.max-connections`.
    #[arg(long)]
    pub max_connections: Option<usize>,
}

impl CliArgs {
    /// Build the effective configuration: file (if given) → env → CLI.
    pub fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env();

        if let Some(port) = self.port {
            config.relay.port = port;
        }
        if let Some(max_connections) = self.max_connections {
            config.relay.max_connections = max_connections;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8888);
        assert_eq!(config.relay.idle_grace_seconds, 10);
        assert_eq!(config.relay.session.queue_capacity, 64);
        assert_eq!(config.relay.adapter.connect_timeout_ms, 10_000);
        assert_eq!(config.relay.adapter.read_timeout_ms, 15_000);
        assert_eq!(config.relay.adapter.analyze_timeout_ms, 10_000);
        assert_eq!(config.relay.adapter.target_fps, 25);
        assert_eq!(config.relay.adapter.gop_size, 25);
    }

    #[test]
    fn file_overrides_only_what_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[relay]\nport = 9000\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.idle_grace_seconds, 10, "unset keys keep their default");
    }

    #[test]
    fn cli_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[relay]\nport = 9000\n").unwrap();

        let args = CliArgs {
            config: Some(path),
            port: Some(9500),
            max_connections: None,
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.relay.port, 9500);
    }
}
