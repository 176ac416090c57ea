//! Agent configuration
//!
//! Handles:
//! - Node identity overrides (id, advertised address)
//! - Kernel and MQTT broker endpoints
//! - Update/backup directories and health gate thresholds
//! - Cross-platform storage (`dirs::config_dir()`), overridable by env

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Env var pointing at an explicit config file
pub const CONFIG_ENV: &str = "FLEETOTA_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub heartbeat_interval_secs: u64,
    pub node: NodeConfig,
    pub kernel: KernelLink,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub paths: PathsConfig,
    pub health: HealthConfig,
    pub execution: ExecutionConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Defaults to the primary MAC without colons
    pub node_id: Option<String>,
    /// `host:port` the kernel uses to reach this agent
    pub advertise_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelLink {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub update_dir: PathBuf,
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// systemd units that must be active after an install
    pub services: Vec<String>,
    /// Optional command line, healthy when it exits 0
    pub script: Option<String>,
    pub cpu_max_percent: f32,
    pub memory_max_percent: f32,
    pub disk_max_percent: f32,
    pub load_max: f64,
    pub network: NetworkCheckConfig,
}

/// DNS, outbound reachability and interface check, off unless enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkCheckConfig {
    pub enabled: bool,
    pub dns_host: String,
    pub ping_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub use_sudo: bool,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Block size exponent proposed to the firmware server; `None` lets the
    /// server pick (and use the small-file fast path)
    pub preferred_szx: Option<u8>,
    /// Whole download, all blocks included
    pub fetch_timeout_secs: u64,
    /// Single request or body read
    pub read_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            node: NodeConfig::default(),
            kernel: KernelLink::default(),
            mqtt: MqttConfig::default(),
            http: HttpConfig::default(),
            paths: PathsConfig::default(),
            health: HealthConfig::default(),
            execution: ExecutionConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for KernelLink {
    fn default() -> Self {
        Self { url: "http://127.0.0.1:8080".to_string(), api_key: None }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { broker_host: "127.0.0.1".to_string(), broker_port: 1883, keep_alive_secs: 60 }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8081 }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            update_dir: PathBuf::from("/opt/node-updates"),
            backup_dir: PathBuf::from("/opt/node-backups"),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            script: None,
            cpu_max_percent: 90.0,
            memory_max_percent: 90.0,
            disk_max_percent: 90.0,
            load_max: 4.0,
            network: NetworkCheckConfig::default(),
        }
    }
}

impl Default for NetworkCheckConfig {
    fn default() -> Self {
        Self { enabled: false, dns_host: "google.com".to_string(), ping_host: "8.8.8.8".to_string() }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { preferred_szx: None, fetch_timeout_secs: 600, read_timeout_secs: 30 }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { use_sudo: false, command_timeout_secs: 300 }
    }
}

impl AgentConfig {
    /// Load config from `FLEETOTA_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        Self::load_from(&config_path).await
    }

    /// Missing file means first start: defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;

        if let Some(szx) = config.transfer.preferred_szx {
            if szx > fleetota_core::transfer::MAX_SZX {
                anyhow::bail!("transfer.preferred_szx must be 0..=6 (got {szx})");
            }
        }
        config.execution.command_timeout_secs = config.execution.command_timeout_secs.max(1);
        config.transfer.fetch_timeout_secs = config.transfer.fetch_timeout_secs.max(1);
        config.transfer.read_timeout_secs = config.transfer.read_timeout_secs.max(1);

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            if !explicit.is_empty() {
                return Ok(PathBuf::from(explicit));
            }
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("fleetota-agent");
        path.push("config.toml");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.http.port, 8081);
        assert_eq!(config.health.cpu_max_percent, 90.0);
        assert!(config.transfer.preferred_szx.is_none());
        assert_eq!(config.transfer.fetch_timeout_secs, 600);
        assert!(!config.health.network.enabled);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
heartbeat_interval_secs = 10

[node]
node_id = "edge-01"

[health]
services = ["ssh", "docker"]

[health.network]
enabled = true

[transfer]
preferred_szx = 4
"#,
        )
        .await
        .unwrap();

        let config = AgentConfig::load_from(&path).await.unwrap();
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.node.node_id.as_deref(), Some("edge-01"));
        assert_eq!(config.health.services, vec!["ssh", "docker"]);
        assert_eq!(config.health.load_max, 4.0);
        assert!(config.health.network.enabled);
        assert_eq!(config.health.network.ping_host, "8.8.8.8");
        assert_eq!(config.transfer.preferred_szx, Some(4));
        assert_eq!(config.transfer.read_timeout_secs, 30);
        assert_eq!(config.mqtt.broker_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_rejects_reserved_szx() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[transfer]\npreferred_szx = 7\n").await.unwrap();
        assert!(AgentConfig::load_from(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let config = AgentConfig::load_from(Path::new("/nonexistent/fleetota.toml")).await.unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
    }
}
