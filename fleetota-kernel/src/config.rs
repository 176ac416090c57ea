/**
 * CONFIG KERNEL - Chargement de la configuration YAML du coordinateur
 *
 * RÔLE : Lit `kernel.yaml` (ou le chemin de FLEETOTA_KERNEL_CONFIG) et fournit
 * des valeurs par défaut pour chaque section absente.
 *
 * FONCTIONNEMENT : fichier absent, vide ou invalide → config par défaut + warning.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

use fleetota_core::transfer::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SZX};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub mqtt: MqttConf,
    pub data_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub dispatch: DispatchConf,
    pub transfer: TransferConf,
    /// Nœud sans heartbeat depuis ce délai → OFFLINE
    pub node_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

/// Mode de livraison des mises à jour aux nœuds
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// POST direct sur l'API HTTP de l'agent
    Push,
    /// Commande MQTT, l'agent tire le payload lui-même
    Notify,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConf {
    pub transport: TransportKind,
    pub install_timeout_secs: u64,
    pub rollback_timeout_secs: u64,
    pub max_parallel: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConf {
    pub preferred_szx: u8,
    pub max_message_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http: HttpConf::default(),
            mqtt: MqttConf::default(),
            data_dir: PathBuf::from("./data"),
            firmware_dir: PathBuf::from("./firmware"),
            dispatch: DispatchConf::default(),
            transfer: TransferConf::default(),
            node_timeout_secs: 120,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883 }
    }
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self {
            transport: TransportKind::Push,
            install_timeout_secs: 300,
            rollback_timeout_secs: 60,
            max_parallel: 64,
        }
    }
}

impl Default for TransferConf {
    fn default() -> Self {
        Self { preferred_szx: DEFAULT_SZX, max_message_size: DEFAULT_MAX_MESSAGE_SIZE }
    }
}

impl DispatchConf {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEETOTA_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!(path = %path.display(), "pas de fichier de config, usage config par défaut");
        return KernelConfig::default();
    }

    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }

    let mut cfg: KernelConfig = serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), "config invalide: {e}");
        KernelConfig::default()
    });

    if cfg.transfer.preferred_szx > fleetota_core::transfer::MAX_SZX {
        warn!(szx = cfg.transfer.preferred_szx, "transfer.preferred_szx hors bornes, retour à {DEFAULT_SZX}");
        cfg.transfer.preferred_szx = DEFAULT_SZX;
    }
    if cfg.dispatch.max_parallel == 0 {
        cfg.dispatch.max_parallel = 1;
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let cfg = load_config_from(Path::new("/nonexistent/kernel.yaml")).await;
        assert_eq!(cfg.dispatch.install_timeout_secs, 300);
        assert_eq!(cfg.dispatch.rollback_timeout_secs, 60);
        assert_eq!(cfg.dispatch.transport, TransportKind::Push);
        assert_eq!(cfg.transfer.preferred_szx, 6);
    }

    #[tokio::test]
    async fn test_partial_yaml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        tokio::fs::write(
            &path,
            "dispatch:\n  transport: notify\n  max_parallel: 0\ntransfer:\n  preferred_szx: 9\n",
        )
        .await
        .unwrap();

        let cfg = load_config_from(&path).await;
        assert_eq!(cfg.dispatch.transport, TransportKind::Notify);
        assert_eq!(cfg.dispatch.max_parallel, 1);
        assert_eq!(cfg.dispatch.install_timeout_secs, 300);
        assert_eq!(cfg.transfer.preferred_szx, 6);
        assert_eq!(cfg.mqtt.port, 1883);
    }

    #[tokio::test]
    async fn test_invalid_yaml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        tokio::fs::write(&path, "http: [not, a, map").await.unwrap();
        let cfg = load_config_from(&path).await;
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    }
}
