/**
 * NODE REGISTRY - Inventaire des nœuds de la flotte
 *
 * RÔLE : Registration, heartbeat et statut (ONLINE / OFFLINE / UPDATING / ERROR)
 * de chaque nœud, avec persistance JSON.
 *
 * FONCTIONNEMENT :
 * - Trait `NodeRegistry` : contrat minimal vu par l'orchestrateur
 * - `FileNodeRegistry` : map en RwLock + fichier JSON (optionnel pour les tests)
 * - Monitoring périodique : nœud muet depuis `node_timeout_secs` → OFFLINE
 *
 * UTILITÉ :
 * 🎯 Résolution des cibles d'un job (seuls les nœuds ONLINE sont dispatchés)
 * 🎯 Suivi UPDATING pendant une mise à jour, ERROR si le rollback échoue
 */

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fleetota_core::wire::{NodeHeartbeat, NodeRegistration};
use fleetota_core::{NodeRecord, NodeStatus};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(String),
    #[error("registry persistence error: {0}")]
    Persistence(String),
}

/// Vue du registre utilisée par l'orchestrateur
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get_node(&self, node_id: &str) -> Option<NodeRecord>;
    async fn list_nodes(&self) -> Vec<NodeRecord>;
    async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<(), RegistryError>;
    /// `from` → `to` seulement si le nœud est encore dans l'état `from`.
    /// Retourne true si la transition a eu lieu.
    async fn transition(&self, node_id: &str, from: NodeStatus, to: NodeStatus) -> Result<bool, RegistryError>;
}

pub type NodesMap = HashMap<String, NodeRecord>;

pub struct FileNodeRegistry {
    nodes: Arc<RwLock<NodesMap>>,
    data_file: Option<PathBuf>,
}

impl FileNodeRegistry {
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self { nodes: Arc::new(RwLock::new(HashMap::new())), data_file: Some(data_file.into()) }
    }

    /// Registre sans persistance
    pub fn in_memory() -> Self {
        Self { nodes: Arc::new(RwLock::new(HashMap::new())), data_file: None }
    }

    /// Charge les nœuds depuis le fichier JSON de persistance
    pub async fn load_nodes(&self) -> anyhow::Result<()> {
        let Some(path) = &self.data_file else { return Ok(()) };
        if !path.exists() {
            info!(path = %path.display(), "no existing nodes file, starting fresh");
            return Ok(());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let nodes: NodesMap = serde_json::from_str(&content)?;

        let mut map = self.nodes.write().await;
        *map = nodes;
        info!(count = map.len(), path = %path.display(), "loaded nodes");
        Ok(())
    }

    /// Sauvegarde les nœuds dans le fichier JSON
    pub async fn save_nodes(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.data_file else { return Ok(()) };
        let content = {
            let map = self.nodes.read().await;
            serde_json::to_string_pretty(&*map).map_err(|e| RegistryError::Persistence(e.to_string()))?
        };
        tokio::fs::write(path, content)
            .await
            .map_err(|e| RegistryError::Persistence(e.to_string()))
    }

    async fn persist(&self) {
        if let Err(e) = self.save_nodes().await {
            warn!("failed to save nodes: {e}");
        }
    }

    /// Enregistre (ou ré-enregistre) un nœud.
    ///
    /// Un nouveau nœud, ou un nœud OFFLINE, passe ONLINE. UPDATING et ERROR
    /// sont conservés : l'agent se ré-enregistre périodiquement et à chaque
    /// reconnexion MQTT, ce qui ne dit rien de l'issue d'un job ou d'un rollback.
    pub async fn register(&self, msg: NodeRegistration) -> NodeRecord {
        let record = {
            let mut map = self.nodes.write().await;
            let status = match map.get(&msg.node_id).map(|n| n.status) {
                Some(kept @ (NodeStatus::Updating | NodeStatus::Error)) => kept,
                _ => NodeStatus::Online,
            };
            let record = NodeRecord {
                node_id: msg.node_id.clone(),
                hostname: msg.hostname,
                address: msg.address,
                status,
                last_seen: OffsetDateTime::now_utc(),
                services: msg.services,
                drivers: msg.drivers,
                system_info: msg.system_info,
            };
            map.insert(msg.node_id, record.clone());
            record
        };
        self.persist().await;

        info!(
            node_id = %record.node_id,
            hostname = %record.hostname,
            address = %record.address,
            status = %record.status,
            "registered node"
        );
        record
    }

    /// Rafraîchit `last_seen`. Un nœud OFFLINE qui réapparaît repasse ONLINE.
    /// Retourne false pour un nœud inconnu.
    pub async fn heartbeat(&self, msg: NodeHeartbeat) -> bool {
        let mut map = self.nodes.write().await;
        let Some(node) = map.get_mut(&msg.node_id) else {
            debug!(node_id = %msg.node_id, "heartbeat from unknown node");
            return false;
        };

        node.last_seen = OffsetDateTime::now_utc();
        if node.status == NodeStatus::Offline {
            info!(node_id = %msg.node_id, "node back online");
            node.status = NodeStatus::Online;
        }
        if let Some(health) = msg.health {
            if let Ok(value) = serde_json::to_value(&health) {
                node.system_info.insert("health".into(), value);
            }
        }
        true
    }

    /// Passe OFFLINE les nœuds ONLINE muets depuis plus de `timeout`
    pub async fn mark_stale_offline(&self, timeout: Duration) -> Vec<String> {
        let threshold = OffsetDateTime::now_utc() - timeout;
        let mut marked = Vec::new();
        {
            let mut map = self.nodes.write().await;
            for (node_id, node) in map.iter_mut() {
                if node.status == NodeStatus::Online && node.last_seen < threshold {
                    node.status = NodeStatus::Offline;
                    marked.push(node_id.clone());
                }
            }
        }

        if !marked.is_empty() {
            warn!(nodes = ?marked, "marked stale nodes offline");
            self.persist().await;
        }
        marked
    }

    /// Surveille périodiquement les nœuds et marque ceux inactifs comme OFFLINE
    pub fn start_node_monitoring(registry: Arc<FileNodeRegistry>, timeout_secs: u64) {
        info!(timeout_secs, "starting node monitoring");
        let timeout = Duration::from_secs(timeout_secs);
        let period = Duration::from_secs((timeout_secs / 2).clamp(5, 60));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.mark_stale_offline(timeout).await;
            }
        });
    }
}

#[async_trait]
impl NodeRegistry for FileNodeRegistry {
    async fn get_node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(node_id).cloned()
    }

    async fn list_nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<(), RegistryError> {
        {
            let mut map = self.nodes.write().await;
            let node = map.get_mut(node_id).ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
            if node.status != status {
                debug!(node_id, from = %node.status, to = %status, "node status change");
                node.status = status;
            }
        }
        self.persist().await;
        Ok(())
    }

    async fn transition(&self, node_id: &str, from: NodeStatus, to: NodeStatus) -> Result<bool, RegistryError> {
        {
            let mut map = self.nodes.write().await;
            let node = map.get_mut(node_id).ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
            if node.status != from {
                debug!(node_id, status = %node.status, expected = %from, "status transition skipped");
                return Ok(false);
            }
            node.status = to;
        }
        self.persist().await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetota_core::HealthReport;

    fn registration(id: &str) -> NodeRegistration {
        NodeRegistration {
            node_id: id.into(),
            hostname: format!("{id}.lan"),
            address: "10.0.0.5:8090".into(),
            services: vec!["sensor-daemon".into()],
            drivers: vec![],
            system_info: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let reg = FileNodeRegistry::in_memory();
        reg.register(registration("b")).await;
        reg.register(registration("a")).await;

        let node = reg.get_node("a").await.unwrap();
        assert!(node.is_online());
        let ids: Vec<String> = reg.list_nodes().await.into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_set_status_unknown_node() {
        let reg = FileNodeRegistry::in_memory();
        let err = reg.set_status("ghost", NodeStatus::Updating).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_nodes_go_offline_and_come_back() {
        let reg = FileNodeRegistry::in_memory();
        reg.register(registration("a")).await;
        reg.register(registration("b")).await;
        reg.set_status("b", NodeStatus::Updating).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let marked = reg.mark_stale_offline(Duration::ZERO).await;
        assert_eq!(marked, vec!["a".to_string()]);
        assert_eq!(reg.get_node("a").await.unwrap().status, NodeStatus::Offline);
        assert_eq!(reg.get_node("b").await.unwrap().status, NodeStatus::Updating);

        let known = reg
            .heartbeat(NodeHeartbeat { node_id: "a".into(), health: Some(HealthReport::healthy()) })
            .await;
        assert!(known);
        let node = reg.get_node("a").await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert!(node.system_info.contains_key("health"));

        assert!(!reg.heartbeat(NodeHeartbeat { node_id: "zz".into(), health: None }).await);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let reg = FileNodeRegistry::new(&path);
        reg.register(registration("a")).await;
        reg.set_status("a", NodeStatus::Error).await.unwrap();

        let reloaded = FileNodeRegistry::new(&path);
        reloaded.load_nodes().await.unwrap();
        assert_eq!(reloaded.get_node("a").await.unwrap().status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_error_and_updating() {
        let reg = FileNodeRegistry::in_memory();
        reg.register(registration("a")).await;
        reg.register(registration("b")).await;
        reg.register(registration("c")).await;
        reg.set_status("a", NodeStatus::Error).await.unwrap();
        reg.set_status("b", NodeStatus::Updating).await.unwrap();
        reg.set_status("c", NodeStatus::Offline).await.unwrap();

        let mut moved = registration("a");
        moved.address = "10.0.0.9:8090".into();
        let record = reg.register(moved).await;
        assert_eq!(record.status, NodeStatus::Error);
        assert_eq!(reg.get_node("a").await.unwrap().address, "10.0.0.9:8090");

        assert_eq!(reg.register(registration("b")).await.status, NodeStatus::Updating);
        assert_eq!(reg.register(registration("c")).await.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_transition_only_from_expected_status() {
        let reg = FileNodeRegistry::in_memory();
        reg.register(registration("a")).await;
        reg.set_status("a", NodeStatus::Error).await.unwrap();

        assert!(!reg.transition("a", NodeStatus::Updating, NodeStatus::Online).await.unwrap());
        assert_eq!(reg.get_node("a").await.unwrap().status, NodeStatus::Error);

        reg.set_status("a", NodeStatus::Updating).await.unwrap();
        assert!(reg.transition("a", NodeStatus::Updating, NodeStatus::Online).await.unwrap());
        assert_eq!(reg.get_node("a").await.unwrap().status, NodeStatus::Online);

        assert!(reg.transition("ghost", NodeStatus::Updating, NodeStatus::Online).await.is_err());
    }
}
