/**
 * NODE TRANSPORT - Livraison des commandes de mise à jour aux agents
 *
 * RÔLE : Une seule interface pour l'orchestrateur, deux implémentations :
 * - `HttpTransport` : push, POST direct sur l'agent
 * - `MqttTransport` : notify, commande MQTT corrélée par request_id
 *
 * Les délais (install / rollback) sont appliqués par l'orchestrateur.
 */

pub mod http;
pub mod mqtt;

use async_trait::async_trait;

use fleetota_core::wire::{DispatchRequest, DispatchResponse, RollbackRequest, RollbackResponse};
use fleetota_core::NodeRecord;

pub use self::http::HttpTransport;
pub use self::mqtt::MqttTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("node rejected the request: {0}")]
    Rejected(String),
    #[error("invalid response from node: {0}")]
    Decode(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn dispatch_update(
        &self,
        node: &NodeRecord,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, TransportError>;

    async fn dispatch_rollback(
        &self,
        node: &NodeRecord,
        request: &RollbackRequest,
    ) -> Result<RollbackResponse, TransportError>;
}
