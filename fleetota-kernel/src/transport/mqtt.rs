/**
 * MQTT TRANSPORT - Mode notify : commande MQTT + attente de la réponse agent
 *
 * FONCTIONNEMENT :
 * - Publie un `AgentCommand` sur `fleetota/agents/{node_id}/command@v1`
 * - L'agent télécharge lui-même le payload puis répond sur `fleetota/agents/reply@v1`
 * - Le listener MQTT du kernel appelle `handle_reply` → oneshot en attente
 * - Une requête abandonnée (timeout orchestrateur) est retirée de la map
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use fleetota_core::topics;
use fleetota_core::wire::{
    AgentCommand, AgentReply, DispatchRequest, DispatchResponse, ReplyBody, RollbackRequest,
    RollbackResponse,
};
use fleetota_core::NodeRecord;

use super::{NodeTransport, TransportError};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ReplyBody>>>>;

pub struct MqttTransport {
    mqtt_client: AsyncClient,
    /// request_id → sender pour la réponse
    pending: PendingMap,
}

/// Retire la requête de la map quand l'appel se termine, y compris sur annulation
struct PendingGuard {
    pending: PendingMap,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

impl MqttTransport {
    pub fn new(mqtt_client: AsyncClient) -> Self {
        Self { mqtt_client, pending: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Traite une réponse agent reçue par le listener MQTT
    pub fn handle_reply(&self, reply: AgentReply) {
        let sender = self.pending.lock().remove(&reply.request_id);
        match sender {
            Some(tx) => {
                if tx.send(reply.body).is_err() {
                    debug!(request_id = %reply.request_id, "reply arrived after caller gave up");
                }
            }
            None => warn!(request_id = %reply.request_id, node_id = %reply.node_id, "reply for unknown request"),
        }
    }

    async fn send_command(&self, node_id: &str, command: AgentCommand) -> Result<ReplyBody, TransportError> {
        let request_id = command.request_id().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard { pending: self.pending.clone(), request_id: request_id.clone() };

        let payload =
            serde_json::to_vec(&command).map_err(|e| TransportError::Decode(e.to_string()))?;
        self.mqtt_client
            .publish(topics::command_topic(node_id), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Unreachable(format!("MQTT publish failed: {e}")))?;
        debug!(node_id, %request_id, "command published");

        rx.await
            .map_err(|_| TransportError::Unreachable("reply channel closed".into()))
    }

    #[cfg(test)]
    fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl NodeTransport for MqttTransport {
    async fn dispatch_update(
        &self,
        node: &NodeRecord,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, TransportError> {
        let command = AgentCommand::Update { request_id: Uuid::new_v4().to_string(), request: request.clone() };
        match self.send_command(&node.node_id, command).await? {
            ReplyBody::Update(resp) => Ok(resp),
            ReplyBody::Rollback(_) => Err(TransportError::Decode("rollback reply to an update command".into())),
        }
    }

    async fn dispatch_rollback(
        &self,
        node: &NodeRecord,
        request: &RollbackRequest,
    ) -> Result<RollbackResponse, TransportError> {
        let command = AgentCommand::Rollback {
            request_id: Uuid::new_v4().to_string(),
            job_id: request.job_id.clone(),
        };
        match self.send_command(&node.node_id, command).await? {
            ReplyBody::Rollback(resp) => Ok(resp),
            ReplyBody::Update(_) => Err(TransportError::Decode("update reply to a rollback command".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetota_core::NodeStatus;
    use rumqttc::MqttOptions;
    use std::time::Duration;

    fn node() -> NodeRecord {
        NodeRecord {
            node_id: "n1".into(),
            hostname: "n1".into(),
            address: "127.0.0.1:8090".into(),
            status: NodeStatus::Online,
            last_seen: time::OffsetDateTime::now_utc(),
            services: vec![],
            drivers: vec![],
            system_info: HashMap::new(),
        }
    }

    async fn wait_pending(transport: &MqttTransport) -> String {
        loop {
            if let Some(id) = transport.pending_ids().into_iter().next() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reply_is_routed_by_request_id() {
        // L'eventloop n'est pas pollée : les publications restent dans le buffer
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let transport = Arc::new(MqttTransport::new(client));

        let t = transport.clone();
        let call = tokio::spawn(async move {
            t.dispatch_rollback(&node(), &RollbackRequest { job_id: "job-1".into() }).await
        });

        let request_id = wait_pending(&transport).await;
        transport.handle_reply(AgentReply {
            request_id,
            node_id: "n1".into(),
            body: ReplyBody::Rollback(RollbackResponse::ok()),
        });

        let resp = call.await.unwrap().unwrap();
        assert!(resp.success);
        assert!(transport.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_request_is_forgotten() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let transport = MqttTransport::new(client);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            transport.dispatch_rollback(&node(), &RollbackRequest { job_id: "job-1".into() }),
        )
        .await;
        assert!(result.is_err());
        assert!(transport.pending_ids().is_empty());
    }
}
