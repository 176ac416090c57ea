use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, error, info, warn};

use fleetota_core::topics;
use fleetota_core::wire::{AgentReply, NodeHeartbeat, NodeRegistration};

use crate::config::KernelConfig;
use crate::health::HealthTracker;
use crate::registry::FileNodeRegistry;
use crate::store::{HealthCheckLog, HealthCheckRecord};
use crate::transport::MqttTransport;

pub fn create_mqtt_client(cfg: &KernelConfig) -> (AsyncClient, EventLoop) {
    let client_id = format!("fleetota-kernel-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let mut opts = MqttOptions::new(client_id, &cfg.mqtt.host, cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// Cibles des messages entrants
#[derive(Clone)]
pub struct MqttRoutes {
    pub registry: Arc<FileNodeRegistry>,
    pub health_checks: Arc<HealthCheckLog>,
    /// Présent seulement en mode notify
    pub transport: Option<Arc<MqttTransport>>,
}

impl MqttRoutes {
    /// Aiguille un message selon son topic
    pub async fn route(&self, topic: &str, payload: &[u8]) {
        match topic {
            topics::REGISTRATION => match serde_json::from_slice::<NodeRegistration>(payload) {
                Ok(msg) => {
                    self.registry.register(msg).await;
                }
                Err(e) => warn!(topic, "invalid registration JSON: {e}"),
            },
            topics::HEARTBEAT => match serde_json::from_slice::<NodeHeartbeat>(payload) {
                Ok(msg) => {
                    let report = msg.health.clone().map(|report| HealthCheckRecord {
                        node_id: msg.node_id.clone(),
                        timestamp: time::OffsetDateTime::now_utc(),
                        report,
                    });
                    // historique seulement pour les nœuds connus
                    if self.registry.heartbeat(msg).await {
                        if let Some(record) = report {
                            if let Err(e) = self.health_checks.record(record).await {
                                warn!("failed to record health check: {e}");
                            }
                        }
                    }
                }
                Err(e) => warn!(topic, "invalid heartbeat JSON: {e}"),
            },
            topics::REPLY => match serde_json::from_slice::<AgentReply>(payload) {
                Ok(reply) => match &self.transport {
                    Some(transport) => transport.handle_reply(reply),
                    None => debug!(request_id = %reply.request_id, "agent reply ignored (push mode)"),
                },
                Err(e) => warn!(topic, "invalid agent reply JSON: {e}"),
            },
            other => debug!(topic = other, "unhandled MQTT topic"),
        }
    }
}

/// Boucle MQTT : (ré)abonnement à chaque connexion puis routage des publications
pub fn spawn_mqtt_listener(client: AsyncClient, mut eventloop: EventLoop, routes: MqttRoutes, health: HealthTracker) {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    health.mark_mqtt_connected();
                    for topic in [topics::REGISTRATION, topics::HEARTBEAT, topics::REPLY] {
                        if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                            error!(topic, "MQTT subscribe failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    routes.route(&p.topic, &p.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT error: {e}");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;

    #[tokio::test]
    async fn test_registration_and_heartbeat_routing() {
        let routes = MqttRoutes {
            registry: Arc::new(FileNodeRegistry::in_memory()),
            health_checks: Arc::new(HealthCheckLog::in_memory(10)),
            transport: None,
        };

        let reg = br#"{"node_id":"n1","hostname":"n1.lan","address":"10.0.0.9:8090"}"#;
        routes.route(topics::REGISTRATION, reg).await;
        assert!(routes.registry.get_node("n1").await.is_some());

        routes.route(topics::HEARTBEAT, br#"{"node_id":"n1"}"#).await;
        routes.route(topics::HEARTBEAT, b"not json").await;
        routes.route("fleetota/other", b"{}").await;
        assert_eq!(routes.registry.list_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_health_is_recorded_for_known_nodes() {
        let routes = MqttRoutes {
            registry: Arc::new(FileNodeRegistry::in_memory()),
            health_checks: Arc::new(HealthCheckLog::in_memory(10)),
            transport: None,
        };
        routes
            .route(topics::REGISTRATION, br#"{"node_id":"n1","hostname":"n1.lan","address":"10.0.0.9:8090"}"#)
            .await;

        let beat = br#"{"node_id":"n1","health":{"healthy":false,"failures":["service nginx inactive"]}}"#;
        routes.route(topics::HEARTBEAT, beat).await;
        routes.route(topics::HEARTBEAT, br#"{"node_id":"ghost","health":{"healthy":true}}"#).await;
        routes.route(topics::HEARTBEAT, br#"{"node_id":"n1"}"#).await;

        let records = routes.health_checks.list(None, 10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_id, "n1");
        assert!(!records[0].report.healthy);
    }
}
