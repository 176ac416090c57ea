//! MQTT side of the agent
//!
//! - Registration / heartbeat publishing
//! - Command topic subscription (re-done on every ConnAck)
//! - Notify-mode commands: run them, publish an [`AgentReply`] on the reply topic

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use fleetota_core::topics;
use fleetota_core::wire::{AgentCommand, AgentReply, NodeHeartbeat, NodeRegistration, ReplyBody};
use fleetota_core::DispatchResponse;

use crate::config::MqttConfig;
use crate::pipeline::UpdatePipeline;

/// What the event loop hands to the agent main loop
#[derive(Debug)]
pub enum AgentEvent {
    Connected,
    Command(AgentCommand),
}

pub fn create_mqtt_client(cfg: &MqttConfig, node_id: &str) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(format!("fleetota-agent-{node_id}"), &cfg.broker_host, cfg.broker_port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    AsyncClient::new(options, 32)
}

/// Polls the connection forever, forwarding connections and commands
pub fn spawn_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    node_id: String,
    events: mpsc::Sender<AgentEvent>,
) -> tokio::task::JoinHandle<()> {
    let command_topic = topics::command_topic(&node_id);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    if let Err(e) = client.subscribe(&command_topic, QoS::AtLeastOnce).await {
                        error!("Failed to subscribe to {}: {}", command_topic, e);
                    }
                    if events.send(AgentEvent::Connected).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!("Received MQTT message on topic: {}", publish.topic);
                    if publish.topic != command_topic {
                        continue;
                    }
                    match serde_json::from_slice::<AgentCommand>(&publish.payload) {
                        Ok(command) => {
                            if events.send(AgentEvent::Command(command)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Invalid command payload: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    })
}

/// Runs one notify-mode command to completion
pub async fn handle_command(pipeline: &UpdatePipeline, node_id: &str, command: AgentCommand) -> AgentReply {
    let request_id = command.request_id().to_string();
    let body = match command {
        AgentCommand::Update { request, .. } => {
            info!(job_id = %request.job_id, request_id = %request_id, "Received update command");
            ReplyBody::Update(DispatchResponse::from(pipeline.install_update(&request).await))
        }
        AgentCommand::Rollback { job_id, .. } => {
            info!(job_id = %job_id, request_id = %request_id, "Received rollback command");
            ReplyBody::Rollback(pipeline.rollback(&job_id).await)
        }
    };
    AgentReply { request_id, node_id: node_id.to_string(), body }
}

pub async fn publish_reply(client: &AsyncClient, reply: &AgentReply) -> Result<()> {
    let payload = serde_json::to_vec(reply).context("Failed to serialize reply")?;
    client
        .publish(topics::REPLY, QoS::AtLeastOnce, false, payload)
        .await
        .context("Failed to publish reply")?;
    Ok(())
}

pub async fn publish_registration(client: &AsyncClient, registration: &NodeRegistration) -> Result<()> {
    let payload = serde_json::to_vec(registration).context("Failed to serialize registration message")?;
    client
        .publish(topics::REGISTRATION, QoS::AtLeastOnce, false, payload)
        .await
        .context("Failed to publish registration")?;
    Ok(())
}

pub async fn publish_heartbeat(client: &AsyncClient, heartbeat: &NodeHeartbeat) -> Result<()> {
    let payload = serde_json::to_vec(heartbeat).context("Failed to serialize heartbeat message")?;
    client
        .publish(topics::HEARTBEAT, QoS::AtMostOnce, false, payload)
        .await
        .context("Failed to publish heartbeat")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::fetch::Fetcher;
    use crate::health::HealthGate;
    use crate::installer::{InstallError, Installer};
    use async_trait::async_trait;
    use fleetota_core::{DispatchRequest, HealthReport, UpdateType};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    struct NoopInstaller;

    #[async_trait]
    impl Installer for NoopInstaller {
        fn owned_paths(&self, _request: &DispatchRequest) -> Vec<PathBuf> {
            Vec::new()
        }
        async fn install(&self, _request: &DispatchRequest, _artifact: &Path) -> Result<(), InstallError> {
            Ok(())
        }
        async fn quiesce(&self, _request: &DispatchRequest) -> Result<(), InstallError> {
            Ok(())
        }
        async fn resume(&self, _request: &DispatchRequest) -> Result<(), InstallError> {
            Ok(())
        }
    }

    struct Unhealthy;

    #[async_trait]
    impl HealthGate for Unhealthy {
        async fn check(&self) -> HealthReport {
            HealthReport::unhealthy("load average 9.00 >= 4.00")
        }
    }

    #[tokio::test]
    async fn test_commands_produce_correlated_replies() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("htop.deb");
        tokio::fs::write(&artifact, b"deb").await.unwrap();
        let pipeline = UpdatePipeline::new(
            BackupManager::new(dir.path().join("backups")),
            Fetcher::new(reqwest::Client::new(), None, None),
            Arc::new(NoopInstaller),
            Arc::new(Unhealthy),
            dir.path().join("updates"),
        );

        let update = AgentCommand::Update {
            request_id: "r-1".into(),
            request: DispatchRequest {
                job_id: "job-1".into(),
                update_type: UpdateType::Package,
                package_name: "htop".into(),
                package_version: "3.3".into(),
                source_locator: format!("file://{}", artifact.display()),
                checksum: fleetota_core::Checksum::of_bytes(fleetota_core::DigestAlgorithm::Sha256, b"deb")
                    .to_string(),
                description: None,
            },
        };
        let reply = handle_command(&pipeline, "node-a", update).await;
        assert_eq!(reply.request_id, "r-1");
        assert_eq!(reply.node_id, "node-a");
        match reply.body {
            ReplyBody::Update(resp) => {
                assert!(!resp.success);
                assert!(resp.rolled_back);
                assert_eq!(resp.health_check_passed, Some(false));
            }
            other => panic!("unexpected reply {other:?}"),
        }

        let rollback = AgentCommand::Rollback { request_id: "r-2".into(), job_id: "job-1".into() };
        let reply = handle_command(&pipeline, "node-a", rollback).await;
        assert_eq!(reply.request_id, "r-2");
        assert!(matches!(reply.body, ReplyBody::Rollback(ref r) if r.success));
    }
}
