//! FleetOTA Agent Host - node side of the OTA update system
//!
//! This agent applies updates sent by the FleetOTA kernel:
//! - Auto-discovery and registration via MQTT (and HTTP at startup)
//! - Periodic heartbeat carrying a health report
//! - Transactional update pipeline (backup, fetch, verify, install, health gate, rollback)
//! - HTTP surface for the push transport, MQTT command topic for notify mode

mod backup;
mod capabilities;
mod config;
mod discovery;
mod execution;
mod fetch;
mod health;
mod installer;
mod mqtt;
mod pipeline;
mod server;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, EventLoop};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetota_core::wire::{NodeHeartbeat, NodeRegistration};
use fleetota_core::UpdateType;

use crate::backup::BackupManager;
use crate::capabilities::CapabilityDetector;
use crate::config::AgentConfig;
use crate::discovery::SystemInfo;
use crate::execution::{CommandRunner, SystemCommandRunner};
use crate::fetch::Fetcher;
use crate::health::{HealthChecker, HealthGate};
use crate::installer::{InstallLayout, SystemInstaller};
use crate::mqtt::AgentEvent;
use crate::pipeline::UpdatePipeline;
use crate::server::AgentState;

/// Re-register periodically so a restarted kernel relearns the node
const REGISTRATION_INTERVAL: Duration = Duration::from_secs(300);

/// Main agent state
struct Agent {
    config: AgentConfig,
    system_info: SystemInfo,
    node_id: String,
    address: String,
    update_types: Vec<UpdateType>,
    mqtt_client: AsyncClient,
    http_client: reqwest::Client,
    runner: Arc<dyn CommandRunner>,
    gate: Arc<HealthChecker>,
    pipeline: Arc<UpdatePipeline>,
}

impl Agent {
    /// Create new agent instance
    async fn new(config: AgentConfig) -> Result<(Self, EventLoop)> {
        info!("Initializing FleetOTA Agent Host v{}", env!("CARGO_PKG_VERSION"));

        let system_info = SystemInfo::discover().await.context("Failed to discover system information")?;
        let node_id = config.node.node_id.clone().unwrap_or_else(|| system_info.node_id.clone());
        let address = config
            .node
            .advertise_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", system_info.network.primary_ip, config.http.port));

        for dir in [&config.paths.update_dir, &config.paths.backup_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(
            config.execution.use_sudo,
            Duration::from_secs(config.execution.command_timeout_secs),
        ));
        let gate = Arc::new(HealthChecker::new(runner.clone(), &config.health));
        let installer = Arc::new(SystemInstaller::new(
            runner.clone(),
            InstallLayout::system(system_info.kernel_release.as_deref()),
        ));

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(config.transfer.read_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let fetcher = Fetcher::new(http_client.clone(), config.kernel.api_key.clone(), config.transfer.preferred_szx)
            .with_deadline(Duration::from_secs(config.transfer.fetch_timeout_secs));

        let pipeline = UpdatePipeline::new(
            BackupManager::new(&config.paths.backup_dir),
            fetcher,
            installer,
            gate.clone(),
            &config.paths.update_dir,
        )
        .with_journal_file(config.paths.backup_dir.join("journal.json"));
        if let Err(e) = pipeline.load_journal().await {
            warn!("Failed to load update journal: {}", e);
        }

        let update_types = CapabilityDetector::supported_update_types().await;
        if update_types.is_empty() {
            warn!("No update type is supported on this host, every install will fail");
        }

        let (mqtt_client, eventloop) = mqtt::create_mqtt_client(&config.mqtt, &node_id);

        info!("Agent initialized - ID: {}, Address: {}", node_id, address);

        let agent = Agent {
            config,
            system_info,
            node_id,
            address,
            update_types,
            mqtt_client,
            http_client,
            runner,
            gate,
            pipeline: Arc::new(pipeline),
        };
        Ok((agent, eventloop))
    }

    /// Start agent main loop
    async fn run(self, eventloop: EventLoop) -> Result<()> {
        info!("Starting agent main loop...");

        self.spawn_http_server().await?;
        self.register_http().await;

        let (events_tx, mut events) = mpsc::channel(16);
        let poller = mqtt::spawn_event_loop(self.mqtt_client.clone(), eventloop, self.node_id.clone(), events_tx);

        let mut heartbeat_timer = interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        let mut registration_timer = interval(REGISTRATION_INTERVAL);

        loop {
            tokio::select! {
                _ = heartbeat_timer.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        error!("Failed to send heartbeat: {:#}", e);
                    }
                }

                _ = registration_timer.tick() => {
                    if let Err(e) = self.register().await {
                        error!("Failed to re-register: {:#}", e);
                    }
                }

                event = events.recv() => match event {
                    Some(AgentEvent::Connected) => {
                        if let Err(e) = self.register().await {
                            error!("Failed to register: {:#}", e);
                        }
                    }
                    Some(AgentEvent::Command(command)) => self.spawn_command(command),
                    None => {
                        poller.abort();
                        anyhow::bail!("MQTT event loop stopped");
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down agent");
                    poller.abort();
                    return Ok(());
                }
            }
        }
    }

    /// Commands run off the main loop; the pipeline serialises them
    fn spawn_command(&self, command: fleetota_core::wire::AgentCommand) {
        let pipeline = self.pipeline.clone();
        let client = self.mqtt_client.clone();
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            let reply = mqtt::handle_command(&pipeline, &node_id, command).await;
            if let Err(e) = mqtt::publish_reply(&client, &reply).await {
                error!(request_id = %reply.request_id, "Failed to publish reply: {:#}", e);
            }
        });
    }

    async fn spawn_http_server(&self) -> Result<()> {
        let state = AgentState {
            node_id: self.node_id.clone(),
            pipeline: self.pipeline.clone(),
            gate: self.gate.clone(),
            runner: self.runner.clone(),
            services: self.config.health.services.clone(),
        };
        let app = server::build_router(state);

        let bind = format!("0.0.0.0:{}", self.config.http.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind {bind}"))?;
        info!("Agent API listening on http://{}", bind);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Agent HTTP server failed: {}", e);
            }
        });
        Ok(())
    }

    async fn registration(&self) -> NodeRegistration {
        let mut system_info = HashMap::new();
        system_info.insert("os".to_string(), json!(self.system_info.os));
        system_info.insert("architecture".to_string(), json!(self.system_info.architecture));
        system_info.insert("kernel_release".to_string(), json!(self.system_info.kernel_release));
        system_info.insert("primary_mac".to_string(), json!(self.system_info.network.primary_mac));
        system_info.insert("agent_version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        let update_types: Vec<&str> = self.update_types.iter().map(|t| t.as_str()).collect();
        system_info.insert("update_types".to_string(), json!(update_types));

        NodeRegistration {
            node_id: self.node_id.clone(),
            hostname: self.system_info.hostname.clone(),
            address: self.address.clone(),
            services: self.config.health.services.clone(),
            drivers: capabilities::loaded_modules().await,
            system_info,
        }
    }

    /// Register agent with kernel over MQTT
    async fn register(&self) -> Result<()> {
        let registration = self.registration().await;
        mqtt::publish_registration(&self.mqtt_client, &registration).await?;
        info!("Agent registered");
        Ok(())
    }

    /// Best-effort `POST /nodes/register`, useful before the broker is reachable
    async fn register_http(&self) {
        let url = format!("{}/nodes/register", self.config.kernel.url.trim_end_matches('/'));
        let mut request = self.http_client.post(&url).json(&self.registration().await);
        if let Some(key) = &self.config.kernel.api_key {
            request = request.header("x-api-key", key);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => info!("Registered with kernel at {}", url),
            Ok(response) => warn!("Kernel refused registration: HTTP {}", response.status()),
            Err(e) => warn!("Kernel unreachable at {}: {}", url, e),
        }
    }

    /// Send heartbeat with a fresh health report
    async fn send_heartbeat(&self) -> Result<()> {
        let health = self.gate.check().await;
        let heartbeat = NodeHeartbeat { node_id: self.node_id.clone(), health: Some(health) };
        mqtt::publish_heartbeat(&self.mqtt_client, &heartbeat).await?;
        debug!("Heartbeat sent");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetota_agent_host=info")),
        )
        .init();

    info!("🤖 FleetOTA Agent Host starting...");

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    let (agent, eventloop) = Agent::new(config).await.context("Failed to create agent")?;

    agent.run(eventloop).await.context("Agent execution failed")?;

    Ok(())
}
