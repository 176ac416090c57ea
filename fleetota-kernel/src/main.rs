/**
 * FLEETOTA KERNEL - Point d'entrée du coordinateur de mises à jour OTA
 *
 * RÔLE : Orchestration de tous les modules : config, registre des nœuds,
 * store des jobs, transport (push HTTP ou notify MQTT), firmware, API REST.
 *
 * ARCHITECTURE : API REST + orchestrateur de jobs + listener MQTT (registration,
 * heartbeat, réponses agents) + monitoring des nœuds.
 */

mod config;
mod firmware;
mod health;
mod http;
mod mqtt;
mod orchestrator;
mod registry;
mod store;
mod transport;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, TransportKind};
use crate::firmware::FirmwareCatalog;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::mqtt::MqttRoutes;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::registry::FileNodeRegistry;
use crate::store::{FileJobStore, HealthCheckLog};
use crate::transport::{HttpTransport, MqttTransport, NodeTransport};

/// Rapports de santé conservés par nœud
const HEALTH_HISTORY_PER_NODE: usize = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetota_kernel=info")),
        )
        .init();

    let cfg = load_config().await;

    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", cfg.data_dir.display()))?;
    if let Err(e) = tokio::fs::create_dir_all(&cfg.firmware_dir).await {
        warn!("failed to create firmware dir {}: {e}", cfg.firmware_dir.display());
    }

    // registre des nœuds + store des jobs, avec persistance JSON
    let registry = Arc::new(FileNodeRegistry::new(cfg.data_dir.join("nodes.json")));
    if let Err(e) = registry.load_nodes().await {
        warn!("failed to load nodes: {e}");
    }
    let store = Arc::new(FileJobStore::new(cfg.data_dir.join("jobs.json")));
    store.load_jobs().await.context("failed to load jobs")?;

    let health_checks = Arc::new(HealthCheckLog::new(cfg.data_dir.join("health_checks.json"), HEALTH_HISTORY_PER_NODE));
    if let Err(e) = health_checks.load().await {
        warn!("failed to load health checks: {e}");
    }

    let health_tracker = HealthTracker::new();

    // MQTT : registration / heartbeat toujours, réponses agents en mode notify
    let (mqtt_client, eventloop) = mqtt::create_mqtt_client(&cfg);
    let (transport, mqtt_transport): (Arc<dyn NodeTransport>, Option<Arc<MqttTransport>>) =
        match cfg.dispatch.transport {
            TransportKind::Push => {
                let http = HttpTransport::new(Duration::from_secs(10)).context("failed to build HTTP client")?;
                (Arc::new(http), None)
            }
            TransportKind::Notify => {
                let mqtt = Arc::new(MqttTransport::new(mqtt_client.clone()));
                (mqtt.clone(), Some(mqtt))
            }
        };
    info!(transport = ?cfg.dispatch.transport, "dispatch transport selected");

    mqtt::spawn_mqtt_listener(
        mqtt_client,
        eventloop,
        MqttRoutes { registry: registry.clone(), health_checks: health_checks.clone(), transport: mqtt_transport },
        health_tracker.clone(),
    );

    // démarre le monitoring des nœuds
    FileNodeRegistry::start_node_monitoring(registry.clone(), cfg.node_timeout_secs);

    let orchestrator = Orchestrator::new(
        store,
        registry.clone(),
        transport,
        OrchestratorSettings::from(&cfg.dispatch),
    );

    let api_key = std::env::var("FLEETOTA_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("FLEETOTA_API_KEY not set: every route except /health will answer 401");
    }

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        orchestrator,
        registry,
        firmware: Arc::new(FirmwareCatalog::new(&cfg.firmware_dir, &cfg.transfer)),
        health_tracker,
        health_checks,
        api_key,
        node_timeout_secs: cfg.node_timeout_secs,
    };

    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
