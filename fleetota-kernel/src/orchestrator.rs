/**
 * JOB ORCHESTRATOR - Fan-out d'une mise à jour vers les nœuds cibles
 *
 * RÔLE : Crée les jobs, dispatche en parallèle vers chaque nœud, agrège les
 * résultats et déclenche le rollback des nœuds en échec.
 *
 * FONCTIONNEMENT :
 * - `submit` : validation (forme + cibles connues et ONLINE), job PENDING
 *   persisté, exécution lancée en tâche de fond, id retourné immédiatement
 * - `execute` : IN_PROGRESS → dispatch borné (JoinSet + Semaphore) →
 *   SUCCESS si tous les nœuds réussissent, sinon rollback des nœuds en échec
 *   puis FAILED
 * - Chaque tâche de dispatch possède son NodeUpdateStatus : PENDING →
 *   IN_PROGRESS avant l'appel, une seule écriture terminale après
 * - Les nœuds réussis ne sont jamais annulés, même si le job échoue
 *
 * UTILITÉ :
 * 🎯 Mise à jour transactionnelle par nœud, visibilité par job
 * 🎯 Aucune dépendance au transport : push HTTP ou notify MQTT
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use fleetota_core::wire::{DispatchRequest, RollbackRequest};
use fleetota_core::{
    Job, JobStatus, JobView, ModelError, NodeRecord, NodeStatus, NodeUpdateState, NodeUpdateStatus,
    UpdateRequest,
};

use crate::config::DispatchConf;
use crate::registry::{NodeRegistry, RegistryError};
use crate::store::{JobStore, StoreError};
use crate::transport::{NodeTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("no online nodes available")]
    NoTargetsAvailable,
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ModelError> for OrchestratorError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Validation(msg) => OrchestratorError::Validation(msg),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::JobNotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub install_timeout: Duration,
    pub rollback_timeout: Duration,
    pub max_parallel: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&DispatchConf::default())
    }
}

impl From<&DispatchConf> for OrchestratorSettings {
    fn from(conf: &DispatchConf) -> Self {
        Self {
            install_timeout: conf.install_timeout(),
            rollback_timeout: conf.rollback_timeout(),
            max_parallel: conf.max_parallel.max(1),
        }
    }
}

/// Résultat terminal d'un nœud après dispatch
#[derive(Debug)]
struct NodeResult {
    node: NodeRecord,
    succeeded: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { store, registry, transport, settings }
    }

    /// Valide la requête et ses cibles puis persiste un job PENDING
    pub async fn create_job(&self, request: UpdateRequest) -> Result<Job, OrchestratorError> {
        let request = request.validated()?;

        for node_id in &request.target_nodes {
            match self.registry.get_node(node_id).await {
                None => return Err(OrchestratorError::Validation(format!("unknown node: {node_id}"))),
                Some(node) if !node.is_online() => {
                    return Err(OrchestratorError::Validation(format!(
                        "node {node_id} is not online (status: {})",
                        node.status
                    )))
                }
                Some(_) => {}
            }
        }

        let job = Job::new(request);
        self.store.create_job(job.clone()).await?;
        info!(
            job_id = %job.job_id,
            package = %job.request.package_name,
            version = %job.request.package_version,
            update_type = %job.request.update_type,
            targets = job.request.target_nodes.len(),
            "update job created"
        );
        Ok(job)
    }

    /// Crée le job et lance son exécution en tâche de fond
    pub async fn submit(&self, request: UpdateRequest) -> Result<String, OrchestratorError> {
        let job = self.create_job(request).await?;
        let job_id = job.job_id.clone();

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.execute(&job.job_id).await {
                error!(job_id = %job.job_id, "job execution failed: {e}");
            }
        });

        Ok(job_id)
    }

    /// Exécute un job PENDING jusqu'à son état terminal
    pub async fn execute(&self, job_id: &str) -> Result<JobStatus, OrchestratorError> {
        let job = self.store.update_job_status(job_id, JobStatus::InProgress, None).await?;
        info!(job_id, "job started");

        let mut targets = Vec::new();
        for node_id in &job.request.target_nodes {
            match self.registry.get_node(node_id).await {
                Some(node) if node.is_online() => targets.push(node),
                Some(node) => warn!(job_id, node_id = %node_id, status = %node.status, "skipping node that is not online"),
                None => warn!(job_id, node_id = %node_id, "skipping unknown node"),
            }
        }

        if targets.is_empty() {
            let reason = OrchestratorError::NoTargetsAvailable.to_string();
            warn!(job_id, "{reason}");
            self.store.update_job_status(job_id, JobStatus::Failed, Some(reason)).await?;
            return Ok(JobStatus::Failed);
        }

        let results = self.dispatch_all(&job, targets).await;
        let failed: Vec<NodeRecord> =
            results.into_iter().filter(|r| !r.succeeded).map(|r| r.node).collect();

        if failed.is_empty() {
            self.store.update_job_status(job_id, JobStatus::Success, None).await?;
            info!(job_id, "job succeeded on every node");
            return Ok(JobStatus::Success);
        }

        let mut failed_ids: Vec<&str> = failed.iter().map(|n| n.node_id.as_str()).collect();
        failed_ids.sort_unstable();
        let mut message = format!("update failed on: {}", failed_ids.join(", "));
        warn!(job_id, nodes = ?failed_ids, "job failed, rolling back failed nodes");

        let rollback_failures = self.rollback_all(job_id, failed).await;
        if !rollback_failures.is_empty() {
            message.push_str(&format!("; rollback failed on: {}", rollback_failures.join(", ")));
        }

        self.store.update_job_status(job_id, JobStatus::Failed, Some(message)).await?;
        Ok(JobStatus::Failed)
    }

    /// Dispatch concurrent, borné par `max_parallel`
    async fn dispatch_all(&self, job: &Job, targets: Vec<NodeRecord>) -> Vec<NodeResult> {
        let request = Arc::new(DispatchRequest::for_job(job));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel));
        let mut set = JoinSet::new();
        let mut pending: HashMap<String, NodeRecord> = HashMap::new();

        for node in targets {
            pending.insert(node.node_id.clone(), node.clone());
            let this = self.clone();
            let request = request.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                // Permit gardé pendant tout le dispatch du nœud
                let _permit = semaphore.acquire_owned().await;
                let succeeded = this.dispatch_one(&node, &request).await;
                NodeResult { node, succeeded }
            });
        }

        let mut results = Vec::with_capacity(pending.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    pending.remove(&result.node.node_id);
                    results.push(result);
                }
                Err(e) => error!(job_id = %job.job_id, "dispatch task panicked: {e}"),
            }
        }

        // Tâches perdues : comptées en échec
        results.extend(pending.into_values().map(|node| NodeResult { node, succeeded: false }));
        results
    }

    /// Cycle de vie complet d'un nœud : statut, appel distant, écriture terminale
    async fn dispatch_one(&self, node: &NodeRecord, request: &DispatchRequest) -> bool {
        let job_id = request.job_id.as_str();
        let node_id = node.node_id.as_str();

        if let Err(e) = self.store.create_node_status(NodeUpdateStatus::begin(node_id, job_id)).await {
            error!(job_id, node_id, "cannot create node status: {e}");
            return false;
        }
        if let Err(e) = self
            .store
            .update_node_status(node_id, job_id, NodeUpdateState::InProgress, None, false)
            .await
        {
            error!(job_id, node_id, "cannot mark node in progress: {e}");
        }
        if let Err(e) = self.registry.set_status(node_id, NodeStatus::Updating).await {
            warn!(job_id, node_id, "cannot mark node updating: {e}");
        }

        let timeout = self.settings.install_timeout;
        let outcome = match tokio::time::timeout(timeout, self.transport.dispatch_update(node, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let (state, error, health_ok) = match outcome {
            Ok(resp) => {
                let health_ok = resp.health_check_passed.unwrap_or(resp.success);
                if resp.success && health_ok {
                    (NodeUpdateState::Success, None, true)
                } else {
                    let mut msg = resp.error_message.unwrap_or_else(|| "update failed".to_string());
                    if resp.rolled_back {
                        msg.push_str(" (rolled back on node)");
                    }
                    (NodeUpdateState::Failed, Some(msg), health_ok && resp.success)
                }
            }
            Err(e) => (NodeUpdateState::Failed, Some(e.to_string()), false),
        };

        match &error {
            None => info!(job_id, node_id, "node updated"),
            Some(msg) => warn!(job_id, node_id, error = %msg, "node update failed"),
        }

        if let Err(e) = self.store.update_node_status(node_id, job_id, state, error, health_ok).await {
            error!(job_id, node_id, "cannot record node result: {e}");
        }
        // Ne rétablit ONLINE que si personne n'a changé le statut entre-temps
        if let Err(e) = self.registry.transition(node_id, NodeStatus::Updating, NodeStatus::Online).await {
            warn!(job_id, node_id, "cannot restore node status: {e}");
        }

        state == NodeUpdateState::Success
    }

    /// Rollback concurrent des nœuds en échec. Retourne les nœuds dont le rollback a échoué.
    async fn rollback_all(&self, job_id: &str, nodes: Vec<NodeRecord>) -> Vec<String> {
        let request = Arc::new(RollbackRequest { job_id: job_id.to_string() });
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel));
        let mut set = JoinSet::new();

        for node in nodes {
            let this = self.clone();
            let request = request.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let ok = this.rollback_one(&node, &request).await;
                (node.node_id, ok)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((node_id, false)) => failures.push(node_id),
                Err(e) => error!(job_id, "rollback task panicked: {e}"),
            }
        }
        failures.sort();
        failures
    }

    async fn rollback_one(&self, node: &NodeRecord, request: &RollbackRequest) -> bool {
        let job_id = request.job_id.as_str();
        let node_id = node.node_id.as_str();
        let timeout = self.settings.rollback_timeout;

        let result = match tokio::time::timeout(timeout, self.transport.dispatch_rollback(node, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let error = match result {
            Ok(resp) if resp.success => None,
            Ok(resp) => Some(resp.error_message.unwrap_or_else(|| "rollback failed".to_string())),
            Err(e) => Some(e.to_string()),
        };

        match error {
            None => {
                info!(job_id, node_id, "node rolled back");
                true
            }
            Some(msg) => {
                error!(job_id, node_id, error = %msg, "rollback failed");
                if let Err(e) = self.registry.set_status(node_id, NodeStatus::Error).await {
                    warn!(job_id, node_id, "cannot mark node in error: {e}");
                }
                false
            }
        }
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobView, OrchestratorError> {
        Ok(self.store.get_job(job_id).await?.view())
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobView>, OrchestratorError> {
        Ok(self.store.list_jobs().await?.iter().map(Job::view).collect())
    }

    pub async fn node_statuses(&self, job_id: &str) -> Result<Vec<NodeUpdateStatus>, OrchestratorError> {
        Ok(self.store.node_statuses(job_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FileNodeRegistry;
    use crate::store::FileJobStore;
    use async_trait::async_trait;
    use fleetota_core::wire::{DispatchResponse, NodeRegistration, RollbackResponse};
    use fleetota_core::UpdateType;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Comportement scripté par nœud
    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        InstallFails,
        HealthFails,
        Unreachable,
        Hangs,
    }

    #[derive(Default)]
    struct FakeTransport {
        behaviours: HashMap<String, Behaviour>,
        failing_rollbacks: HashSet<String>,
        updates: Mutex<Vec<String>>,
        rollbacks: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn with(behaviours: &[(&str, Behaviour)]) -> Self {
            Self {
                behaviours: behaviours.iter().map(|(id, b)| (id.to_string(), *b)).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl NodeTransport for FakeTransport {
        async fn dispatch_update(
            &self,
            node: &NodeRecord,
            _request: &DispatchRequest,
        ) -> Result<DispatchResponse, TransportError> {
            self.updates.lock().push(node.node_id.clone());
            let behaviour = self.behaviours.get(&node.node_id).copied().unwrap_or(Behaviour::Ok);
            match behaviour {
                Behaviour::Ok => Ok(DispatchResponse {
                    success: true,
                    health_check_passed: Some(true),
                    error_message: None,
                    rolled_back: false,
                }),
                Behaviour::InstallFails => Ok(DispatchResponse {
                    success: false,
                    health_check_passed: Some(false),
                    error_message: Some("service failed to start".into()),
                    rolled_back: true,
                }),
                Behaviour::HealthFails => Ok(DispatchResponse {
                    success: true,
                    health_check_passed: Some(false),
                    error_message: None,
                    rolled_back: false,
                }),
                Behaviour::Unreachable => Err(TransportError::Unreachable("connection refused".into())),
                Behaviour::Hangs => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(TransportError::Unreachable("never".into()))
                }
            }
        }

        async fn dispatch_rollback(
            &self,
            node: &NodeRecord,
            _request: &RollbackRequest,
        ) -> Result<RollbackResponse, TransportError> {
            self.rollbacks.lock().push(node.node_id.clone());
            if self.failing_rollbacks.contains(&node.node_id) {
                Ok(RollbackResponse::failed("no backup"))
            } else {
                Ok(RollbackResponse::ok())
            }
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<FileJobStore>,
        registry: Arc<FileNodeRegistry>,
        transport: Arc<FakeTransport>,
    }

    async fn fixture(nodes: &[&str], transport: FakeTransport) -> Fixture {
        let store = Arc::new(FileJobStore::in_memory());
        let registry = Arc::new(FileNodeRegistry::in_memory());
        for id in nodes {
            registry
                .register(NodeRegistration {
                    node_id: id.to_string(),
                    hostname: id.to_string(),
                    address: format!("{id}:8090"),
                    services: vec![],
                    drivers: vec![],
                    system_info: HashMap::new(),
                })
                .await;
        }
        let transport = Arc::new(transport);
        let settings = OrchestratorSettings {
            install_timeout: Duration::from_millis(200),
            rollback_timeout: Duration::from_millis(200),
            max_parallel: 2,
        };
        let orchestrator =
            Orchestrator::new(store.clone(), registry.clone(), transport.clone(), settings);
        Fixture { orchestrator, store, registry, transport }
    }

    fn request(targets: &[&str]) -> UpdateRequest {
        UpdateRequest {
            update_type: UpdateType::Service,
            package_name: "sensor-daemon".into(),
            package_version: "2.1.0".into(),
            source_locator: "http://kernel:8080/firmware/sensor-daemon.tar.gz".into(),
            checksum: format!("sha256:{}", "ab".repeat(32)),
            target_nodes: targets.iter().map(|s| s.to_string()).collect(),
            description: Some("nightly".into()),
        }
    }

    async fn run(f: &Fixture, targets: &[&str]) -> (Job, Vec<NodeUpdateStatus>) {
        let job = f.orchestrator.create_job(request(targets)).await.unwrap();
        f.orchestrator.execute(&job.job_id).await.unwrap();
        let job = f.store.get_job(&job.job_id).await.unwrap();
        let statuses = f.store.node_statuses(&job.job_id).await.unwrap();
        (job, statuses)
    }

    fn state_of(statuses: &[NodeUpdateStatus], node: &str) -> NodeUpdateState {
        statuses.iter().find(|s| s.node_id == node).map(|s| s.status).unwrap()
    }

    #[tokio::test]
    async fn test_all_nodes_succeed() {
        let f = fixture(&["a", "b", "c"], FakeTransport::default()).await;
        let (job, statuses) = run(&f, &["a", "b", "c"]).await;

        assert_eq!(job.status, JobStatus::Success);
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.status == NodeUpdateState::Success && s.health_check_passed));
        assert!(f.transport.rollbacks.lock().is_empty());
        for id in ["a", "b", "c"] {
            assert_eq!(f.registry.get_node(id).await.unwrap().status, NodeStatus::Online);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_rolls_back_failed_node_only() {
        let transport = FakeTransport::with(&[("b", Behaviour::InstallFails)]);
        let f = fixture(&["a", "b"], transport).await;
        let (job, statuses) = run(&f, &["a", "b"]).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(state_of(&statuses, "a"), NodeUpdateState::Success);
        assert_eq!(state_of(&statuses, "b"), NodeUpdateState::Failed);
        assert_eq!(*f.transport.rollbacks.lock(), vec!["b".to_string()]);
        assert!(job.error_message.unwrap().contains("update failed on: b"));
    }

    #[tokio::test]
    async fn test_every_node_failing_rolls_back_all() {
        let transport = FakeTransport::with(&[
            ("a", Behaviour::Unreachable),
            ("b", Behaviour::HealthFails),
        ]);
        let f = fixture(&["a", "b"], transport).await;
        let (job, statuses) = run(&f, &["a", "b"]).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(statuses.iter().all(|s| s.status == NodeUpdateState::Failed));
        let mut rolled = f.transport.rollbacks.lock().clone();
        rolled.sort();
        assert_eq!(rolled, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let transport = FakeTransport::with(&[("a", Behaviour::Hangs)]);
        let f = fixture(&["a", "b"], transport).await;
        let (job, statuses) = run(&f, &["a", "b"]).await;

        assert_eq!(job.status, JobStatus::Failed);
        let a = statuses.iter().find(|s| s.node_id == "a").unwrap();
        assert_eq!(a.status, NodeUpdateState::Failed);
        assert!(a.error_message.as_deref().unwrap().contains("timed out"));
        assert!(a.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_no_online_nodes() {
        let f = fixture(&["a"], FakeTransport::default()).await;
        let job = f.orchestrator.create_job(request(&["a"])).await.unwrap();
        f.registry.set_status("a", NodeStatus::Offline).await.unwrap();

        let status = f.orchestrator.execute(&job.job_id).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let job = f.store.get_job(&job.job_id).await.unwrap();
        assert_eq!(job.error_message.as_deref(), Some("no online nodes available"));
        assert!(f.store.node_statuses(&job.job_id).await.unwrap().is_empty());
        assert!(f.transport.updates.lock().is_empty());
        assert!(f.transport.rollbacks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_offline_target_rejected_at_submit() {
        let f = fixture(&["a", "b"], FakeTransport::default()).await;
        f.registry.set_status("b", NodeStatus::Offline).await.unwrap();

        let err = f.orchestrator.submit(request(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        let err = f.orchestrator.submit(request(&["zz"])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(f.store.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_failure_marks_node_error() {
        let mut transport = FakeTransport::with(&[("b", Behaviour::InstallFails)]);
        transport.failing_rollbacks.insert("b".into());
        let f = fixture(&["a", "b"], transport).await;
        let (job, _) = run(&f, &["a", "b"]).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("rollback failed on: b"));
        assert_eq!(f.registry.get_node("b").await.unwrap().status, NodeStatus::Error);
        assert_eq!(f.registry.get_node("a").await.unwrap().status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_one_terminal_status_per_dispatched_node() {
        let transport = FakeTransport::with(&[("c", Behaviour::InstallFails), ("e", Behaviour::Unreachable)]);
        let f = fixture(&["a", "b", "c", "d", "e"], transport).await;
        let (job, statuses) = run(&f, &["a", "b", "c", "d", "e"]).await;

        assert_eq!(statuses.len(), 5);
        assert!(statuses.iter().all(|s| s.status.is_terminal() && s.completed_at.is_some()));
        assert_eq!(job.node_statuses.len(), 5);
        assert_eq!(f.transport.updates.lock().len(), 5);

        // Job terminé : plus aucune écriture acceptée
        let err = f
            .store
            .update_node_status("a", &job.job_id, NodeUpdateState::Failed, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::JobCompleted(_)));
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let f = fixture(&["a"], FakeTransport::default()).await;
        let job_id = f.orchestrator.submit(request(&["a"])).await.unwrap();

        let mut status = JobStatus::Pending;
        for _ in 0..100 {
            status = f.orchestrator.get_status(&job_id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Success);
        assert_eq!(f.orchestrator.list_jobs().await.unwrap().len(), 1);
        assert_eq!(f.orchestrator.node_statuses(&job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let f = fixture(&[], FakeTransport::default()).await;
        assert!(matches!(
            f.orchestrator.get_status("missing").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_set_during_dispatch_survives() {
        let f = fixture(&["a"], FakeTransport::with(&[("a", Behaviour::Hangs)])).await;
        let job = f.orchestrator.create_job(request(&["a"])).await.unwrap();

        let orchestrator = f.orchestrator.clone();
        let job_id = job.job_id.clone();
        let running = tokio::spawn(async move { orchestrator.execute(&job_id).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.registry.get_node("a").await.unwrap().status, NodeStatus::Updating);
        // ré-enregistrement périodique de l'agent pendant la mise à jour
        let again = f
            .registry
            .register(NodeRegistration {
                node_id: "a".into(),
                hostname: "a".into(),
                address: "a:8090".into(),
                services: vec![],
                drivers: vec![],
                system_info: HashMap::new(),
            })
            .await;
        assert_eq!(again.status, NodeStatus::Updating);
        f.registry.set_status("a", NodeStatus::Error).await.unwrap();

        assert_eq!(running.await.unwrap().unwrap(), JobStatus::Failed);
        assert_eq!(f.registry.get_node("a").await.unwrap().status, NodeStatus::Error);
    }
}
