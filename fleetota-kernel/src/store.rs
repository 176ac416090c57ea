/**
 * JOB STORE - Persistance des jobs de mise à jour et des statuts par nœud
 *
 * RÔLE : Contrat CRUD utilisé par l'orchestrateur + implémentation fichier JSON,
 * plus le journal des health checks remontés par les nœuds.
 *
 * FONCTIONNEMENT :
 * - `update_job_status` horodate `started_at` (IN_PROGRESS) et `completed_at`
 *   (état terminal), puis refuse toute écriture sur un job terminé
 * - `update_node_status` recopie l'état dans `Job.node_statuses` et refuse
 *   une seconde écriture terminale pour le même (nœud, job)
 * - Un seul verrou async : chaque écriture travaille sur une copie, la persiste,
 *   et ne remplace l'état en mémoire qu'une fois le fichier écrit
 * - Au chargement, un job resté PENDING / IN_PROGRESS (coordinateur arrêté en
 *   cours de route) est clôturé FAILED
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleetota_core::{HealthReport, Job, JobStatus, NodeUpdateState, NodeUpdateStatus};

/// Message posé sur les jobs interrompus par un redémarrage
pub const INTERRUPTED_BY_RESTART: &str = "coordinator restarted before the job finished";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} already exists")]
    DuplicateJob(String),
    #[error("job {0} is already completed")]
    JobCompleted(String),
    #[error("no status for node {node_id} in job {job_id}")]
    NodeStatusNotFound { node_id: String, job_id: String },
    #[error("node {node_id} already has a final status in job {job_id}")]
    NodeStatusFinal { node_id: String, job_id: String },
    #[error("store persistence error: {0}")]
    Persistence(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: Job) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError>;
    /// Most recent first
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, StoreError>;
    async fn create_node_status(&self, status: NodeUpdateStatus) -> Result<(), StoreError>;
    async fn update_node_status(
        &self,
        node_id: &str,
        job_id: &str,
        status: NodeUpdateState,
        error: Option<String>,
        health_check_passed: bool,
    ) -> Result<NodeUpdateStatus, StoreError>;
    async fn node_statuses(&self, job_id: &str) -> Result<Vec<NodeUpdateStatus>, StoreError>;
}

/// Écrit `value` en JSON (fichier temporaire + rename)
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Persistence(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| StoreError::Persistence(e.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::Persistence(e.to_string()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    jobs: BTreeMap<String, Job>,
    /// job_id → statuts des nœuds, dans l'ordre de création
    node_statuses: HashMap<String, Vec<NodeUpdateStatus>>,
}

impl StoreData {
    /// Clôture les jobs non terminés, retourne leurs ids
    fn fail_unfinished(&mut self, reason: &str) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        let mut interrupted = Vec::new();

        for job in self.jobs.values_mut().filter(|j| !j.is_terminal()) {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.error_message = Some(reason.to_string());

            if let Some(statuses) = self.node_statuses.get_mut(&job.job_id) {
                for record in statuses.iter_mut().filter(|s| !s.status.is_terminal()) {
                    record.status = NodeUpdateState::Failed;
                    record.completed_at = Some(now);
                    record.error_message = Some(reason.to_string());
                    job.node_statuses.insert(record.node_id.clone(), NodeUpdateState::Failed);
                }
            }
            interrupted.push(job.job_id.clone());
        }
        interrupted
    }
}

pub struct FileJobStore {
    data: Mutex<StoreData>,
    data_file: Option<PathBuf>,
}

impl FileJobStore {
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self { data: Mutex::new(StoreData::default()), data_file: Some(data_file.into()) }
    }

    pub fn in_memory() -> Self {
        Self { data: Mutex::new(StoreData::default()), data_file: None }
    }

    /// Charge les jobs ; ceux qu'un arrêt a laissés en cours passent FAILED
    pub async fn load_jobs(&self) -> anyhow::Result<()> {
        let Some(path) = &self.data_file else { return Ok(()) };
        if !path.exists() {
            info!(path = %path.display(), "no existing jobs file, starting fresh");
            return Ok(());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut loaded: StoreData = serde_json::from_str(&content)?;

        let interrupted = loaded.fail_unfinished(INTERRUPTED_BY_RESTART);
        if !interrupted.is_empty() {
            warn!(jobs = ?interrupted, "closing jobs interrupted by a restart");
            write_json(path, &loaded).await?;
        }

        let mut data = self.data.lock().await;
        *data = loaded;
        info!(count = data.jobs.len(), path = %path.display(), "loaded jobs");
        Ok(())
    }

    /// Persiste `next` puis le substitue à l'état courant
    async fn commit(&self, current: &mut StoreData, next: StoreData) -> Result<(), StoreError> {
        if let Some(path) = &self.data_file {
            write_json(path, &next).await?;
        }
        *current = next;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create_job(&self, job: Job) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        if data.jobs.contains_key(&job.job_id) {
            return Err(StoreError::DuplicateJob(job.job_id));
        }
        let mut next = data.clone();
        next.node_statuses.insert(job.job_id.clone(), Vec::new());
        next.jobs.insert(job.job_id.clone(), job);
        self.commit(&mut data, next).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let data = self.data.lock().await;
        data.jobs.get(job_id).cloned().ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let data = self.data.lock().await;
        let mut jobs: Vec<Job> = data.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let job = next.jobs.get_mut(job_id).ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if job.is_terminal() {
            return Err(StoreError::JobCompleted(job_id.to_string()));
        }

        let now = OffsetDateTime::now_utc();
        job.status = status;
        if status == JobStatus::InProgress && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if status.is_terminal() {
            job.completed_at = Some(now);
        }
        if error.is_some() {
            job.error_message = error;
        }
        debug!(job_id, ?status, "job status updated");

        let updated = job.clone();
        self.commit(&mut data, next).await?;
        Ok(updated)
    }

    async fn create_node_status(&self, status: NodeUpdateStatus) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let job = next
            .jobs
            .get_mut(&status.job_id)
            .ok_or_else(|| StoreError::JobNotFound(status.job_id.clone()))?;
        if job.is_terminal() {
            return Err(StoreError::JobCompleted(status.job_id.clone()));
        }
        job.node_statuses.insert(status.node_id.clone(), status.status);

        next.node_statuses.entry(status.job_id.clone()).or_default().push(status);
        self.commit(&mut data, next).await
    }

    async fn update_node_status(
        &self,
        node_id: &str,
        job_id: &str,
        status: NodeUpdateState,
        error: Option<String>,
        health_check_passed: bool,
    ) -> Result<NodeUpdateStatus, StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let job = next.jobs.get_mut(job_id).ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if job.is_terminal() {
            return Err(StoreError::JobCompleted(job_id.to_string()));
        }
        job.node_statuses.insert(node_id.to_string(), status);

        let not_found = || StoreError::NodeStatusNotFound {
            node_id: node_id.to_string(),
            job_id: job_id.to_string(),
        };
        let record = next
            .node_statuses
            .get_mut(job_id)
            .and_then(|list| list.iter_mut().find(|s| s.node_id == node_id))
            .ok_or_else(not_found)?;

        if record.status.is_terminal() {
            return Err(StoreError::NodeStatusFinal {
                node_id: node_id.to_string(),
                job_id: job_id.to_string(),
            });
        }

        record.status = status;
        if status.is_terminal() {
            record.completed_at = Some(OffsetDateTime::now_utc());
            record.health_check_passed = health_check_passed;
        }
        if error.is_some() {
            record.error_message = error;
        }
        let updated = record.clone();

        self.commit(&mut data, next).await?;
        Ok(updated)
    }

    async fn node_statuses(&self, job_id: &str) -> Result<Vec<NodeUpdateStatus>, StoreError> {
        let data = self.data.lock().await;
        if !data.jobs.contains_key(job_id) {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        Ok(data.node_statuses.get(job_id).cloned().unwrap_or_default())
    }
}

/// Un health check remonté par un nœud (heartbeat MQTT ou POST /health-checks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub node_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub report: HealthReport,
}

/// Historique borné des health checks, par nœud
pub struct HealthCheckLog {
    records: Mutex<BTreeMap<String, VecDeque<HealthCheckRecord>>>,
    data_file: Option<PathBuf>,
    per_node: usize,
}

impl HealthCheckLog {
    pub fn new(data_file: impl Into<PathBuf>, per_node: usize) -> Self {
        Self { records: Mutex::new(BTreeMap::new()), data_file: Some(data_file.into()), per_node: per_node.max(1) }
    }

    pub fn in_memory(per_node: usize) -> Self {
        Self { records: Mutex::new(BTreeMap::new()), data_file: None, per_node: per_node.max(1) }
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        let Some(path) = &self.data_file else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let loaded: BTreeMap<String, VecDeque<HealthCheckRecord>> = serde_json::from_str(&content)?;
        info!(nodes = loaded.len(), path = %path.display(), "loaded health checks");
        *self.records.lock().await = loaded;
        Ok(())
    }

    /// Ajoute un rapport ; au-delà de `per_node` le plus ancien est oublié
    pub async fn record(&self, record: HealthCheckRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let history = next.entry(record.node_id.clone()).or_default();
        history.push_back(record);
        while history.len() > self.per_node {
            history.pop_front();
        }

        if let Some(path) = &self.data_file {
            write_json(path, &next).await?;
        }
        *records = next;
        Ok(())
    }

    /// Plus récents d'abord, filtrés par nœud si demandé
    pub async fn list(&self, node_id: Option<&str>, limit: usize) -> Vec<HealthCheckRecord> {
        let records = self.records.lock().await;
        let mut out: Vec<HealthCheckRecord> = match node_id {
            Some(id) => records.get(id).map(|h| h.iter().cloned().collect()).unwrap_or_default(),
            None => records.values().flat_map(|h| h.iter().cloned()).collect(),
        };
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        out
    }
}
