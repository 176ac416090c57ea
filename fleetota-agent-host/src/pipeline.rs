//! Transactional update pipeline of a node
//!
//! `install_update` runs backup → fetch → verify → install → health gate and
//! either commits (backup discarded) or restores the backup. Runs and rollback
//! commands are serialised behind one async mutex that also guards the job
//! journal, so two updates never interleave on a node.
//!
//! The journal remembers what happened to every job so a later
//! `rollback(job_id)` from the kernel can be answered:
//! - never touched the system / already rolled back: nothing to do
//! - committed: backup is gone, refused
//! - committed after the requester went away: backup kept, restored now
//! - rollback failed during the run: backup retained, restored now
//!
//! An entry is journaled as in progress right after the backup, so an agent
//! killed mid-install still knows where the previous files are.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use fleetota_core::{
    Checksum, ChecksumError, DispatchRequest, HealthReport, Outcome, RollbackResponse,
};

use crate::backup::{Backup, BackupError, BackupManager, BackupManifest};
use crate::fetch::{FetchError, Fetcher};
use crate::health::HealthGate;
use crate::installer::{InstallError, Installer};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid job id {0:?}")]
    InvalidJobId(String),
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("checksum error: {0}")]
    Checksum(ChecksumError),
    #[error("install failed: {0}")]
    InstallStep(#[from] InstallError),
    #[error("health check failed: {0}")]
    HealthCheckFailure(String),
    #[error("rollback failed: {0}")]
    Rollback(String),
}

impl From<ChecksumError> for PipelineError {
    fn from(e: ChecksumError) -> Self {
        match e {
            ChecksumError::Mismatch { expected, actual } => PipelineError::ChecksumMismatch { expected, actual },
            other => PipelineError::Checksum(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum Disposition {
    /// Failed before install, the system was never modified
    Untouched,
    Committed,
    RolledBack,
    /// Restore failed during the run; backup kept at `path`
    Retained { path: PathBuf, manifest: BackupManifest },
    /// Backup taken, run not finished
    InProgress { path: PathBuf, manifest: BackupManifest },
    /// Committed while nobody waited for the result; backup kept at `path`
    Unconfirmed { path: PathBuf, manifest: BackupManifest },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    request: DispatchRequest,
    disposition: Disposition,
}

type Journal = HashMap<String, JournalEntry>;

pub struct UpdatePipeline {
    backups: BackupManager,
    fetcher: Fetcher,
    installer: Arc<dyn Installer>,
    gate: Arc<dyn HealthGate>,
    update_dir: PathBuf,
    journal_file: Option<PathBuf>,
    journal: Mutex<Journal>,
}

impl UpdatePipeline {
    pub fn new(
        backups: BackupManager,
        fetcher: Fetcher,
        installer: Arc<dyn Installer>,
        gate: Arc<dyn HealthGate>,
        update_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backups,
            fetcher,
            installer,
            gate,
            update_dir: update_dir.into(),
            journal_file: None,
            journal: Mutex::new(HashMap::new()),
        }
    }

    /// Persists the journal to `path` after every change
    pub fn with_journal_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_file = Some(path.into());
        self
    }

    pub async fn load_journal(&self) -> anyhow::Result<()> {
        let Some(path) = &self.journal_file else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = tokio::fs::read(path).await?;
        let mut loaded: Journal = serde_json::from_slice(&raw)?;
        info!("Loaded {} journal entries from {}", loaded.len(), path.display());

        // interrupted by a crash or restart: the backup is all that is left
        let mut interrupted = 0;
        for (job_id, entry) in loaded.iter_mut() {
            if let Disposition::InProgress { path, manifest } = &entry.disposition {
                warn!(job_id = %job_id, "update was interrupted, backup kept at {}", path.display());
                entry.disposition = Disposition::Retained { path: path.clone(), manifest: manifest.clone() };
                interrupted += 1;
            }
        }

        let mut journal = self.journal.lock().await;
        *journal = loaded;
        if interrupted > 0 {
            self.save_journal(&journal).await;
        }
        Ok(())
    }

    async fn save_journal(&self, journal: &Journal) {
        let Some(path) = &self.journal_file else {
            return;
        };
        let result = async {
            let json = serde_json::to_vec_pretty(journal)?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, path).await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to save journal {}: {}", path.display(), e);
        }
    }

    /// Runs one update to completion and reports what happened
    pub async fn install_update(&self, request: &DispatchRequest) -> Outcome {
        self.install_watched(request, &AtomicBool::new(false)).await
    }

    /// Same as [`install_update`](Self::install_update); when `requester_gone`
    /// is set by commit time the backup is kept so the requester can still
    /// ask for a rollback
    pub async fn install_watched(&self, request: &DispatchRequest, requester_gone: &AtomicBool) -> Outcome {
        if let Err(e) = validate_job_id(&request.job_id) {
            warn!("update refused: {e}");
            return Outcome::aborted(e.to_string());
        }

        let mut journal = self.journal.lock().await;

        if journal.contains_key(&request.job_id) {
            warn!(job_id = %request.job_id, "duplicate dispatch ignored");
            return Outcome::aborted(format!("job {} already ran on this node", request.job_id));
        }

        info!(
            job_id = %request.job_id,
            "Starting {} update: {} v{}",
            request.update_type, request.package_name, request.package_version
        );
        let (outcome, disposition) = self.run(request, &mut journal, requester_gone).await;

        if outcome.success {
            info!(job_id = %request.job_id, "update committed");
        } else {
            warn!(
                job_id = %request.job_id,
                rolled_back = outcome.rolled_back,
                "update failed: {}",
                outcome.error_message.as_deref().unwrap_or("unknown error")
            );
        }

        journal.insert(request.job_id.clone(), JournalEntry { request: request.clone(), disposition });
        self.save_journal(&journal).await;
        outcome
    }

    async fn run(
        &self,
        request: &DispatchRequest,
        journal: &mut Journal,
        requester_gone: &AtomicBool,
    ) -> (Outcome, Disposition) {
        let checksum: Checksum = match request.checksum.parse() {
            Ok(c) => c,
            Err(e) => return (Outcome::aborted(PipelineError::from(e).to_string()), Disposition::Untouched),
        };

        let owned = self.installer.owned_paths(request);
        let backup = match self.backups.create(&request.package_name, request.update_type, &owned).await {
            Ok(b) => b,
            Err(e) => return (Outcome::aborted(PipelineError::from(e).to_string()), Disposition::Untouched),
        };
        let in_progress = Disposition::InProgress { path: backup.path.clone(), manifest: backup.manifest.clone() };
        journal.insert(request.job_id.clone(), JournalEntry { request: request.clone(), disposition: in_progress });
        self.save_journal(journal).await;

        let artifact = self.artifact_path(request);
        if let Err(e) = self.prepare(request, &checksum, &artifact).await {
            self.backups.discard(&backup).await;
            remove_artifact(&artifact).await;
            return (Outcome::aborted(e.to_string()), Disposition::Untouched);
        }

        let installed = self.installer.install(request, &artifact).await;
        remove_artifact(&artifact).await;
        if let Err(e) = installed {
            return self.roll_back(request, backup, PipelineError::from(e), None).await;
        }

        let report = self.gate.check().await;
        if !report.healthy {
            let failure = PipelineError::HealthCheckFailure(report.summary());
            return self.roll_back(request, backup, failure, Some(report)).await;
        }

        if requester_gone.load(Ordering::SeqCst) {
            warn!(job_id = %request.job_id, "requester left before the result, backup kept at {}", backup.path.display());
            let unconfirmed = Disposition::Unconfirmed { path: backup.path, manifest: backup.manifest };
            return (Outcome::committed(report), unconfirmed);
        }
        self.backups.discard(&backup).await;
        (Outcome::committed(report), Disposition::Committed)
    }

    /// Fetch then verify, nothing on the system changes here
    async fn prepare(&self, request: &DispatchRequest, checksum: &Checksum, artifact: &Path) -> Result<(), PipelineError> {
        self.fetcher.fetch(&request.source_locator, artifact).await?;
        checksum.verify_file(artifact).await?;
        Ok(())
    }

    async fn roll_back(
        &self,
        request: &DispatchRequest,
        backup: Backup,
        failure: PipelineError,
        health: Option<HealthReport>,
    ) -> (Outcome, Disposition) {
        warn!(job_id = %request.job_id, "{failure}, triggering rollback");

        match self.restore(request, &backup).await {
            Ok(()) => {
                self.backups.discard(&backup).await;
                (Outcome::rolled_back(failure.to_string(), true, health), Disposition::RolledBack)
            }
            Err(e) => {
                error!(job_id = %request.job_id, "{e}, backup kept at {}", backup.path.display());
                let message = format!("{failure}; {e}");
                let retained = Disposition::Retained { path: backup.path, manifest: backup.manifest };
                (Outcome::rolled_back(message, false, health), retained)
            }
        }
    }

    async fn restore(&self, request: &DispatchRequest, backup: &Backup) -> Result<(), PipelineError> {
        self.installer
            .quiesce(request)
            .await
            .map_err(|e| PipelineError::Rollback(e.to_string()))?;
        self.backups
            .restore(backup)
            .await
            .map_err(|e| PipelineError::Rollback(e.to_string()))?;
        self.installer
            .resume(request)
            .await
            .map_err(|e| PipelineError::Rollback(e.to_string()))?;
        info!(job_id = %request.job_id, "Rollback completed for {}", request.package_name);
        Ok(())
    }

    /// Kernel-initiated rollback of a job this node already ran
    pub async fn rollback(&self, job_id: &str) -> RollbackResponse {
        let mut journal = self.journal.lock().await;
        let Some(entry) = journal.get_mut(job_id) else {
            return RollbackResponse::failed(format!("unknown job {job_id}"));
        };

        let backup = match &entry.disposition {
            Disposition::Untouched | Disposition::RolledBack => return RollbackResponse::ok(),
            Disposition::Committed => {
                return RollbackResponse::failed(format!("job {job_id} was committed, backup discarded"))
            }
            Disposition::Retained { path, manifest }
            | Disposition::InProgress { path, manifest }
            | Disposition::Unconfirmed { path, manifest } => Backup { path: path.clone(), manifest: manifest.clone() },
        };

        let response = match self.restore(&entry.request, &backup).await {
            Ok(()) => {
                self.backups.discard(&backup).await;
                entry.disposition = Disposition::RolledBack;
                RollbackResponse::ok()
            }
            Err(e) => RollbackResponse::failed(e.to_string()),
        };
        self.save_journal(&journal).await;
        response
    }

    fn artifact_path(&self, request: &DispatchRequest) -> PathBuf {
        let last = request
            .source_locator
            .split(['?', '#'])
            .next()
            .and_then(|s| s.rsplit('/').next())
            .unwrap_or_default();
        let clean: String = last
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .collect();
        let file_name = if clean.is_empty() || clean.starts_with('.') {
            format!("{}_{}", request.package_name, request.package_version)
        } else {
            clean
        };
        self.update_dir.join(format!("{}-{}", request.job_id, file_name))
    }
}

/// A job id names files under the update dir: one plain path component only
pub fn validate_job_id(job_id: &str) -> Result<(), PipelineError> {
    let valid = !job_id.is_empty()
        && job_id.len() <= 128
        && !job_id.starts_with('.')
        && job_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidJobId(job_id.to_string()))
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove artifact {}: {}", path.display(), e);
        }
    }
}
