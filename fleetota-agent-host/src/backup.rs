//! Pre-install snapshots of the files an update will touch
//!
//! A backup lives in `{backup_dir}/{package}_{type}_{timestamp}/` with one
//! stored copy per captured path and a `manifest.json` describing where each
//! copy goes back. Paths that did not exist are recorded too, so a restore
//! removes whatever the install created there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use fleetota_core::UpdateType;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid backup manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    /// Did not exist before the install
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original: PathBuf,
    pub kind: EntryKind,
    /// Relative to the backup directory, `None` for missing paths
    pub stored: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub package_name: String,
    pub update_type: UpdateType,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self { backup_dir: backup_dir.into() }
    }

    /// Snapshots `paths` (files or directory trees) for one package
    pub async fn create(
        &self,
        package_name: &str,
        update_type: UpdateType,
        paths: &[PathBuf],
    ) -> Result<Backup, BackupError> {
        let created_at = Utc::now();
        let dir_name = format!("{}_{}_{}", package_name, update_type, created_at.format("%Y%m%dT%H%M%S%.3f"));
        let path = self.backup_dir.join(dir_name);
        tokio::fs::create_dir_all(&path).await.map_err(io_err(&path))?;

        let mut entries = Vec::with_capacity(paths.len());
        for (index, original) in paths.iter().enumerate() {
            let stored = PathBuf::from(format!("entry-{index}"));
            let entry = match tokio::fs::symlink_metadata(original).await {
                Ok(meta) if meta.is_dir() => {
                    copy_tree(original, &path.join(&stored)).await?;
                    BackupEntry { original: original.clone(), kind: EntryKind::Dir, stored: Some(stored) }
                }
                Ok(_) => {
                    tokio::fs::copy(original, path.join(&stored)).await.map_err(io_err(original))?;
                    BackupEntry { original: original.clone(), kind: EntryKind::File, stored: Some(stored) }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    BackupEntry { original: original.clone(), kind: EntryKind::Missing, stored: None }
                }
                Err(e) => return Err(BackupError::Io { path: original.clone(), source: e }),
            };
            debug!(path = %original.display(), kind = ?entry.kind, "captured");
            entries.push(entry);
        }

        let manifest = BackupManifest {
            package_name: package_name.to_string(),
            update_type,
            created_at,
            entries,
        };
        let manifest_path = path.join(MANIFEST);
        tokio::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(io_err(&manifest_path))?;

        info!("Backup created: {}", path.display());
        Ok(Backup { path, manifest })
    }

    /// Puts every captured path back as it was
    pub async fn restore(&self, backup: &Backup) -> Result<(), BackupError> {
        for entry in &backup.manifest.entries {
            remove_path(&entry.original).await?;

            match (entry.kind, &entry.stored) {
                (EntryKind::Missing, _) => {}
                (EntryKind::File, Some(stored)) => {
                    if let Some(parent) = entry.original.parent() {
                        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
                    }
                    tokio::fs::copy(backup.path.join(stored), &entry.original)
                        .await
                        .map_err(io_err(&entry.original))?;
                }
                (EntryKind::Dir, Some(stored)) => {
                    copy_tree(&backup.path.join(stored), &entry.original).await?;
                }
                (_, None) => {
                    warn!("Manifest entry {} has no stored copy", entry.original.display());
                }
            }
        }

        info!("Backup restored: {}", backup.path.display());
        Ok(())
    }

    /// Drops a backup once the install is committed
    pub async fn discard(&self, backup: &Backup) {
        if let Err(e) = tokio::fs::remove_dir_all(&backup.path).await {
            warn!("Failed to remove backup {}: {}", backup.path.display(), e);
        }
    }

    /// Reads a backup directory written by [`BackupManager::create`]
    pub async fn open(&self, path: &Path) -> Result<Backup, BackupError> {
        let manifest_path = path.join(MANIFEST);
        let raw = tokio::fs::read(&manifest_path).await.map_err(io_err(&manifest_path))?;
        Ok(Backup { path: path.to_path_buf(), manifest: serde_json::from_slice(&raw)? })
    }
}

async fn remove_path(path: &Path) -> Result<(), BackupError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await.map_err(io_err(path)),
        Ok(_) => tokio::fs::remove_file(path).await.map_err(io_err(path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::Io { path: path.to_path_buf(), source: e }),
    }
}

/// Recursive copy, walked with an explicit stack
async fn copy_tree(from: &Path, to: &Path) -> Result<(), BackupError> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await.map_err(io_err(&dst))?;
        let mut dir = tokio::fs::read_dir(&src).await.map_err(io_err(&src))?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err(&src))? {
            let file_type = entry.file_type().await.map_err(io_err(&src))?;
            let target = dst.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await.map_err(io_err(&target))?;
            }
        }
    }
    Ok(())
}
