/**
 * FIRMWARE SERVER - Catalogue des images et service par blocs
 *
 * RÔLE : Expose les fichiers de `firmware_dir` aux agents via le protocole de
 * transfert par blocs (fast-path fichier entier pour les petites images).
 *
 * SÉCURITÉ : seuls les noms de fichiers simples sont acceptés (pas de `..`,
 * pas de séparateur), le service reste confiné au répertoire firmware.
 */

use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

use fleetota_core::checksum::digest_file;
use fleetota_core::transfer::{self, BlockOption, Served};
use fleetota_core::{ChecksumError, DigestAlgorithm, TransferError};

use crate::config::TransferConf;

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("firmware {0} not found")]
    NotFound(String),
    #[error("invalid firmware name: {0}")]
    InvalidName(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct FirmwareEntry {
    pub name: String,
    pub size: u64,
    /// `sha256:<hex>`, directement utilisable comme checksum d'une requête
    pub checksum: String,
}

pub struct FirmwareCatalog {
    dir: PathBuf,
    preferred_szx: u8,
    max_message_size: usize,
}

impl FirmwareCatalog {
    pub fn new(dir: impl Into<PathBuf>, transfer: &TransferConf) -> Self {
        Self {
            dir: dir.into(),
            preferred_szx: transfer.preferred_szx,
            max_message_size: transfer.max_message_size,
        }
    }

    /// Liste les images avec taille et digest
    pub async fn list(&self) -> Result<Vec<FirmwareEntry>, FirmwareError> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let checksum = digest_file(DigestAlgorithm::Sha256, &entry.path()).await?;
            entries.push(FirmwareEntry { name, size: meta.len(), checksum: checksum.to_string() });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Chemin d'une image, confiné au répertoire firmware
    pub fn resolve(&self, name: &str) -> Result<PathBuf, FirmwareError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && !name.contains('\0');
        if !valid {
            return Err(FirmwareError::InvalidName(name.to_string()));
        }

        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(FirmwareError::NotFound(name.to_string()));
        }
        Ok(path)
    }

    /// Répond à une requête bloc (ou fichier entier si aucune option)
    pub async fn serve(&self, name: &str, requested: Option<BlockOption>) -> Result<Served, FirmwareError> {
        let path = self.resolve(name)?;
        debug!(name, block = ?requested, "serving firmware");
        Ok(transfer::serve(&path, requested, self.preferred_szx, self.max_message_size).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn catalog(dir: &Path) -> FirmwareCatalog {
        FirmwareCatalog::new(dir, &TransferConf { preferred_szx: 2, max_message_size: 64 })
    }

    #[tokio::test]
    async fn test_list_reports_digest() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("b.bin"), b"hello world").await.unwrap();
        tokio::fs::write(dir.path().join("a.bin"), b"").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let entries = catalog(dir.path()).list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.bin");
        assert_eq!(entries[1].size, 11);
        assert_eq!(
            entries[1].checksum,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_missing_dir_lists_nothing() {
        let cat = catalog(Path::new("/nonexistent/firmware"));
        assert!(cat.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(dir.path());
        assert!(matches!(cat.resolve("../etc/passwd"), Err(FirmwareError::InvalidName(_))));
        assert!(matches!(cat.resolve(".."), Err(FirmwareError::InvalidName(_))));
        assert!(matches!(cat.resolve("ghost.bin"), Err(FirmwareError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_serve_uses_configured_sizes() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("small.bin"), vec![1u8; 64]).await.unwrap();
        tokio::fs::write(dir.path().join("big.bin"), vec![2u8; 200]).await.unwrap();
        let cat = catalog(dir.path());

        assert!(matches!(cat.serve("small.bin", None).await.unwrap(), Served::Whole(_)));
        match cat.serve("big.bin", None).await.unwrap() {
            Served::Block(block) => {
                assert_eq!(block.option.szx, 2);
                assert_eq!(block.payload.len(), 64);
                assert!(block.option.more);
            }
            other => panic!("expected block, got {other:?}"),
        }
    }
}
