//! Durable ECU memory backups
//!
//! Each backup is a raw image plus a JSON sidecar:
//!
//! ```text
//! <root>/<vehicle>/20260101T120000.123Z-<uuid>.bin
//! <root>/<vehicle>/20260101T120000.123Z-<uuid>.json
//! ```
//!
//! Backups are never overwritten or deleted; the newest one per vehicle is
//! the recovery target.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use revflash_core::EcuBackupArtifact;
use revflash_obd::codec;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::BackupError;

/// Storage for ECU memory snapshots
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persist `backup` durably; returns once the data has reached storage
    async fn save(&self, backup: &EcuBackupArtifact) -> Result<(), BackupError>;

    /// Most recent backup for `vehicle_id`, with its image loaded and checked
    async fn latest(&self, vehicle_id: &str) -> Result<Option<EcuBackupArtifact>, BackupError>;

    /// All backups for `vehicle_id`, oldest first, without image data
    async fn list(&self, vehicle_id: &str) -> Result<Vec<EcuBackupArtifact>, BackupError>;
}

/// Confirm a loaded image still matches its recorded checksum
pub fn check_integrity(backup: &EcuBackupArtifact) -> Result<(), BackupError> {
    let actual = codec::checksum(&backup.data);
    if actual != backup.checksum {
        return Err(BackupError::Corrupt {
            id: backup.id.to_string(),
            reason: format!(
                "checksum {:08X} does not match recorded {:08X}",
                actual, backup.checksum
            ),
        });
    }
    Ok(())
}

/// Filesystem backup store
#[derive(Debug, Clone)]
pub struct FsBackupStore {
    root: PathBuf,
}

impl FsBackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn vehicle_dir(&self, vehicle_id: &str) -> PathBuf {
        let safe: String = vehicle_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn stem(backup: &EcuBackupArtifact) -> String {
        format!(
            "{}-{}",
            backup.captured_at.format("%Y%m%dT%H%M%S%.3fZ"),
            backup.id
        )
    }

    /// Sidecar metadata files for a vehicle, sorted oldest first
    async fn sidecars(&self, vehicle_id: &str) -> Result<Vec<PathBuf>, BackupError> {
        let dir = self.vehicle_dir(vehicle_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read_metadata(path: &Path) -> Result<EcuBackupArtifact, BackupError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), BackupError> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl BackupStore for FsBackupStore {
    async fn save(&self, backup: &EcuBackupArtifact) -> Result<(), BackupError> {
        let dir = self.vehicle_dir(&backup.vehicle_id);
        tokio::fs::create_dir_all(&dir).await?;

        let stem = Self::stem(backup);
        let image = dir.join(format!("{}.bin", stem));
        let sidecar = dir.join(format!("{}.json", stem));

        // image first: a sidecar never points at a missing image
        write_synced(&image, &backup.data).await?;
        write_synced(&sidecar, &serde_json::to_vec_pretty(backup)?).await?;

        match tokio::fs::File::open(&dir).await {
            Ok(handle) => {
                if let Err(e) = handle.sync_all().await {
                    debug!(error = %e, "Directory sync not supported");
                }
            }
            Err(e) => debug!(error = %e, "Could not open backup directory for sync"),
        }

        info!(
            vehicle = %backup.vehicle_id,
            backup = %backup.id,
            bytes = backup.len(),
            checksum = format!("{:08X}", backup.checksum),
            "ECU backup stored"
        );
        Ok(())
    }

    async fn latest(&self, vehicle_id: &str) -> Result<Option<EcuBackupArtifact>, BackupError> {
        let Some(sidecar) = self.sidecars(vehicle_id).await?.pop() else {
            return Ok(None);
        };

        let mut backup = Self::read_metadata(&sidecar).await?;
        backup.data = tokio::fs::read(sidecar.with_extension("bin"))
            .await
            .map_err(|e| BackupError::Corrupt {
                id: backup.id.to_string(),
                reason: format!("image unreadable: {}", e),
            })?;
        check_integrity(&backup)?;
        Ok(Some(backup))
    }

    async fn list(&self, vehicle_id: &str) -> Result<Vec<EcuBackupArtifact>, BackupError> {
        let mut backups = Vec::new();
        for sidecar in self.sidecars(vehicle_id).await? {
            match Self::read_metadata(&sidecar).await {
                Ok(backup) => backups.push(backup),
                Err(e) => warn!(path = %sidecar.display(), error = %e, "Skipping unreadable backup metadata"),
            }
        }
        Ok(backups)
    }
}

/// In-memory backup store
#[derive(Debug, Default)]
pub struct MemoryBackupStore {
    backups: Mutex<Vec<EcuBackupArtifact>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored backups across all vehicles
    pub fn len(&self) -> usize {
        self.backups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.lock().is_empty()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn save(&self, backup: &EcuBackupArtifact) -> Result<(), BackupError> {
        self.backups.lock().push(backup.clone());
        Ok(())
    }

    async fn latest(&self, vehicle_id: &str) -> Result<Option<EcuBackupArtifact>, BackupError> {
        let latest = self
            .backups
            .lock()
            .iter()
            .rev()
            .find(|b| b.vehicle_id == vehicle_id)
            .cloned();
        if let Some(ref backup) = latest {
            check_integrity(backup)?;
        }
        Ok(latest)
    }

    async fn list(&self, vehicle_id: &str) -> Result<Vec<EcuBackupArtifact>, BackupError> {
        Ok(self
            .backups
            .lock()
            .iter()
            .filter(|b| b.vehicle_id == vehicle_id)
            .map(|b| EcuBackupArtifact {
                data: Vec::new(),
                ..b.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn artifact(vehicle: &str, data: &[u8]) -> EcuBackupArtifact {
        EcuBackupArtifact::new(vehicle, data.to_vec(), codec::checksum(data), Some("tune-1".into()))
    }

    #[tokio::test]
    async fn test_fs_latest_returns_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBackupStore::new(dir.path());

        let mut older = artifact("veh-1", b"old image");
        older.captured_at -= Duration::seconds(60);
        let newer = artifact("veh-1", b"new image");
        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        let latest = store.latest("veh-1").await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
        assert_eq!(latest.data, b"new image");
        assert_eq!(latest.source_tune_id.as_deref(), Some("tune-1"));

        let listed = store.list("veh-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, older.id);
        assert!(listed[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_fs_unknown_vehicle_has_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBackupStore::new(dir.path());
        assert!(store.latest("ghost").await.unwrap().is_none());
        assert!(store.list("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_vehicles_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBackupStore::new(dir.path());
        store.save(&artifact("veh-1", b"one")).await.unwrap();
        store.save(&artifact("veh-2", b"two")).await.unwrap();

        assert_eq!(store.latest("veh-2").await.unwrap().unwrap().data, b"two");
    }

    #[tokio::test]
    async fn test_fs_detects_tampered_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBackupStore::new(dir.path());
        let backup = artifact("veh-1", b"pristine");
        store.save(&backup).await.unwrap();

        let image = store
            .vehicle_dir("veh-1")
            .join(format!("{}.bin", FsBackupStore::stem(&backup)));
        tokio::fs::write(&image, b"tampered").await.unwrap();

        let err = store.latest("veh-1").await.unwrap_err();
        assert!(matches!(err, BackupError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBackupStore::new();
        assert!(store.latest("veh-1").await.unwrap().is_none());

        store.save(&artifact("veh-1", b"a")).await.unwrap();
        let second = artifact("veh-1", b"b");
        store.save(&second).await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.latest("veh-1").await.unwrap().unwrap().id, second.id);
        assert_eq!(store.list("veh-1").await.unwrap().len(), 2);
    }
}
