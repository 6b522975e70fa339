//! Restoring ECU memory from a backup
//!
//! Used by the orchestrator after a failed write, and on its own when the
//! user asks to put the last known-good image back.

use std::sync::Arc;

use revflash_core::{EcuBackupArtifact, FlashJob, FlashStatus};
use revflash_obd::{CriticalSection, ObdError, SessionOwner, VehicleClient};
use tokio::sync::watch;
use tracing::{instrument, warn};

use crate::backup::{check_integrity, BackupStore};
use crate::error::{FlashError, FlashFailure};
use crate::progress::{JobReporter, TrackedJob};

/// Tune id recorded on standalone restore jobs
pub const RESTORE_TUNE_ID: &str = "ecu-backup";

/// Writes backups back to the ECU through the normal write primitive
pub struct RecoveryController {
    client: Arc<VehicleClient>,
    backups: Arc<dyn BackupStore>,
    reporter: JobReporter,
    block_size: usize,
}

impl RecoveryController {
    pub(crate) fn new(
        client: Arc<VehicleClient>,
        backups: Arc<dyn BackupStore>,
        reporter: JobReporter,
        block_size: usize,
    ) -> Self {
        Self {
            client,
            backups,
            reporter,
            block_size,
        }
    }

    /// Restore the most recent backup of `vehicle_id` as its own job
    ///
    /// Refuses to start when the vehicle has no backup, or when its newest
    /// backup no longer matches its checksum.
    #[instrument(skip(self))]
    pub async fn restore_latest(&self, vehicle_id: &str) -> Result<FlashJob, FlashFailure> {
        let mut job = FlashJob::new(vehicle_id, RESTORE_TUNE_ID);
        let Some(_claim) = self.reporter.claim(vehicle_id) else {
            let error = FlashError::AlreadyActive(vehicle_id.to_string());
            if let Err(e) = job.fail(error.to_string()) {
                warn!(error = %e, "Could not mark rejected restore failed");
            }
            return Err(FlashFailure::new(error, job));
        };

        let (snapshot, _) = watch::channel(job.clone());
        let mut tracked = TrackedJob::new(self.reporter.clone(), job, snapshot);
        if let Err(error) = tracked.register().await {
            return Err(finish_failed(tracked, error).await);
        }

        let backup = match self.backups.latest(vehicle_id).await {
            Ok(Some(backup)) => backup,
            Ok(None) => {
                let error = FlashError::NoBackup(vehicle_id.to_string());
                tracked.log(format!("Restore refused: {}", error));
                return Err(finish_failed(tracked, error).await);
            }
            Err(e) => {
                let error = FlashError::RecoveryFailed(e.to_string());
                tracked.log(format!("Restore refused: {}", error));
                return Err(finish_failed(tracked, error).await);
            }
        };
        tracked.set_backup(backup.id);

        let session = self.client.acquire_session(SessionOwner::Recovery).await;
        if let Err(error) = tracked.advance(FlashStatus::RecoveryInProgress).await {
            return Err(finish_failed(tracked, error).await);
        }

        let section = match self.client.begin_critical(&session).await {
            Ok(section) => section,
            Err(e) => return Err(finish_failed(tracked, e.into()).await),
        };

        match self.restore_into(&section, &backup, &mut tracked).await {
            Ok(()) => {
                if let Err(e) = tracked.advance(FlashStatus::Recovered).await {
                    warn!(error = %e, "Recovered job could not be committed");
                }
                tracked.finish();
                Ok(tracked.into_job())
            }
            Err(error) => Err(finish_failed(tracked, error).await),
        }
    }

    /// Write `backup` to the ECU inside an open critical section
    ///
    /// The outcome is recorded in the job log either way.
    pub(crate) async fn restore_into(
        &self,
        section: &CriticalSection<'_>,
        backup: &EcuBackupArtifact,
        tracked: &mut TrackedJob,
    ) -> Result<(), FlashError> {
        tracked.log(format!(
            "Restoring backup {} captured {} ({} bytes)",
            backup.id,
            backup.captured_at.to_rfc3339(),
            backup.len()
        ));

        let result = self.write_backup(section, backup).await;
        match &result {
            Ok(()) => tracked.log(format!(
                "Backup restored; ECU checksum {:08X} matches",
                backup.checksum
            )),
            Err(e) => tracked.log(format!("Restore failed: {}", e)),
        }
        result
    }

    async fn write_backup(
        &self,
        section: &CriticalSection<'_>,
        backup: &EcuBackupArtifact,
    ) -> Result<(), FlashError> {
        check_integrity(backup).map_err(|e| FlashError::RecoveryFailed(e.to_string()))?;

        let failed = |e: ObdError| FlashError::RecoveryFailed(e.to_string());
        if !section.is_link_up() {
            section.reconnect().await.map_err(|e| {
                FlashError::RecoveryFailed(format!("adapter unreachable: {}", e))
            })?;
        }

        section.enter_programming().await.map_err(failed)?;
        section.erase().await.map_err(failed)?;
        section
            .write_image(&backup.data, self.block_size)
            .await
            .map_err(failed)?;

        let actual = section
            .checksum(0, backup.len() as u32)
            .await
            .map_err(failed)?;
        if actual != backup.checksum {
            return Err(FlashError::RecoveryFailed(format!(
                "ECU checksum {:08X} after restore, backup has {:08X}",
                actual, backup.checksum
            )));
        }

        section.exit_programming().await.map_err(failed)?;
        Ok(())
    }
}

async fn finish_failed(mut tracked: TrackedJob, error: FlashError) -> FlashFailure {
    tracked.fail(error.to_string()).await;
    tracked.finish();
    FlashFailure::new(error, tracked.into_job())
}
