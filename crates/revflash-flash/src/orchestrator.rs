//! Flash orchestrator
//!
//! Drives one flash job per vehicle through its stages:
//!
//! ```text
//! Pending ─gate─▶ Resolving ▶ Downloading ▶ Verifying ▶ BackingUp
//!     ┌──────────── critical section ────────────┐
//!   ▶ │ Erasing ▶ Writing ▶ VerifyingChecksum    │ ▶ Completed
//!     └──────────────────────────────────────────┘
//! ```
//!
//! The vehicle session is held for the whole job, which keeps the telemetry
//! poller off the link. Nothing touches ECU memory before the package has
//! passed both integrity checks and a backup has been stored. A failure
//! inside the critical section restores that backup without leaving it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use revflash_core::{
    AllowAllSafetyGate, EcuBackupArtifact, FlashJob, FlashStatus, JobTracker, NoopJobTracker,
    PackageCatalog, PackageStatus, SafetyGate, TunePackage, VersionSelector,
};
use revflash_obd::{codec, CriticalSection, ObdError, SessionOwner, VehicleClient};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::backup::{BackupStore, FsBackupStore};
use crate::config::{FlashConfig, StorageConfig};
use crate::download::PackageStore;
use crate::error::{FlashError, FlashFailure};
use crate::journal::JobJournal;
use crate::progress::{FlashEvent, JobReporter, TrackedJob};
use crate::recovery::RecoveryController;
use crate::tracker::HttpJobTracker;
use crate::verifier::PackageVerifier;

/// What to flash onto which vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    pub vehicle_id: String,
    pub tune_id: String,
    pub version: VersionSelector,
}

impl FlashRequest {
    /// Flash whatever version the catalog considers current
    pub fn latest(vehicle_id: impl Into<String>, tune_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            tune_id: tune_id.into(),
            version: VersionSelector::Latest,
        }
    }

    /// Flash exactly `version`; no other version is accepted
    pub fn exact(
        vehicle_id: impl Into<String>,
        tune_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            tune_id: tune_id.into(),
            version: VersionSelector::Exact(version.into()),
        }
    }
}

/// Transfer and safety parameters for flash jobs
#[derive(Debug, Clone)]
pub struct FlashSettings {
    /// Bytes per TransferData block
    pub block_size: usize,
    /// Bytes per ReadMemory request during backup
    pub read_block: u16,
    /// Size of the ECU region captured by backups
    pub memory_size: u32,
    pub min_battery_voltage: f64,
    /// Upper bound for each job tracker call
    pub report_timeout: Duration,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self::from(&FlashConfig::default())
    }
}

impl From<&FlashConfig> for FlashSettings {
    fn from(config: &FlashConfig) -> Self {
        Self {
            block_size: config.transfer.block_size,
            read_block: config.transfer.read_block,
            memory_size: config.transfer.memory_size,
            min_battery_voltage: config.safety.min_battery_voltage,
            report_timeout: Duration::from_millis(config.timeouts.report_ms),
        }
    }
}

/// A flash job running on its own task
pub struct FlashHandle {
    job_id: String,
    cancel: watch::Sender<bool>,
    snapshot: watch::Receiver<FlashJob>,
    task: JoinHandle<Result<FlashJob, FlashFailure>>,
}

impl FlashHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Request cancellation
    ///
    /// Honoured at the next stage boundary before `Erasing`. Once ECU memory
    /// is being modified the request only takes effect after the write has
    /// finished, by restoring the backup.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Latest state of the job
    pub fn snapshot(&self) -> FlashJob {
        self.snapshot.borrow().clone()
    }

    /// Wait for the job to end
    pub async fn wait(self) -> Result<FlashJob, FlashFailure> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                let job = self.snapshot.borrow().clone();
                Err(FlashFailure::new(
                    FlashError::Storage(format!("flash task ended abnormally: {}", e)),
                    job,
                ))
            }
        }
    }
}

/// Staged, failure-aware ECU flasher
pub struct FlashOrchestrator {
    client: Arc<VehicleClient>,
    catalog: Arc<dyn PackageCatalog>,
    gate: Arc<dyn SafetyGate>,
    verifier: PackageVerifier,
    packages: PackageStore,
    backups: Arc<dyn BackupStore>,
    reporter: JobReporter,
    recovery: RecoveryController,
    settings: FlashSettings,
}

impl FlashOrchestrator {
    /// Start building an orchestrator storing its data under `storage_root`
    pub fn builder(
        client: Arc<VehicleClient>,
        catalog: Arc<dyn PackageCatalog>,
        storage_root: impl Into<PathBuf>,
    ) -> FlashOrchestratorBuilder {
        FlashOrchestratorBuilder::new(client, catalog, storage_root.into())
    }

    /// Build an orchestrator from configuration
    ///
    /// Uses the HTTP job tracker when one is configured.
    pub fn from_config(
        client: Arc<VehicleClient>,
        config: &FlashConfig,
        catalog: Arc<dyn PackageCatalog>,
    ) -> Result<Self, FlashError> {
        let verifier = PackageVerifier::from_config(&config.trust)?;
        let packages = PackageStore::from_config(config)?;

        let mut builder = Self::builder(client, catalog, config.storage.root.clone())
            .verifier(verifier)
            .package_store(packages)
            .settings(FlashSettings::from(config));

        if let Some(ref remote) = config.tracker {
            let tracker = HttpJobTracker::new(remote, &config.timeouts)
                .map_err(|e| FlashError::Config(format!("job tracker: {}", e)))?;
            builder = builder.tracker(Arc::new(tracker));
        }

        Ok(builder.build())
    }

    pub fn settings(&self) -> &FlashSettings {
        &self.settings
    }

    pub fn backups(&self) -> &Arc<dyn BackupStore> {
        &self.backups
    }

    pub fn packages(&self) -> &PackageStore {
        &self.packages
    }

    pub fn journal(&self) -> &JobJournal {
        self.reporter.journal()
    }

    /// Controller for standalone restores
    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    /// Progress events of every job run by this orchestrator
    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.reporter.subscribe()
    }

    /// Whether a flash or restore is running against `vehicle_id`
    pub fn is_active(&self, vehicle_id: &str) -> bool {
        self.reporter.is_active(vehicle_id)
    }

    /// Run a flash job to completion
    pub async fn run(&self, request: FlashRequest) -> Result<FlashJob, FlashFailure> {
        let job = FlashJob::new(&request.vehicle_id, &request.tune_id);
        let (_cancel, cancelled) = watch::channel(false);
        let (snapshot, _) = watch::channel(job.clone());
        self.execute(job, request.version, cancelled, snapshot).await
    }

    /// Run a flash job on a new task
    pub fn spawn(self: &Arc<Self>, request: FlashRequest) -> FlashHandle {
        let job = FlashJob::new(&request.vehicle_id, &request.tune_id);
        let job_id = job.id.clone();
        let (cancel, cancelled) = watch::channel(false);
        let (snapshot_tx, snapshot) = watch::channel(job.clone());

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.execute(job, request.version, cancelled, snapshot_tx)
                .await
        });

        FlashHandle {
            job_id,
            cancel,
            snapshot,
            task,
        }
    }

    /// Restore the most recent backup of `vehicle_id`
    pub async fn restore_latest(&self, vehicle_id: &str) -> Result<FlashJob, FlashFailure> {
        self.recovery.restore_latest(vehicle_id).await
    }

    #[instrument(skip_all, fields(job = %job.id, vehicle = %job.vehicle_id, tune = %job.tune_id))]
    async fn execute(
        &self,
        mut job: FlashJob,
        version: VersionSelector,
        mut cancelled: watch::Receiver<bool>,
        snapshot: watch::Sender<FlashJob>,
    ) -> Result<FlashJob, FlashFailure> {
        let Some(_claim) = self.reporter.claim(&job.vehicle_id) else {
            let error = FlashError::AlreadyActive(job.vehicle_id.clone());
            if let Err(e) = job.fail(error.to_string()) {
                warn!(error = %e, "Could not mark rejected job failed");
            }
            snapshot.send_replace(job.clone());
            return Err(FlashFailure::new(error, job));
        };

        let mut tracked = TrackedJob::new(self.reporter.clone(), job, snapshot);
        if let Err(error) = tracked.register().await {
            return Err(self.abandon(tracked, error).await);
        }
        tracked.log(format!(
            "Flash requested: tune {} ({}) for vehicle {}",
            tracked.job().tune_id,
            version,
            tracked.job().vehicle_id
        ));

        let session = self.client.acquire_session(SessionOwner::Flash).await;
        tracked.log("Vehicle session acquired; telemetry polling suspended");

        let (image, backup) = match self.prepare(&mut tracked, &version, &mut cancelled).await {
            Ok(prepared) => prepared,
            Err(error) => return Err(self.abandon(tracked, error).await),
        };

        if *cancelled.borrow() {
            return Err(self.abandon(tracked, FlashError::Cancelled).await);
        }

        let section = match self.client.begin_critical(&session).await {
            Ok(section) => section,
            Err(error) => return Err(self.abandon(tracked, error.into()).await),
        };

        if let Err(error) = self.write(&mut tracked, &section, &image, &cancelled).await {
            return Err(self.recover(tracked, &section, &backup, error).await);
        }

        if *cancelled.borrow() {
            tracked.log("Honouring cancellation requested during the write; restoring backup");
            return Err(self
                .recover(tracked, &section, &backup, FlashError::Cancelled)
                .await);
        }
        drop(section);

        // a refusal is logged and does not fail the job
        match self.client.clear_dtcs().await {
            Ok(()) => tracked.log("Diagnostic trouble codes cleared"),
            Err(e) => {
                warn!(error = %e, "Could not clear diagnostic trouble codes");
                tracked.log(format!("Diagnostic trouble codes not cleared: {}", e));
            }
        }

        tracked.log("Flash completed");
        if let Err(e) = tracked.advance(FlashStatus::Completed).await {
            warn!(error = %e, "Completed job could not be committed");
        }
        tracked.finish();
        Ok(tracked.into_job())
    }

    /// Stages up to and including the backup; ECU memory is not modified here
    async fn prepare(
        &self,
        tracked: &mut TrackedJob,
        version: &VersionSelector,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<(Vec<u8>, EcuBackupArtifact), FlashError> {
        self.check_gate(tracked).await?;

        ensure_not_cancelled(cancelled)?;
        tracked.advance(FlashStatus::Resolving).await?;
        let package = self.resolve(tracked, version).await?;

        ensure_not_cancelled(cancelled)?;
        tracked.advance(FlashStatus::Downloading).await?;
        let quarantined = tokio::select! {
            result = self.packages.download(&package) => result?,
            _ = wait_cancelled(cancelled) => {
                self.packages.discard(&package).await;
                tracked.log(format!("Download of {} abandoned; quarantine purged", package.id));
                return Err(FlashError::Cancelled);
            }
        };
        tracked.log(format!("Package {} downloaded to quarantine", package.id));
        note_package(tracked, &package, PackageStatus::Downloaded);

        ensure_not_cancelled(cancelled)?;
        tracked.advance(FlashStatus::Verifying).await?;
        let image = match self.verifier.verify_file(&quarantined, &package).await {
            Ok(image) => image,
            Err(e) => {
                let status = self.packages.reject(&quarantined, &package).await;
                tracked.log(format!("Package rejected and purged: {}", e));
                note_package(tracked, &package, status);
                return Err(e.into());
            }
        };
        self.packages.promote(&quarantined, &package).await?;
        tracked.log(format!(
            "Package verified: sha256 {} signed by {}",
            package.expected_hash.to_lowercase(),
            package.public_key_id
        ));
        note_package(tracked, &package, PackageStatus::Verified);

        if image.is_empty() || image.len() > self.settings.memory_size as usize {
            return Err(FlashError::InvalidImage(format!(
                "{} bytes does not fit the {} byte flash region",
                image.len(),
                self.settings.memory_size
            )));
        }
        self.check_voltage(tracked).await?;

        ensure_not_cancelled(cancelled)?;
        tracked.advance(FlashStatus::BackingUp).await?;
        let backup = self.back_up(tracked).await?;

        Ok((image, backup))
    }

    async fn check_gate(&self, tracked: &mut TrackedJob) -> Result<(), FlashError> {
        let job = tracked.job();
        let verdict = self
            .gate
            .evaluate(&job.tune_id, &job.vehicle_id)
            .await
            .map_err(|e| FlashError::SafetyGateRejected(format!("safety gate unavailable: {}", e)))?;

        if !verdict.passed {
            let reasons = if verdict.reasons.is_empty() {
                "no reason given".to_string()
            } else {
                verdict.reasons.join("; ")
            };
            return Err(FlashError::SafetyGateRejected(format!(
                "risk score {:.2}: {}",
                verdict.risk_score, reasons
            )));
        }

        tracked.log(format!("Safety gate passed (risk score {:.2})", verdict.risk_score));
        Ok(())
    }

    async fn resolve(
        &self,
        tracked: &mut TrackedJob,
        version: &VersionSelector,
    ) -> Result<TunePackage, FlashError> {
        let package = self
            .catalog
            .resolve(&tracked.job().tune_id, version)
            .await
            .map_err(|e| FlashError::Resolve(e.to_string()))?;

        if !version.accepts(&package) {
            return Err(FlashError::Resolve(format!(
                "catalog offered version {} but {} was requested",
                package.version_label, version
            )));
        }

        tracked.log(format!(
            "Resolved package {} version {}",
            package.id, package.version_label
        ));
        let status = self.packages.register(&package);
        note_package(tracked, &package, status);
        Ok(package)
    }

    async fn check_voltage(&self, tracked: &mut TrackedJob) -> Result<(), FlashError> {
        let voltage = self.client.read_voltage().await?;
        let minimum = self.settings.min_battery_voltage;
        if voltage < minimum {
            return Err(FlashError::LowVoltage {
                actual: voltage,
                minimum,
            });
        }
        tracked.log(format!("Battery voltage {:.1} V", voltage));
        Ok(())
    }

    async fn back_up(&self, tracked: &mut TrackedJob) -> Result<EcuBackupArtifact, FlashError> {
        let size = self.settings.memory_size;
        let backup_failed = |e: ObdError| FlashError::BackupFailed(e.to_string());

        let data = self
            .client
            .read_memory_image(size, self.settings.read_block)
            .await
            .map_err(backup_failed)?;
        let reported = self.client.ecu_checksum(0, size).await.map_err(backup_failed)?;
        let computed = codec::checksum(&data);
        if reported != computed {
            return Err(FlashError::BackupFailed(format!(
                "read-back checksum {:08X} does not match ECU checksum {:08X}",
                computed, reported
            )));
        }

        let job = tracked.job();
        let backup = EcuBackupArtifact::new(
            job.vehicle_id.clone(),
            data,
            reported,
            Some(job.tune_id.clone()),
        );
        self.backups.save(&backup).await?;

        tracked.set_backup(backup.id);
        tracked.log(format!(
            "ECU backup {} stored ({} bytes, checksum {:08X})",
            backup.id,
            backup.len(),
            backup.checksum
        ));
        Ok(backup)
    }

    /// Erase, write and verify inside the critical section
    async fn write(
        &self,
        tracked: &mut TrackedJob,
        section: &CriticalSection<'_>,
        image: &[u8],
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), FlashError> {
        let mut cancel_noted = false;

        tracked.advance(FlashStatus::Erasing).await?;
        let stage = FlashStatus::Erasing;
        section
            .enter_programming()
            .await
            .map_err(|e| interrupted(section, stage, e))?;
        section.erase().await.map_err(|e| interrupted(section, stage, e))?;
        tracked.log("ECU memory erased");
        note_cancel(tracked, cancelled, &mut cancel_noted);

        tracked.advance(FlashStatus::Writing).await?;
        let stage = FlashStatus::Writing;
        let blocks = section
            .write_image(image, self.settings.block_size)
            .await
            .map_err(|e| interrupted(section, stage, e))?;
        tracked.log(format!("Wrote {} bytes in {} blocks", image.len(), blocks));
        note_cancel(tracked, cancelled, &mut cancel_noted);

        tracked.advance(FlashStatus::VerifyingChecksum).await?;
        let stage = FlashStatus::VerifyingChecksum;
        let expected = codec::checksum(image);
        let actual = section
            .checksum(0, image.len() as u32)
            .await
            .map_err(|e| interrupted(section, stage, e))?;
        if actual != expected {
            return Err(FlashError::ChecksumMismatch { expected, actual });
        }
        section
            .exit_programming()
            .await
            .map_err(|e| interrupted(section, stage, e))?;
        tracked.log(format!("ECU checksum {:08X} verified; ECU restarted", actual));
        Ok(())
    }

    /// Fail a job whose ECU memory was never modified
    async fn abandon(&self, mut tracked: TrackedJob, error: FlashError) -> FlashFailure {
        tracked.log("ECU memory untouched; no recovery needed");
        tracked.fail(error.to_string()).await;
        tracked.finish();
        FlashFailure::new(error, tracked.into_job())
    }

    /// Fail a job inside the critical section and restore its backup
    async fn recover(
        &self,
        mut tracked: TrackedJob,
        section: &CriticalSection<'_>,
        backup: &EcuBackupArtifact,
        error: FlashError,
    ) -> FlashFailure {
        tracked.fail(error.to_string()).await;

        if let Err(e) = tracked.advance(FlashStatus::RecoveryInProgress).await {
            warn!(error = %e, "Recovery start could not be committed");
        }

        if let FlashError::WriteInterrupted { stage, ref reason } = error {
            tracked.log(format!(
                "Write interrupted during {}: {}; attempting automatic recovery",
                stage, reason
            ));
            if let Err(e) = section.reconnect().await {
                tracked.log(format!("Adapter unreachable: {}", e));
                tracked
                    .fail("interrupted-write: adapter unreachable, recovery could not be attempted")
                    .await;
                tracked.finish();
                return FlashFailure::new(error, tracked.into_job());
            }
            tracked.log("Adapter reconnected");
        }

        match self.recovery.restore_into(section, backup, &mut tracked).await {
            Ok(()) => {
                if let Err(e) = tracked.advance(FlashStatus::Recovered).await {
                    warn!(error = %e, "Recovered job could not be committed");
                }
                info!(job = %tracked.job().id, "ECU restored from backup");
                tracked.finish();
                FlashFailure::new(error, tracked.into_job())
            }
            Err(recovery_error) => {
                tracked.fail(recovery_error.to_string()).await;
                tracked.finish();
                FlashFailure::new(recovery_error, tracked.into_job())
            }
        }
    }
}

/// Classify a failure inside the critical section
///
/// A timeout that took the link down with it counts as a lost connection.
fn interrupted(section: &CriticalSection<'_>, stage: FlashStatus, error: ObdError) -> FlashError {
    if error.is_connection_loss() || !section.is_link_up() {
        FlashError::WriteInterrupted {
            stage,
            reason: error.to_string(),
        }
    } else {
        FlashError::Obd(error)
    }
}

fn note_package(tracked: &mut TrackedJob, package: &TunePackage, status: PackageStatus) {
    tracked.log(format!("Package {} status: {}", package.id, status));
}

fn ensure_not_cancelled(cancelled: &watch::Receiver<bool>) -> Result<(), FlashError> {
    if *cancelled.borrow() {
        Err(FlashError::Cancelled)
    } else {
        Ok(())
    }
}

fn note_cancel(tracked: &mut TrackedJob, cancelled: &watch::Receiver<bool>, noted: &mut bool) {
    if !*noted && *cancelled.borrow() {
        *noted = true;
        tracked.log("Cancellation requested; deferred until the write has finished");
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    if cancelled.wait_for(|c| *c).await.is_err() {
        // handle dropped without cancelling
        std::future::pending::<()>().await;
    }
}

/// Builder for [`FlashOrchestrator`]
pub struct FlashOrchestratorBuilder {
    client: Arc<VehicleClient>,
    catalog: Arc<dyn PackageCatalog>,
    storage: StorageConfig,
    tracker: Arc<dyn JobTracker>,
    gate: Arc<dyn SafetyGate>,
    verifier: PackageVerifier,
    packages: Option<PackageStore>,
    backups: Option<Arc<dyn BackupStore>>,
    settings: FlashSettings,
}

impl FlashOrchestratorBuilder {
    fn new(client: Arc<VehicleClient>, catalog: Arc<dyn PackageCatalog>, root: PathBuf) -> Self {
        Self {
            client,
            catalog,
            storage: StorageConfig { root },
            tracker: Arc::new(NoopJobTracker),
            gate: Arc::new(AllowAllSafetyGate),
            verifier: PackageVerifier::new(),
            packages: None,
            backups: None,
            settings: FlashSettings::default(),
        }
    }

    pub fn tracker(mut self, tracker: Arc<dyn JobTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn safety_gate(mut self, gate: Arc<dyn SafetyGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Keys trusted for package signatures; none by default
    pub fn verifier(mut self, verifier: PackageVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn package_store(mut self, packages: PackageStore) -> Self {
        self.packages = Some(packages);
        self
    }

    pub fn backup_store(mut self, backups: Arc<dyn BackupStore>) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn settings(mut self, settings: FlashSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> FlashOrchestrator {
        let storage = self.storage;
        let packages = self
            .packages
            .unwrap_or_else(|| PackageStore::new(&storage, reqwest::Client::new()));
        let backups = self
            .backups
            .unwrap_or_else(|| Arc::new(FsBackupStore::new(storage.backups_dir())));
        let reporter = JobReporter::new(
            self.tracker,
            JobJournal::new(storage.jobs_dir()),
            self.settings.report_timeout,
        );
        let recovery = RecoveryController::new(
            self.client.clone(),
            backups.clone(),
            reporter.clone(),
            self.settings.block_size,
        );

        FlashOrchestrator {
            client: self.client,
            catalog: self.catalog,
            gate: self.gate,
            verifier: self.verifier,
            packages,
            backups,
            reporter,
            recovery,
            settings: self.settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructors() {
        let latest = FlashRequest::latest("veh-1", "stage-1");
        assert_eq!(latest.version, VersionSelector::Latest);

        let exact = FlashRequest::exact("veh-1", "stage-1", "1.2.0");
        assert_eq!(exact.version, VersionSelector::Exact("1.2.0".into()));
    }

    #[test]
    fn test_connection_loss_maps_to_interrupted_write() {
        let err = interrupted(
            FlashStatus::Writing,
            ObdError::Transport(revflash_obd::TransportError::ConnectionClosed),
        );
        assert!(matches!(err, FlashError::WriteInterrupted { stage: FlashStatus::Writing, .. }));
        assert!(err.to_string().starts_with("interrupted-write during writing"));

        let err = interrupted(FlashStatus::Erasing, ObdError::Rejected { service: 0x31, nrc: 0x22 });
        assert!(matches!(err, FlashError::Obd(_)));
    }

    #[test]
    fn test_settings_follow_config() {
        let config = FlashConfig::builder("/tmp/x")
            .block_size(64)
            .min_battery_voltage(12.0)
            .build();
        let settings = FlashSettings::from(&config);
        assert_eq!(settings.block_size, 64);
        assert_eq!(settings.min_battery_voltage, 12.0);
        assert_eq!(settings.memory_size, 4096);
    }
}
