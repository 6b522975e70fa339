//! Job progress: journaling, events and remote reporting
//!
//! Every state change of a job is committed in the same order:
//! 1. written to the local journal (must succeed)
//! 2. published as a [`FlashEvent`] and a job snapshot
//! 3. reported to the remote tracker (best effort, bounded by a timeout)

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use revflash_core::{FlashJob, FlashStatus, JobTracker, JobUpdate};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::FlashError;
use crate::journal::JobJournal;

const EVENT_CAPACITY: usize = 256;

/// Progress event published by the orchestrator and recovery controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlashEvent {
    StatusChanged {
        job_id: String,
        status: FlashStatus,
        progress: u8,
    },
    Log {
        job_id: String,
        line: String,
    },
    Finished {
        job_id: String,
        status: FlashStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl FlashEvent {
    pub fn job_id(&self) -> &str {
        match self {
            FlashEvent::StatusChanged { job_id, .. }
            | FlashEvent::Log { job_id, .. }
            | FlashEvent::Finished { job_id, .. } => job_id,
        }
    }
}

/// Shared reporting sinks and the set of vehicles with an active job
#[derive(Clone)]
pub(crate) struct JobReporter {
    tracker: Arc<dyn JobTracker>,
    journal: JobJournal,
    events: broadcast::Sender<FlashEvent>,
    report_timeout: Duration,
    active: Arc<Mutex<HashSet<String>>>,
}

impl JobReporter {
    pub(crate) fn new(tracker: Arc<dyn JobTracker>, journal: JobJournal, report_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tracker,
            journal,
            events,
            report_timeout,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.events.subscribe()
    }

    pub(crate) fn journal(&self) -> &JobJournal {
        &self.journal
    }

    /// Mark `vehicle_id` busy until the returned claim is dropped
    pub(crate) fn claim(&self, vehicle_id: &str) -> Option<ActiveClaim> {
        let mut active = self.active.lock();
        if !active.insert(vehicle_id.to_string()) {
            return None;
        }
        Some(ActiveClaim {
            active: self.active.clone(),
            vehicle_id: vehicle_id.to_string(),
        })
    }

    pub(crate) fn is_active(&self, vehicle_id: &str) -> bool {
        self.active.lock().contains(vehicle_id)
    }

    fn emit(&self, event: FlashEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Exclusive claim on a vehicle for one job
pub(crate) struct ActiveClaim {
    active: Arc<Mutex<HashSet<String>>>,
    vehicle_id: String,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.vehicle_id);
    }
}

/// A job together with its reporting state
pub(crate) struct TrackedJob {
    reporter: JobReporter,
    job: FlashJob,
    snapshot: watch::Sender<FlashJob>,
    reported_logs: usize,
}

impl TrackedJob {
    pub(crate) fn new(reporter: JobReporter, job: FlashJob, snapshot: watch::Sender<FlashJob>) -> Self {
        Self {
            reporter,
            job,
            snapshot,
            reported_logs: 0,
        }
    }

    pub(crate) fn job(&self) -> &FlashJob {
        &self.job
    }

    pub(crate) fn into_job(self) -> FlashJob {
        self.job
    }

    pub(crate) fn set_backup(&mut self, backup_id: uuid::Uuid) {
        self.job.backup_id = Some(backup_id);
    }

    /// Register with the remote tracker and journal the pending job
    pub(crate) async fn register(&mut self) -> Result<(), FlashError> {
        let create = self
            .reporter
            .tracker
            .create_job(&self.job.vehicle_id, &self.job.tune_id);
        match tokio::time::timeout(self.reporter.report_timeout, create).await {
            Ok(Ok(remote_id)) => {
                debug!(job = %self.job.id, %remote_id, "Job registered with tracker");
                self.job.remote_id = Some(remote_id);
            }
            Ok(Err(e)) => warn!(job = %self.job.id, error = %e, "Job tracker unavailable; continuing locally"),
            Err(_) => warn!(job = %self.job.id, "Job tracker timed out; continuing locally"),
        }
        self.commit().await
    }

    /// Append a log line
    pub(crate) fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(job = %self.job.id, "{}", line);
        self.job.push_log(line.clone());
        self.snapshot.send_replace(self.job.clone());
        self.reporter.emit(FlashEvent::Log {
            job_id: self.job.id.clone(),
            line,
        });
    }

    /// Move to `next` and commit the change
    pub(crate) async fn advance(&mut self, next: FlashStatus) -> Result<(), FlashError> {
        self.job.transition(next)?;
        info!(job = %self.job.id, status = %next, progress = self.job.progress_percent, "Flash job advanced");
        self.commit().await
    }

    /// Mark the job failed and commit
    ///
    /// Journal errors are logged only; the failure itself is what matters.
    pub(crate) async fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(e) = self.job.fail(reason.clone()) {
            warn!(job = %self.job.id, error = %e, "Could not mark job failed");
            return;
        }
        self.reporter.emit(FlashEvent::Log {
            job_id: self.job.id.clone(),
            line: format!("FAILED: {}", reason),
        });
        if let Err(e) = self.commit().await {
            warn!(job = %self.job.id, error = %e, "Failed to journal job failure");
        }
    }

    /// Journal, publish and report the current state
    pub(crate) async fn commit(&mut self) -> Result<(), FlashError> {
        self.reporter.journal.record(&self.job).await?;

        self.snapshot.send_replace(self.job.clone());
        self.reporter.emit(FlashEvent::StatusChanged {
            job_id: self.job.id.clone(),
            status: self.job.status,
            progress: self.job.progress_percent,
        });

        if self.job.status != FlashStatus::Pending {
            self.report().await;
        }
        Ok(())
    }

    async fn report(&mut self) {
        let Some(remote_id) = self.job.remote_id.clone() else {
            debug!(job = %self.job.id, "No remote job; report skipped");
            return;
        };

        let update = JobUpdate {
            status: self.job.status,
            progress: self.job.progress_percent,
            logs: self.job.log[self.reported_logs..].to_vec(),
        };
        let send = self.reporter.tracker.update_job(&remote_id, &update);
        match tokio::time::timeout(self.reporter.report_timeout, send).await {
            Ok(Ok(())) => self.reported_logs = self.job.log.len(),
            Ok(Err(e)) => warn!(job = %self.job.tracking_id(), error = %e, "Progress report failed"),
            Err(_) => warn!(job = %self.job.tracking_id(), "Progress report timed out"),
        }
    }

    /// Publish the terminal event
    pub(crate) fn finish(&self) {
        self.reporter.emit(FlashEvent::Finished {
            job_id: self.job.id.clone(),
            status: self.job.status,
            reason: self.job.failure_reason.clone(),
        });
    }
}
