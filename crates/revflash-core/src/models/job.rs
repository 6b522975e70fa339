//! Flash job model and lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// State of a flash job.
///
/// # Lifecycle
///
/// ```text
/// Pending → Resolving → Downloading → Verifying → BackingUp
///         → Erasing → Writing → VerifyingChecksum → Completed
///
/// any state except Completed ──failure──▶ Failed
/// Failed ──(backup exists)──▶ RecoveryInProgress ──▶ Recovered
///                                      └──────────▶ Failed
/// ```
///
/// A standalone restore starts at `Pending` and moves straight to
/// `RecoveryInProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashStatus {
    Pending,
    Resolving,
    Downloading,
    Verifying,
    BackingUp,
    Erasing,
    Writing,
    VerifyingChecksum,
    Completed,
    Failed,
    RecoveryInProgress,
    Recovered,
}

impl FlashStatus {
    /// Forward stages in order, `Pending` first
    pub const FORWARD: [FlashStatus; 9] = [
        FlashStatus::Pending,
        FlashStatus::Resolving,
        FlashStatus::Downloading,
        FlashStatus::Verifying,
        FlashStatus::BackingUp,
        FlashStatus::Erasing,
        FlashStatus::Writing,
        FlashStatus::VerifyingChecksum,
        FlashStatus::Completed,
    ];

    /// Number of forward transitions after `Pending`
    pub const TOTAL_STAGES: usize = Self::FORWARD.len() - 1;

    /// Position in the forward pipeline (`Pending` = 0), if this is a forward stage
    pub fn stage_index(&self) -> Option<usize> {
        Self::FORWARD.iter().position(|s| s == self)
    }

    /// Progress reported when this stage is entered
    pub fn progress_percent(&self) -> Option<u8> {
        self.stage_index()
            .map(|i| (i * 100 / Self::TOTAL_STAGES) as u8)
    }

    /// Stages that modify ECU memory
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            FlashStatus::Erasing | FlashStatus::Writing | FlashStatus::VerifyingChecksum
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashStatus::Completed | FlashStatus::Failed | FlashStatus::Recovered
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: FlashStatus) -> bool {
        use FlashStatus::*;
        match (*self, next) {
            (Completed, _) | (Recovered, _) => false,
            (RecoveryInProgress, Recovered) | (RecoveryInProgress, Failed) => true,
            (RecoveryInProgress, _) => false,
            (Failed, RecoveryInProgress) => true,
            (Failed, _) => false,
            (Pending, RecoveryInProgress) => true,
            (_, Failed) => true,
            (from, to) => match (from.stage_index(), to.stage_index()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }

    /// Wire name used by the remote job tracker
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashStatus::Pending => "pending",
            FlashStatus::Resolving => "resolving",
            FlashStatus::Downloading => "downloading",
            FlashStatus::Verifying => "verifying",
            FlashStatus::BackingUp => "backing_up",
            FlashStatus::Erasing => "erasing",
            FlashStatus::Writing => "writing",
            FlashStatus::VerifyingChecksum => "verifying_checksum",
            FlashStatus::Completed => "completed",
            FlashStatus::Failed => "failed",
            FlashStatus::RecoveryInProgress => "recovery_in_progress",
            FlashStatus::Recovered => "recovered",
        }
    }
}

impl std::fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlashStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashStatus::FORWARD
            .iter()
            .chain(&[
                FlashStatus::Failed,
                FlashStatus::RecoveryInProgress,
                FlashStatus::Recovered,
            ])
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown flash status: '{}'", s))
    }
}

/// A single flash attempt against one vehicle.
///
/// The local copy is authoritative; the remote tracker only mirrors it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashJob {
    /// Local job identifier
    pub id: String,
    /// Identifier assigned by the remote job tracker, if it could be reached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub vehicle_id: String,
    pub tune_id: String,
    pub status: FlashStatus,
    pub progress_percent: u8,
    /// Ordered, append-only log
    pub log: Vec<String>,
    /// Human-readable reason when the job failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Backup captured for this attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlashJob {
    pub fn new(vehicle_id: impl Into<String>, tune_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_id: None,
            vehicle_id: vehicle_id.into(),
            tune_id: tune_id.into(),
            status: FlashStatus::Pending,
            progress_percent: 0,
            log: Vec::new(),
            failure_reason: None,
            backup_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, updating progress for forward stages
    pub fn transition(&mut self, next: FlashStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if let Some(progress) = next.progress_percent() {
            self.progress_percent = progress;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the job failed with a reason; the reason is also logged
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        let reason = reason.into();
        self.transition(FlashStatus::Failed)?;
        self.push_log(format!("FAILED: {}", reason));
        self.failure_reason = Some(reason);
        Ok(())
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
        self.updated_at = Utc::now();
    }

    /// Identifier to report under (remote when known, local otherwise)
    pub fn tracking_id(&self) -> &str {
        self.remote_id.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_forward_progress_is_monotonic() {
        let progress: Vec<u8> = FlashStatus::FORWARD
            .iter()
            .skip(1)
            .filter_map(|s| s.progress_percent())
            .collect();
        assert_eq!(progress, vec![12, 25, 37, 50, 62, 75, 87, 100]);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = FlashJob::new("veh-1", "tune-1");
        for next in FlashStatus::FORWARD.iter().skip(1) {
            job.transition(*next).unwrap();
        }
        assert_eq!(job.status, FlashStatus::Completed);
        assert_eq!(job.progress_percent, 100);
    }

    #[test]
    fn test_cannot_skip_backup() {
        let mut job = FlashJob::new("veh-1", "tune-1");
        job.transition(FlashStatus::Resolving).unwrap();
        job.transition(FlashStatus::Downloading).unwrap();
        job.transition(FlashStatus::Verifying).unwrap();
        let err = job.transition(FlashStatus::Erasing).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: FlashStatus::Verifying,
                to: FlashStatus::Erasing
            }
        );
    }

    #[test]
    fn test_failure_and_recovery_branch() {
        let mut job = FlashJob::new("veh-1", "tune-1");
        job.transition(FlashStatus::Resolving).unwrap();
        job.fail("catalog offline").unwrap();
        assert_eq!(job.failure_reason.as_deref(), Some("catalog offline"));
        assert!(job.log.last().unwrap().contains("catalog offline"));

        job.transition(FlashStatus::RecoveryInProgress).unwrap();
        job.transition(FlashStatus::Recovered).unwrap();
        assert!(job.status.is_terminal());
        assert!(job.transition(FlashStatus::Failed).is_err());
    }

    #[test]
    fn test_completed_cannot_fail() {
        assert!(!FlashStatus::Completed.can_transition_to(FlashStatus::Failed));
        assert!(FlashStatus::Writing.can_transition_to(FlashStatus::Failed));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            FlashStatus::VerifyingChecksum,
            FlashStatus::RecoveryInProgress,
            FlashStatus::Pending,
        ] {
            assert_eq!(status.as_str().parse::<FlashStatus>().unwrap(), status);
        }
        assert!("flashing".parse::<FlashStatus>().is_err());
    }
}
