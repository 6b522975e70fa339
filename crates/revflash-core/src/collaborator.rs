//! Traits implemented by remote collaborators of the flash pipeline
//!
//! The orchestrator only talks to these traits; concrete HTTP clients live in
//! `revflash-flash`, and tests substitute in-memory versions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollaboratorResult;
use crate::models::{FlashStatus, TunePackage, VersionSelector};

/// Progress report sent to the remote job tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: FlashStatus,
    pub progress: u8,
    /// Log lines added since the previous update
    pub logs: Vec<String>,
}

/// Remote job tracker (advisory mirror of local flash jobs)
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Register a new job and return the tracker's identifier for it
    async fn create_job(&self, vehicle_id: &str, tune_id: &str) -> CollaboratorResult<String>;

    /// Report a state change
    async fn update_job(&self, job_id: &str, update: &JobUpdate) -> CollaboratorResult<()>;
}

/// Remote tune catalog
#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn resolve(
        &self,
        tune_id: &str,
        selector: &VersionSelector,
    ) -> CollaboratorResult<TunePackage>;
}

/// Outcome of a safety analysis for a tune/vehicle pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub passed: bool,
    pub risk_score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Safety-analysis gate consulted before a flash starts
#[async_trait]
pub trait SafetyGate: Send + Sync {
    async fn evaluate(&self, tune_id: &str, vehicle_id: &str) -> CollaboratorResult<SafetyVerdict>;
}

/// Tracker that accepts every report and hands out random identifiers
#[derive(Debug, Default, Clone)]
pub struct NoopJobTracker;

#[async_trait]
impl JobTracker for NoopJobTracker {
    async fn create_job(&self, _vehicle_id: &str, _tune_id: &str) -> CollaboratorResult<String> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn update_job(&self, _job_id: &str, _update: &JobUpdate) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// Gate that passes every tune with a zero risk score
#[derive(Debug, Default, Clone)]
pub struct AllowAllSafetyGate;

#[async_trait]
impl SafetyGate for AllowAllSafetyGate {
    async fn evaluate(&self, _tune_id: &str, _vehicle_id: &str) -> CollaboratorResult<SafetyVerdict> {
        Ok(SafetyVerdict {
            passed: true,
            risk_score: 0.0,
            reasons: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_gate_passes() {
        let verdict = AllowAllSafetyGate.evaluate("tune", "vehicle").await.unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.risk_score, 0.0);
    }

    #[tokio::test]
    async fn test_noop_tracker_issues_distinct_ids() {
        let tracker = NoopJobTracker;
        let a = tracker.create_job("v", "t").await.unwrap();
        let b = tracker.create_job("v", "t").await.unwrap();
        assert_ne!(a, b);
    }
}
