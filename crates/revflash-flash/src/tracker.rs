//! HTTP client for the remote flash job tracker
//!
//! The tracker mirrors local jobs for UIs and support tooling:
//! - create: `POST /garage/flash-jobs/` with `{vehicle_id, tune_id}`
//! - update: `PATCH /garage/flash-jobs/{id}/` with `{status, stage, progress, logs}`
//!
//! The tracker knows only four coarse statuses; the exact local stage is
//! sent alongside in `stage`.

use async_trait::async_trait;
use revflash_core::{
    CollaboratorError, CollaboratorResult, FlashStatus, JobTracker, JobUpdate,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::{RemoteConfig, TimeoutsConfig};
use crate::remote::RemoteClient;

/// Coarse job status understood by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteJobStatus {
    Pending,
    Flashing,
    Completed,
    Failed,
}

impl From<FlashStatus> for RemoteJobStatus {
    fn from(status: FlashStatus) -> Self {
        match status {
            FlashStatus::Pending => RemoteJobStatus::Pending,
            FlashStatus::Completed => RemoteJobStatus::Completed,
            // a recovered job still did not flash the tune
            FlashStatus::Failed | FlashStatus::Recovered => RemoteJobStatus::Failed,
            _ => RemoteJobStatus::Flashing,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub vehicle_id: String,
    pub tune_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub status: RemoteJobStatus,
    pub stage: FlashStatus,
    pub progress: u8,
    pub logs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    id: serde_json::Value,
}

/// Job tracker reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpJobTracker {
    remote: RemoteClient,
}

impl HttpJobTracker {
    pub fn new(remote: &RemoteConfig, timeouts: &TimeoutsConfig) -> CollaboratorResult<Self> {
        let remote = RemoteClient::new(remote, timeouts)?;
        info!("Job tracker client created for {}", remote.base_url());
        Ok(Self { remote })
    }
}

#[async_trait]
impl JobTracker for HttpJobTracker {
    #[instrument(skip(self))]
    async fn create_job(&self, vehicle_id: &str, tune_id: &str) -> CollaboratorResult<String> {
        let url = self.remote.url("garage/flash-jobs/")?;
        let body = CreateJobRequest {
            vehicle_id: vehicle_id.to_string(),
            tune_id: tune_id.to_string(),
        };

        let response = self.remote.send(self.remote.post(url).json(&body)).await?;
        let created: CreateJobResponse = self.remote.handle_response(response).await?;

        // the tracker issues numeric ids; accept strings too
        let id = match created.id {
            serde_json::Value::String(id) => id,
            serde_json::Value::Number(id) => id.to_string(),
            other => {
                return Err(CollaboratorError::InvalidResponse(format!(
                    "unexpected job id: {}",
                    other
                )))
            }
        };
        debug!(%id, "Remote job created");
        Ok(id)
    }

    #[instrument(skip(self, update), fields(status = %update.status, progress = update.progress))]
    async fn update_job(&self, job_id: &str, update: &JobUpdate) -> CollaboratorResult<()> {
        let url = self.remote.url(&format!("garage/flash-jobs/{}/", job_id))?;
        let body = UpdateJobRequest {
            status: update.status.into(),
            stage: update.status,
            progress: update.progress,
            logs: update.logs.clone(),
        };

        let response = self.remote.send(self.remote.patch(url).json(&body)).await?;
        RemoteClient::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_mapping() {
        assert_eq!(RemoteJobStatus::from(FlashStatus::Pending), RemoteJobStatus::Pending);
        assert_eq!(RemoteJobStatus::from(FlashStatus::Writing), RemoteJobStatus::Flashing);
        assert_eq!(
            RemoteJobStatus::from(FlashStatus::RecoveryInProgress),
            RemoteJobStatus::Flashing
        );
        assert_eq!(RemoteJobStatus::from(FlashStatus::Completed), RemoteJobStatus::Completed);
        assert_eq!(RemoteJobStatus::from(FlashStatus::Recovered), RemoteJobStatus::Failed);
    }

    #[test]
    fn test_update_body_shape() {
        let body = UpdateJobRequest {
            status: FlashStatus::BackingUp.into(),
            stage: FlashStatus::BackingUp,
            progress: 50,
            logs: vec!["Backing up ECU".into()],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "FLASHING");
        assert_eq!(json["stage"], "backing_up");
        assert_eq!(json["progress"], 50);
        assert_eq!(json["logs"][0], "Backing up ECU");
    }
}
