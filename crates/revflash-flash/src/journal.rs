//! Local flash job journal
//!
//! The local job record is authoritative. Every state transition is written
//! here before the next stage starts, so the history survives a crash even
//! when the remote tracker never heard about it.

use std::path::{Path, PathBuf};

use revflash_core::FlashJob;
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

use crate::error::FlashError;

/// One JSON file per job under a directory
#[derive(Debug, Clone)]
pub struct JobJournal {
    dir: PathBuf,
}

impl JobJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Durably replace the stored copy of `job`
    pub async fn record(&self, job: &FlashJob) -> Result<(), FlashError> {
        let storage = |e: std::io::Error| FlashError::Storage(format!("journal {}: {}", job.id, e));

        tokio::fs::create_dir_all(&self.dir).await.map_err(storage)?;
        let bytes = serde_json::to_vec_pretty(job)
            .map_err(|e| FlashError::Storage(format!("journal {}: {}", job.id, e)))?;

        let target = self.path_for(&job.id);
        let tmp = target.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(storage)?;
        file.write_all(&bytes).await.map_err(storage)?;
        file.sync_all().await.map_err(storage)?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await.map_err(storage)?;

        trace!(job = %job.id, status = %job.status, "Job journaled");
        Ok(())
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<FlashJob>, FlashError> {
        match tokio::fs::read(self.path_for(job_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| FlashError::Storage(format!("journal {}: {}", job_id, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FlashError::Storage(format!("journal {}: {}", job_id, e))),
        }
    }

    /// Every journaled job, oldest first
    pub async fn list(&self) -> Result<Vec<FlashJob>, FlashError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FlashError::Storage(e.to_string())),
        };

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FlashError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<FlashJob>(&bytes) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revflash_core::FlashStatus;

    #[tokio::test]
    async fn test_record_overwrites_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path().join("jobs"));
        let mut job = FlashJob::new("veh-1", "tune-1");

        journal.record(&job).await.unwrap();
        job.transition(FlashStatus::Resolving).unwrap();
        job.push_log("resolving");
        journal.record(&job).await.unwrap();

        let loaded = journal.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(!journal.path_for(&job.id).with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_job_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path());
        assert!(journal.load("nope").await.unwrap().is_none());

        let first = FlashJob::new("veh-1", "a");
        let second = FlashJob::new("veh-1", "b");
        journal.record(&second).await.unwrap();
        journal.record(&first).await.unwrap();

        let jobs = journal.list().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].tune_id, "a");
    }
}
