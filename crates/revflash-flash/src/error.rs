//! Error types for package verification, backups and flashing

use revflash_core::{FlashJob, FlashStatus, JobError};
use revflash_obd::ObdError;
use thiserror::Error;

/// Package integrity failures
///
/// Every variant is fatal to the flash job that hit it.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    /// A configured trusted key could not be decoded
    #[error("Invalid trusted key '{key_id}': {reason}")]
    InvalidKey { key_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backup store failures
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backup metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Stored image no longer matches its recorded checksum
    #[error("Backup {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Flash pipeline errors
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Safety gate rejected tune: {0}")]
    SafetyGateRejected(String),

    #[error("Could not resolve package: {0}")]
    Resolve(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Package rejected: {0}")]
    Verify(#[from] VerifyError),

    #[error("Package image unusable: {0}")]
    InvalidImage(String),

    #[error("Battery voltage {actual:.1} V is below the {minimum:.1} V minimum")]
    LowVoltage { actual: f64, minimum: f64 },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// The link dropped while ECU memory was being modified
    #[error("interrupted-write during {stage}: {reason}")]
    WriteInterrupted { stage: FlashStatus, reason: String },

    #[error("Checksum mismatch: expected {expected:08X}, ECU reports {actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("No verified backup for vehicle {0}")]
    NoBackup(String),

    #[error("Flash cancelled")]
    Cancelled,

    #[error("A flash job is already active for vehicle {0}")]
    AlreadyActive(String),

    #[error("Diagnostic error: {0}")]
    Obd(#[from] ObdError),

    #[error("Job state error: {0}")]
    Job(#[from] JobError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<BackupError> for FlashError {
    fn from(err: BackupError) -> Self {
        FlashError::BackupFailed(err.to_string())
    }
}

/// A flash or restore that did not complete, with the job as it ended
///
/// `job.status` tells whether recovery succeeded (`Recovered`) or not
/// (`Failed`); `job.log` holds the full history.
#[derive(Debug, Error)]
#[error("{error} (job {} ended {})", .job.id, .job.status)]
pub struct FlashFailure {
    pub error: FlashError,
    pub job: Box<FlashJob>,
}

impl FlashFailure {
    pub fn new(error: FlashError, job: FlashJob) -> Self {
        Self {
            error,
            job: Box::new(job),
        }
    }
}
