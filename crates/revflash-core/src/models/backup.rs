//! ECU memory backup artifacts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of ECU memory taken before any destructive flash step.
///
/// Backups are never overwritten: each attempt produces a new artifact and
/// recovery targets the most recent one for the vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuBackupArtifact {
    pub id: Uuid,
    pub vehicle_id: String,
    pub captured_at: DateTime<Utc>,
    /// CRC-32 reported by the ECU for the captured range
    pub checksum: u32,
    /// Tune that was about to be flashed when the backup was taken
    pub source_tune_id: Option<String>,
    /// Raw memory image (stored next to the metadata, not inside it)
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl EcuBackupArtifact {
    pub fn new(
        vehicle_id: impl Into<String>,
        data: Vec<u8>,
        checksum: u32,
        source_tune_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vehicle_id: vehicle_id.into(),
            captured_at: Utc::now(),
            checksum,
            source_tune_id,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
