//! Backups command - list stored ECU images

use anyhow::{Context, Result};
use revflash_flash::BackupStore;

use crate::output::{BackupRow, OutputContext};

/// List the backups stored for `vehicle_id`, oldest first
pub async fn backups(store: &dyn BackupStore, vehicle_id: &str, ctx: &OutputContext) -> Result<()> {
    let backups = store
        .list(vehicle_id)
        .await
        .with_context(|| format!("Failed to list backups for {}", vehicle_id))?;

    let rows: Vec<BackupRow> = backups
        .into_iter()
        .map(|b| BackupRow {
            id: b.id.to_string(),
            captured_at: b.captured_at.to_rfc3339(),
            checksum: format!("{:08X}", b.checksum),
            source_tune: b.source_tune_id.unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    ctx.print(&rows);
    Ok(())
}
