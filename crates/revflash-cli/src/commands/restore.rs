//! Restore command - write the latest backup back to the ECU

use anyhow::{bail, Result};
use revflash_flash::FlashOrchestrator;
use tokio::sync::broadcast::error::RecvError;

use crate::output::OutputContext;

/// Restore the most recent backup of `vehicle_id`
pub async fn restore(
    orchestrator: &FlashOrchestrator,
    vehicle_id: &str,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info(&format!("Restoring latest backup of {}", vehicle_id));

    let mut events = orchestrator.subscribe();
    let restore = orchestrator.restore_latest(vehicle_id);
    tokio::pin!(restore);

    let mut open = true;
    let result = loop {
        tokio::select! {
            result = &mut restore => break result,
            event = events.recv(), if open => match event {
                Ok(event) => ctx.event(&event),
                Err(RecvError::Lagged(missed)) => ctx.warn(&format!("({} events skipped)", missed)),
                Err(RecvError::Closed) => open = false,
            },
        }
    };

    // Drain whatever was published before the restore returned
    while let Ok(event) = events.try_recv() {
        ctx.event(&event);
    }

    match result {
        Ok(job) => {
            ctx.success(&format!("Restore job {} finished: {}", job.id, job.status));
            Ok(())
        }
        Err(failure) => bail!(failure),
    }
}
