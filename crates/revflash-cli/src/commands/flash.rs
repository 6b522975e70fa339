//! Flash command - install a tune package

use std::sync::Arc;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use revflash_core::FlashStatus;
use revflash_flash::{FlashEvent, FlashOrchestrator, FlashRequest};
use tokio::sync::broadcast::error::RecvError;

use crate::output::OutputContext;

/// Run one flash job, following its events until it finishes
///
/// The first Ctrl+C requests cancellation; the job decides whether it can
/// still stop before ECU memory is touched.
pub async fn flash(
    orchestrator: Arc<FlashOrchestrator>,
    request: FlashRequest,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info(&format!(
        "Flashing {} ({}) onto {}",
        request.tune_id, request.version, request.vehicle_id
    ));

    let mut events = orchestrator.subscribe();
    let handle = orchestrator.spawn(request);
    let job_id = handle.job_id().to_string();

    let pb = if ctx.is_json() || ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_message(FlashStatus::Pending.to_string());

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.job_id() == job_id => {
                    if ctx.is_json() {
                        ctx.event(&event);
                    }
                    match event {
                        FlashEvent::StatusChanged { status, progress, .. } => {
                            pb.set_position(u64::from(progress));
                            pb.set_message(status.to_string());
                        }
                        FlashEvent::Log { line, .. } => pb.println(format!("  {}", line)),
                        FlashEvent::Finished { .. } => break,
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    pb.println(format!("  ({} events skipped)", missed));
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                pb.println("  Cancellation requested");
                handle.cancel();
            }
        }
    }

    match handle.wait().await {
        Ok(job) => {
            pb.finish_with_message(job.status.to_string());
            ctx.success(&format!("\nFlash job {} completed", job.id));
            Ok(())
        }
        Err(failure) => {
            pb.abandon_with_message(failure.job.status.to_string());
            if failure.job.status == FlashStatus::Recovered {
                ctx.warn("Previous ECU image was restored from backup");
            }
            bail!(failure)
        }
    }
}
