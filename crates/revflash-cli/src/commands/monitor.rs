//! Monitor command - live telemetry

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use revflash_core::TelemetrySample;
use revflash_obd::{PollerConfig, TelemetryPoller, VehicleClient};

use crate::output::OutputContext;

/// Print telemetry samples until Ctrl+C or `duration` elapses
pub async fn monitor(
    client: Arc<VehicleClient>,
    config: PollerConfig,
    duration: Option<Duration>,
    ctx: &OutputContext,
) -> Result<()> {
    let poller = TelemetryPoller::new(client, config.clone());
    poller
        .start_monitoring()
        .await
        .context("Failed to start telemetry polling")?;

    ctx.info(&format!(
        "Polling every {} ms. Press Ctrl+C to stop",
        config.interval_ms
    ));

    let mut samples = poller.subscribe();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            changed = samples.changed() => {
                if changed.is_err() {
                    ctx.warn("Telemetry stream ended");
                    break;
                }
                let sample = samples.borrow_and_update().clone();
                print_sample(&sample, ctx);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                ctx.info("\nStopping...");
                break;
            }
        }
    }

    poller.stop_monitoring().await;
    ctx.success(&format!("{} poll cycles completed", poller.cycle_count()));
    Ok(())
}

fn print_sample(sample: &TelemetrySample, ctx: &OutputContext) {
    if ctx.is_json() {
        println!(
            "{}",
            serde_json::to_string(sample).unwrap_or_else(|_| "null".to_string())
        );
        return;
    }
    ctx.info(&format!(
        "{}  rpm {:>6.0}  speed {:>3} km/h  throttle {:>5.1}%",
        sample.captured_at.format("%H:%M:%S%.3f"),
        sample.engine_rpm,
        sample.speed_kph,
        sample.throttle_percent
    ));
}
