//! Fixed-cadence telemetry poller
//!
//! Each cycle takes the vehicle session without waiting. While a flash job
//! or restore owns the session the cycle is skipped, so polling stays
//! suspended until that owner releases it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use revflash_core::{ConnectionState, TelemetrySample};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::client::{SessionOwner, VehicleClient};
use crate::config::PollerConfig;
use crate::error::ObdError;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls engine speed, vehicle speed and throttle at a fixed interval
pub struct TelemetryPoller {
    client: Arc<VehicleClient>,
    config: PollerConfig,
    latest: Arc<watch::Sender<TelemetrySample>>,
    running: Mutex<Option<Running>>,
    suspended: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
}

impl TelemetryPoller {
    pub fn new(client: Arc<VehicleClient>, config: PollerConfig) -> Self {
        let (latest, _) = watch::channel(TelemetrySample::default());
        Self {
            client,
            config,
            latest: Arc::new(latest),
            running: Mutex::new(None),
            suspended: Arc::new(AtomicBool::new(false)),
            cycles: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the polling loop; no-op if already running
    ///
    /// Connects the adapter first when it is disconnected.
    pub async fn start_monitoring(&self) -> Result<(), ObdError> {
        if self.is_monitoring() {
            return Ok(());
        }
        if self.client.connection_state() == ConnectionState::Disconnected {
            self.client.connect().await?;
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(poll_loop(
            self.client.clone(),
            Duration::from_millis(self.config.interval_ms.max(1)),
            self.latest.clone(),
            self.suspended.clone(),
            self.cycles.clone(),
            shutdown_rx,
        ));
        *running = Some(Running { shutdown, handle });
        info!(interval_ms = self.config.interval_ms, "Telemetry monitoring started");
        Ok(())
    }

    /// Stop the loop and wait for the current cycle to finish
    pub async fn stop_monitoring(&self) {
        let running = self.running.lock().take();
        if let Some(Running { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            let _ = handle.await;
            self.suspended.store(false, Ordering::SeqCst);
            info!("Telemetry monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Whether the last cycle was skipped because another owner held the session
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Most recent sample
    pub fn latest(&self) -> TelemetrySample {
        self.latest.borrow().clone()
    }

    /// Watch for new samples; only the latest value is retained
    pub fn subscribe(&self) -> watch::Receiver<TelemetrySample> {
        self.latest.subscribe()
    }

    /// Number of completed poll cycles
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.handle.abort();
        }
    }
}

async fn poll_loop(
    client: Arc<VehicleClient>,
    period: Duration,
    latest: Arc<watch::Sender<TelemetrySample>>,
    suspended: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let session = match client.try_acquire_session(SessionOwner::Poller) {
            Ok(session) => session,
            Err(_) => {
                if !suspended.swap(true, Ordering::SeqCst) {
                    info!(
                        owner = ?client.session_owner(),
                        "Telemetry polling suspended"
                    );
                }
                continue;
            }
        };
        if suspended.swap(false, Ordering::SeqCst) {
            info!("Telemetry polling resumed");
        }

        let sample = poll_once(&client).await;
        drop(session);

        latest.send_replace(sample);
        cycles.fetch_add(1, Ordering::SeqCst);
    }
}

/// One cycle of chained reads; a failed metric reads as zero
async fn poll_once(client: &VehicleClient) -> TelemetrySample {
    let engine_rpm = client.read_rpm().await.unwrap_or_else(|e| {
        debug!(error = %e, "RPM read failed");
        0.0
    });
    let speed_kph = client.read_speed().await.unwrap_or_else(|e| {
        debug!(error = %e, "Speed read failed");
        0
    });
    let throttle_percent = client.read_throttle().await.unwrap_or_else(|e| {
        debug!(error = %e, "Throttle read failed");
        0.0
    });

    TelemetrySample {
        engine_rpm,
        speed_kph,
        throttle_percent,
        captured_at: Utc::now(),
    }
}
