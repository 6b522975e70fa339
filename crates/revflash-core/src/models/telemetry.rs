//! Live telemetry models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest live reading published by the telemetry poller.
///
/// Consumers always observe the most recent sample, never a backlog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Engine speed in revolutions per minute
    pub engine_rpm: f64,
    /// Vehicle speed in km/h
    pub speed_kph: u32,
    /// Throttle position, 0-100 %
    pub throttle_percent: f64,
    /// When the poll cycle that produced this sample finished
    pub captured_at: DateTime<Utc>,
}
