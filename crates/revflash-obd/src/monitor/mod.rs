//! Live telemetry monitoring

mod poller;

pub use poller::TelemetryPoller;
