//! revflash-obd - Vehicle diagnostic layer for the ECU flash pipeline
//!
//! This crate talks to a physical or simulated OBD-II adapter using the
//! ASCII hex request/response grammar of ELM327-style interfaces.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐        ┌──────────────────┐
//! │ TelemetryPoller  │        │ FlashOrchestrator│ (revflash-flash)
//! └────────┬─────────┘        └────────┬─────────┘
//!          │   session lock (one owner at a time)
//!          └──────────────┬────────────┘
//!                 ┌───────┴────────┐
//!                 │ VehicleClient  │  FIFO command queue,
//!                 │                │  critical sections
//!                 └───────┬────────┘
//!                 ┌───────┴────────┐
//!                 │     codec      │  hex framing, PID formulas
//!                 └───────┬────────┘
//!                 ┌───────┴────────┐
//!                 │TransportAdapter│  simulator / TCP (Wi-Fi)
//!                 └────────────────┘
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod monitor;
pub mod transport;

pub use client::{CriticalSection, SessionGuard, SessionOwner, VehicleClient};
pub use codec::{DiagnosticRequest, DiagnosticResponse, Pid, RequestKind};
pub use config::{AdapterConfig, ClientConfig, PollerConfig, SimulatorConfig, TcpConfig};
pub use error::ObdError;
pub use monitor::TelemetryPoller;
pub use transport::{create_adapter, SimulatorAdapter, TcpAdapter, TransportAdapter, TransportError};

// Re-export for convenience
pub use revflash_core::{ConnectionState, TelemetrySample};
