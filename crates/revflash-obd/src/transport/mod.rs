//! Transport layer for adapter communication
//!
//! This module provides transport adapters that carry ASCII diagnostic
//! commands to a vehicle:
//! - Simulator adapter backed by an in-memory ECU
//! - TCP adapter for ELM327-compatible Wi-Fi dongles
//!
//! # Example
//!
//! ```ignore
//! use revflash_obd::transport::create_adapter;
//! use revflash_obd::config::AdapterConfig;
//!
//! let adapter = create_adapter(&AdapterConfig::default());
//! adapter.connect().await?;
//! let raw = adapter.send("010C").await?;
//! ```

mod adapter;
pub mod error;
pub mod simulator;
mod state;
pub mod tcp;

pub use adapter::TransportAdapter;
pub use error::TransportError;
pub use simulator::SimulatorAdapter;
pub use state::StatePublisher;
pub use tcp::TcpAdapter;

use std::sync::Arc;

use crate::config::AdapterConfig;

/// Create a transport adapter based on configuration
///
/// The adapter starts out `Disconnected`; call `connect` before sending.
pub fn create_adapter(config: &AdapterConfig) -> Arc<dyn TransportAdapter> {
    match config {
        AdapterConfig::Simulator(cfg) => Arc::new(SimulatorAdapter::new(cfg)),
        AdapterConfig::Tcp(cfg) => Arc::new(TcpAdapter::new(cfg)),
    }
}
