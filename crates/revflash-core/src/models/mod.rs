//! Shared data models for the flash pipeline

mod backup;
mod connection;
mod job;
mod package;
mod telemetry;

pub use backup::*;
pub use connection::*;
pub use job::*;
pub use package::*;
pub use telemetry::*;
