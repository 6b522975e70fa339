//! Transport adapter trait

use async_trait::async_trait;
use revflash_core::ConnectionState;
use tokio::sync::broadcast;

use super::TransportError;

/// Transport-agnostic interface to an OBD-II adapter
///
/// Implementations carry one ASCII command at a time and return the raw
/// response text. They do not queue; serialization is the job of
/// [`VehicleClient`](crate::client::VehicleClient).
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Open the link to the adapter
    ///
    /// Moves through `Connecting` to `Connected`, or to `Error` on failure.
    /// Calling this while already connected is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the link
    ///
    /// Any command in flight fails with `ConnectionClosed`.
    async fn disconnect(&self);

    /// Send one command and wait for its complete response text
    ///
    /// # Arguments
    /// * `command` - ASCII command without line terminator, e.g. `"010C"`
    ///
    /// # Returns
    /// The response with the adapter prompt removed, e.g. `"41 0C 1F 40"`
    async fn send(&self, command: &str) -> Result<String, TransportError>;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Subscribe to connection state changes
    ///
    /// Every transition is emitted exactly once, in order.
    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}
