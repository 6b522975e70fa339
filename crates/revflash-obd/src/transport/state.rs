//! Connection state bookkeeping shared by the adapters

use revflash_core::ConnectionState;
use tokio::sync::{broadcast, watch};

/// Publishes connection state transitions
///
/// Holds the latest value for synchronous reads and fans transitions out to
/// subscribers. Publishing the current state again is ignored so each
/// transition is observed once.
pub struct StatePublisher {
    current: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionState>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self { current, events }
    }

    /// Record a new state; returns false if it equals the current one
    pub fn publish(&self, state: ConnectionState) -> bool {
        let changed = self.current.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            tracing::debug!(%state, "Adapter state changed");
            let _ = self.events.send(state);
        }
        changed
    }

    pub fn current(&self) -> ConnectionState {
        self.current.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current.borrow().is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    /// Resolves once the link is no longer `Connected`
    pub async fn lost(&self) {
        let mut rx = self.current.subscribe();
        let _ = rx.wait_for(|state| !state.is_connected()).await;
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_states_are_suppressed() {
        let publisher = StatePublisher::new();
        let mut rx = publisher.subscribe();

        assert!(publisher.publish(ConnectionState::Connecting));
        assert!(publisher.publish(ConnectionState::Connected));
        assert!(!publisher.publish(ConnectionState::Connected));
        assert!(publisher.publish(ConnectionState::Disconnected));

        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_resolves_on_error() {
        let publisher = std::sync::Arc::new(StatePublisher::new());
        publisher.publish(ConnectionState::Connected);

        let waiter = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.lost().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        publisher.publish(ConnectionState::Error("link lost".into()));
        waiter.await.unwrap();
    }
}
