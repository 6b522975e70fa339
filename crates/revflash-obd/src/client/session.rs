//! Session ownership and the programming critical section

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use super::VehicleClient;
use crate::codec::{self, DiagnosticRequest};
use crate::error::ObdError;

/// Who currently drives the vehicle connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwner {
    Poller,
    Flash,
    Recovery,
    User,
}

impl fmt::Display for SessionOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionOwner::Poller => "poller",
            SessionOwner::Flash => "flash",
            SessionOwner::Recovery => "recovery",
            SessionOwner::User => "user",
        };
        f.write_str(name)
    }
}

/// Exclusive ownership of a [`VehicleClient`]
///
/// Released on drop.
pub struct SessionGuard {
    owner: SessionOwner,
    slot: Arc<Mutex<Option<SessionOwner>>>,
    _lock: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub(super) fn new(
        owner: SessionOwner,
        lock: OwnedMutexGuard<()>,
        slot: Arc<Mutex<Option<SessionOwner>>>,
    ) -> Self {
        *slot.lock() = Some(owner);
        if owner != SessionOwner::Poller {
            info!(%owner, "Vehicle session acquired");
        }
        Self {
            owner,
            slot,
            _lock: lock,
        }
    }

    pub fn owner(&self) -> SessionOwner {
        self.owner
    }

    pub(super) fn belongs_to(&self, slot: &Arc<Mutex<Option<SessionOwner>>>) -> bool {
        Arc::ptr_eq(&self.slot, slot)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self.slot.lock() = None;
        if self.owner != SessionOwner::Poller {
            info!(owner = %self.owner, "Vehicle session released");
        }
    }
}

/// Erase, write and verify span with the link held exclusively
///
/// Every command issued here bypasses the shared read path; typed reads
/// from other tasks wait until the section is dropped.
pub struct CriticalSection<'a> {
    client: &'a VehicleClient,
    owner: SessionOwner,
    _exclusive: RwLockWriteGuard<'a, ()>,
}

impl<'a> CriticalSection<'a> {
    pub(super) fn new(
        client: &'a VehicleClient,
        exclusive: RwLockWriteGuard<'a, ()>,
        owner: SessionOwner,
    ) -> Self {
        debug!(%owner, "Critical section entered");
        Self {
            client,
            owner,
            _exclusive: exclusive,
        }
    }

    pub fn owner(&self) -> SessionOwner {
        self.owner
    }

    /// Switch the ECU into its programming session
    pub async fn enter_programming(&self) -> Result<(), ObdError> {
        self.client
            .enqueue(DiagnosticRequest::enter_programming())
            .await
            .map(|_| ())
    }

    /// Reset the ECU back into its application
    pub async fn exit_programming(&self) -> Result<(), ObdError> {
        self.client
            .enqueue(DiagnosticRequest::exit_programming())
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn erase(&self) -> Result<(), ObdError> {
        self.client
            .enqueue(DiagnosticRequest::erase_memory())
            .await
            .map(|_| ())
    }

    /// Download `image` in `block_size` chunks from address 0
    ///
    /// Block sequence counters start at 1 and wrap. Returns the number of
    /// blocks written; stops at the first failed block.
    #[instrument(skip(self, image), fields(owner = %self.owner, bytes = image.len()))]
    pub async fn write_image(&self, image: &[u8], block_size: usize) -> Result<usize, ObdError> {
        let mut sequence: u8 = 1;
        let mut blocks = 0;
        for chunk in image.chunks(block_size.max(1)) {
            self.client
                .enqueue(DiagnosticRequest::transfer_data(sequence, chunk))
                .await?;
            sequence = sequence.wrapping_add(1);
            blocks += 1;
        }
        debug!(blocks, "Image written");
        Ok(blocks)
    }

    /// CRC-32 of a memory region as computed by the ECU
    pub async fn checksum(&self, address: u32, length: u32) -> Result<u32, ObdError> {
        let response = self
            .client
            .enqueue(DiagnosticRequest::checksum(address, length))
            .await?;
        codec::decode_checksum(&response)
    }

    /// Whether the adapter still reports a live link
    pub fn is_link_up(&self) -> bool {
        self.client.link_state().is_connected()
    }

    /// Re-open the link after it dropped mid-section
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn reconnect(&self) -> Result<(), ObdError> {
        self.client.connect().await
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        debug!(owner = %self.owner, "Critical section left");
    }
}
