//! Vehicle client
//!
//! Owns the active transport adapter and funnels every command through a
//! single FIFO queue, so at most one request is ever in flight on the
//! half-duplex link no matter how many callers issue reads concurrently.
//!
//! Two locks sit on top of the queue:
//! - the session lock decides whether the telemetry poller, a flash job or a
//!   restore currently owns the vehicle
//! - the critical-section lock keeps every other command off the link while
//!   erase, write and checksum verification run

mod session;

pub use session::{CriticalSection, SessionGuard, SessionOwner};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use revflash_core::ConnectionState;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::codec::{self, DiagnosticRequest, DiagnosticResponse, Pid};
use crate::config::ClientConfig;
use crate::error::ObdError;
use crate::transport::TransportAdapter;

type SharedAdapter = Arc<RwLock<Arc<dyn TransportAdapter>>>;

/// One queued command and where its paired response goes
struct QueuedCommand {
    request: DiagnosticRequest,
    reply: oneshot::Sender<Result<DiagnosticResponse, ObdError>>,
}

/// Serializing client over one transport adapter
pub struct VehicleClient {
    adapter: SharedAdapter,
    queue: mpsc::Sender<QueuedCommand>,
    worker: JoinHandle<()>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Bumped on every adapter swap; forwarders of older adapters stop writing
    generation: Arc<Mutex<u64>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    critical: tokio::sync::RwLock<()>,
    session: Arc<tokio::sync::Mutex<()>>,
    owner: Arc<Mutex<Option<SessionOwner>>>,
}

impl VehicleClient {
    /// Create a client and start its queue worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(adapter: Arc<dyn TransportAdapter>, config: ClientConfig) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_depth.max(1));
        let shared: SharedAdapter = Arc::new(RwLock::new(adapter.clone()));
        let worker = tokio::spawn(run_queue(
            rx,
            shared.clone(),
            Duration::from_millis(config.command_timeout_ms),
        ));

        let (state, _) = watch::channel(adapter.state());
        let state = Arc::new(state);
        let generation = Arc::new(Mutex::new(0));
        let forwarder = spawn_forwarder(adapter, state.clone(), generation.clone(), 0);

        Self {
            adapter: shared,
            queue,
            worker,
            state,
            generation,
            forwarder: Mutex::new(Some(forwarder)),
            critical: tokio::sync::RwLock::new(()),
            session: Arc::new(tokio::sync::Mutex::new(())),
            owner: Arc::new(Mutex::new(None)),
        }
    }

    fn current_adapter(&self) -> Arc<dyn TransportAdapter> {
        self.adapter.read().clone()
    }

    /// Description of the active adapter
    pub fn adapter_description(&self) -> String {
        self.current_adapter().describe()
    }

    /// Replace the active adapter
    ///
    /// Waits for queued commands and any critical section to finish. The old
    /// adapter's state stream is torn down before the new one is observed,
    /// and the old adapter is disconnected afterwards.
    #[instrument(skip(self, adapter), fields(adapter = %adapter.describe()))]
    pub async fn use_adapter(&self, adapter: Arc<dyn TransportAdapter>) {
        let _exclusive = self.critical.write().await;

        let old = {
            let mut generation = self.generation.lock();
            if let Some(handle) = self.forwarder.lock().take() {
                handle.abort();
            }
            *generation += 1;
            let old = std::mem::replace(&mut *self.adapter.write(), adapter.clone());
            self.state.send_replace(adapter.state());
            *self.forwarder.lock() = Some(spawn_forwarder(
                adapter,
                self.state.clone(),
                self.generation.clone(),
                *generation,
            ));
            old
        };

        old.disconnect().await;
        info!("Adapter swapped");
    }

    /// Connect the active adapter
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ObdError> {
        let adapter = self.current_adapter();
        let result = adapter.connect().await;
        self.refresh_state(&adapter);
        result.map_err(ObdError::from)
    }

    /// Disconnect the active adapter; in-flight commands fail
    pub async fn disconnect(&self) {
        let adapter = self.current_adapter();
        adapter.disconnect().await;
        self.refresh_state(&adapter);
    }

    fn refresh_state(&self, adapter: &Arc<dyn TransportAdapter>) {
        let _generation = self.generation.lock();
        if Arc::ptr_eq(adapter, &self.current_adapter()) {
            mirror(&self.state, adapter.state());
        }
    }

    /// Mirror of the adapter's connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// State read from the adapter itself, bringing the mirror up to date
    ///
    /// The mirror is fed by a background task and may lag behind a send
    /// that just failed; use this when the answer decides what to do next.
    pub fn link_state(&self) -> ConnectionState {
        let adapter = self.current_adapter();
        self.refresh_state(&adapter);
        adapter.state()
    }

    /// Watch the mirrored connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queue a request and wait for its paired response
    async fn enqueue(&self, request: DiagnosticRequest) -> Result<DiagnosticResponse, ObdError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(QueuedCommand { request, reply })
            .await
            .map_err(|_| ObdError::ClientClosed)?;
        rx.await.map_err(|_| ObdError::ClientClosed)?
    }

    /// Queue a request outside of any critical section
    async fn execute(&self, request: DiagnosticRequest) -> Result<DiagnosticResponse, ObdError> {
        let _shared = self.critical.read().await;
        self.enqueue(request).await
    }

    /// Read the vehicle identification number
    #[instrument(skip(self))]
    pub async fn identify(&self) -> Result<String, ObdError> {
        let response = self.execute(DiagnosticRequest::read(Pid::Vin)).await?;
        codec::decode_vin(&response)
    }

    pub async fn read_rpm(&self) -> Result<f64, ObdError> {
        let response = self.execute(DiagnosticRequest::read(Pid::EngineRpm)).await?;
        codec::decode_rpm(&response)
    }

    pub async fn read_speed(&self) -> Result<u32, ObdError> {
        let response = self.execute(DiagnosticRequest::read(Pid::VehicleSpeed)).await?;
        codec::decode_speed(&response)
    }

    pub async fn read_throttle(&self) -> Result<f64, ObdError> {
        let response = self
            .execute(DiagnosticRequest::read(Pid::ThrottlePosition))
            .await?;
        codec::decode_throttle(&response)
    }

    /// Coolant temperature in degrees Celsius
    pub async fn read_coolant(&self) -> Result<i16, ObdError> {
        let response = self
            .execute(DiagnosticRequest::read(Pid::CoolantTemperature))
            .await?;
        codec::decode_coolant(&response)
    }

    /// Battery voltage as measured by the adapter
    pub async fn read_voltage(&self) -> Result<f64, ObdError> {
        let response = self
            .execute(DiagnosticRequest::read(Pid::BatteryVoltage))
            .await?;
        codec::decode_voltage(&response)
    }

    /// Read `total_len` bytes of ECU memory from address 0 in `block`-sized reads
    #[instrument(skip(self))]
    pub async fn read_memory_image(&self, total_len: u32, block: u16) -> Result<Vec<u8>, ObdError> {
        let block = block.max(1) as u32;
        let mut image = Vec::with_capacity(total_len as usize);
        let mut address = 0u32;
        while address < total_len {
            let length = block.min(total_len - address) as u16;
            let response = self
                .execute(DiagnosticRequest::read_memory(address, length))
                .await?;
            image.extend(codec::decode_memory(&response)?);
            address += length as u32;
        }
        debug!(bytes = image.len(), "ECU memory read");
        Ok(image)
    }

    /// CRC-32 the ECU computes over a memory region
    pub async fn ecu_checksum(&self, address: u32, length: u32) -> Result<u32, ObdError> {
        let response = self
            .execute(DiagnosticRequest::checksum(address, length))
            .await?;
        codec::decode_checksum(&response)
    }

    /// Clear stored trouble codes, e.g. the ones an ECU logs while reprogrammed
    #[instrument(skip(self))]
    pub async fn clear_dtcs(&self) -> Result<(), ObdError> {
        let response = self.execute(DiagnosticRequest::clear_dtcs()).await?;
        codec::decode_clear_dtcs(&response)
    }

    /// Wait for and take exclusive ownership of the vehicle
    pub async fn acquire_session(&self, owner: SessionOwner) -> SessionGuard {
        let guard = self.session.clone().lock_owned().await;
        SessionGuard::new(owner, guard, self.owner.clone())
    }

    /// Take ownership of the vehicle if nobody else holds it
    pub fn try_acquire_session(&self, owner: SessionOwner) -> Result<SessionGuard, ObdError> {
        match self.session.clone().try_lock_owned() {
            Ok(guard) => Ok(SessionGuard::new(owner, guard, self.owner.clone())),
            Err(_) => Err(ObdError::Busy(
                self.session_owner()
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            )),
        }
    }

    /// Current holder of the session lock
    pub fn session_owner(&self) -> Option<SessionOwner> {
        *self.owner.lock()
    }

    /// Enter the uninterruptible erase/write/verify span
    ///
    /// Requires a session guard taken from this client. Until the returned
    /// section is dropped no other command reaches the adapter.
    pub async fn begin_critical<'a>(
        &'a self,
        session: &SessionGuard,
    ) -> Result<CriticalSection<'a>, ObdError> {
        if !session.belongs_to(&self.owner) {
            return Err(ObdError::Busy(format!(
                "{} session belongs to another client",
                session.owner()
            )));
        }
        let exclusive = self.critical.write().await;
        Ok(CriticalSection::new(self, exclusive, session.owner()))
    }
}

impl Drop for VehicleClient {
    fn drop(&mut self) {
        self.worker.abort();
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

fn mirror(state: &watch::Sender<ConnectionState>, latest: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == latest {
            false
        } else {
            *current = latest;
            true
        }
    });
}

/// Drain the command queue one request at a time
async fn run_queue(
    mut rx: mpsc::Receiver<QueuedCommand>,
    adapter: SharedAdapter,
    command_timeout: Duration,
) {
    while let Some(QueuedCommand { request, reply }) = rx.recv().await {
        if reply.is_closed() {
            continue;
        }
        let adapter = adapter.read().clone();
        let result = match tokio::time::timeout(command_timeout, adapter.send(request.command())).await
        {
            Ok(Ok(raw)) => DiagnosticResponse::parse(&request, &raw),
            Ok(Err(e)) => Err(ObdError::from(e)),
            Err(_) => Err(ObdError::Timeout),
        };
        if let Err(e) = &result {
            debug!(command = %request, error = %e, "Command failed");
        }
        let _ = reply.send(result);
    }
}

/// Re-publish one adapter's state changes into the client's mirror
fn spawn_forwarder(
    adapter: Arc<dyn TransportAdapter>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<Mutex<u64>>,
    bound_to: u64,
) -> JoinHandle<()> {
    let mut rx = adapter.subscribe_state();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let current = generation.lock();
                    if *current != bound_to {
                        break;
                    }
                    mirror(&state, adapter.state());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
