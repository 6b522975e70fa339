//! Simulated adapter backed by an in-memory ECU
//!
//! Behaves like a real adapter at the interface: it starts disconnected,
//! takes time to connect, answers with the same hex grammar and latency
//! class, rejects sends while not connected, and fails in-flight commands
//! when the link drops. Fault injection hooks let tests reproduce link
//! loss and bad replies.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use revflash_core::ConnectionState;
use tokio::sync::broadcast;

use super::{StatePublisher, TransportAdapter, TransportError};
use crate::codec::{self, format_hex, nrc, service};
use crate::config::SimulatorConfig;

/// Simulated ECU memory and programming session
struct Ecu {
    memory: Vec<u8>,
    programming: bool,
    next_sequence: u8,
    write_offset: usize,
    battery_voltage: f64,
    stored_dtcs: Vec<u16>,
}

impl Ecu {
    fn new(config: &SimulatorConfig) -> Self {
        Self {
            memory: stock_image(config.memory_size),
            programming: false,
            next_sequence: 1,
            write_offset: 0,
            battery_voltage: config.battery_voltage,
            stored_dtcs: Vec::new(),
        }
    }
}

/// P0601, internal control module memory checksum error
const REPROGRAMMED_DTC: u16 = 0x0601;

/// Deterministic factory calibration
fn stock_image(size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

#[derive(Default)]
struct Faults {
    /// Remaining successful transfer blocks before the link drops
    drop_after_blocks: Option<usize>,
    /// Report the drop as an unanswered command rather than a closed link
    drop_as_timeout: bool,
    refuse_connections: bool,
    no_data: HashSet<String>,
    corrupt_writes: bool,
}

/// Simulated OBD-II adapter
pub struct SimulatorAdapter {
    config: SimulatorConfig,
    state: StatePublisher,
    ecu: Mutex<Ecu>,
    faults: Mutex<Faults>,
    history: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a send finishes or is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatorAdapter {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            config: config.clone(),
            state: StatePublisher::new(),
            ecu: Mutex::new(Ecu::new(config)),
            faults: Mutex::new(Faults::default()),
            history: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Drop the link when the transfer block after `blocks` successful ones is sent
    pub fn drop_connection_after_blocks(&self, blocks: usize) {
        let mut faults = self.faults.lock();
        faults.drop_after_blocks = Some(blocks);
        faults.drop_as_timeout = false;
    }

    /// Like [`drop_connection_after_blocks`](Self::drop_connection_after_blocks),
    /// but the dropped block goes unanswered the way a TCP adapter reports it
    pub fn time_out_after_blocks(&self, blocks: usize) {
        let mut faults = self.faults.lock();
        faults.drop_after_blocks = Some(blocks);
        faults.drop_as_timeout = true;
    }

    /// Make subsequent `connect` calls fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.faults.lock().refuse_connections = refuse;
    }

    /// Answer `NO DATA` to the given command
    pub fn respond_no_data(&self, command: &str) {
        self.faults
            .lock()
            .no_data
            .insert(command.trim().to_ascii_uppercase());
    }

    /// Flip bits in every block written from now on
    pub fn corrupt_writes(&self, corrupt: bool) {
        self.faults.lock().corrupt_writes = corrupt;
    }

    pub fn set_battery_voltage(&self, volts: f64) {
        self.ecu.lock().battery_voltage = volts;
    }

    /// Simulate the adapter losing the vehicle link
    pub fn sever_link(&self, reason: &str) {
        self.state.publish(ConnectionState::Error(reason.to_string()));
    }

    /// Snapshot of ECU memory
    pub fn memory(&self) -> Vec<u8> {
        self.ecu.lock().memory.clone()
    }

    /// Trouble codes the ECU currently stores
    pub fn stored_dtcs(&self) -> Vec<u16> {
        self.ecu.lock().stored_dtcs.clone()
    }

    pub fn is_programming(&self) -> bool {
        self.ecu.lock().programming
    }

    /// Every command received, in arrival order
    pub fn commands(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    /// Highest number of commands ever processed concurrently
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, command: &str) -> Result<String, TransportError> {
        if self.faults.lock().no_data.contains(command) {
            return Ok("NO DATA".to_string());
        }

        if let Some(at) = command.strip_prefix("AT") {
            return Ok(self.respond_at(at));
        }

        let bytes = match hex::decode(command) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => return Ok("?".to_string()),
        };

        let reply = match bytes.as_slice() {
            [0x09, 0x02] => {
                let mut reply = vec![service::positive(service::VEHICLE_INFO), 0x02, 0x01];
                reply.extend_from_slice(self.config.vin.as_bytes());
                reply
            }
            [0x01, pid] => match self.live_value(*pid) {
                Some(data) => {
                    let mut reply = vec![service::positive(service::CURRENT_DATA), *pid];
                    reply.extend(data);
                    reply
                }
                None => return Ok("NO DATA".to_string()),
            },
            [0x10, 0x02] => {
                let mut ecu = self.ecu.lock();
                ecu.programming = true;
                ecu.next_sequence = 1;
                ecu.write_offset = 0;
                vec![0x50, 0x02]
            }
            [0x11, 0x01] => {
                let mut ecu = self.ecu.lock();
                // reprogramming leaves a memory trouble code behind
                let reprogrammed = ecu.programming && ecu.write_offset > 0;
                if reprogrammed && !ecu.stored_dtcs.contains(&REPROGRAMMED_DTC) {
                    ecu.stored_dtcs.push(REPROGRAMMED_DTC);
                }
                ecu.programming = false;
                vec![0x51, 0x01]
            }
            [0x04] => {
                self.ecu.lock().stored_dtcs.clear();
                vec![service::positive(service::CLEAR_DTCS)]
            }
            [0x23, rest @ ..] if rest.len() == 6 => self.read_memory(rest),
            [0x31, 0x01, 0xFF, 0x00] => self.erase(),
            [0x31, 0x01, 0xFF, 0x01, rest @ ..] if rest.len() == 8 => self.checksum(rest),
            [0x36, sequence, data @ ..] => self.transfer(*sequence, data)?,
            [sid, ..] => negative(*sid, 0x11),
            [] => return Ok("?".to_string()),
        };

        Ok(format_hex(&reply))
    }

    fn respond_at(&self, command: &str) -> String {
        match command {
            "Z" => "ELM327 v1.5".to_string(),
            "RV" => format!("{:.1}V", self.ecu.lock().battery_voltage),
            "I" => "ELM327 v1.5".to_string(),
            _ => "OK".to_string(),
        }
    }

    fn live_value(&self, pid: u8) -> Option<Vec<u8>> {
        let mut rng = rand::thread_rng();
        match pid {
            0x0C => {
                let raw: u16 = rng.gen_range(1000..=8000) * 4;
                Some(raw.to_be_bytes().to_vec())
            }
            0x0D => Some(vec![rng.gen_range(0..=200)]),
            0x11 => Some(vec![rng.gen_range(0..=255)]),
            0x05 => Some(vec![rng.gen_range(110..=135)]),
            _ => None,
        }
    }

    fn read_memory(&self, args: &[u8]) -> Vec<u8> {
        let address = u32::from_be_bytes([args[0], args[1], args[2], args[3]]) as usize;
        let length = u16::from_be_bytes([args[4], args[5]]) as usize;
        let ecu = self.ecu.lock();
        match ecu.memory.get(address..address + length) {
            Some(block) => {
                let mut reply = vec![service::positive(service::READ_MEMORY)];
                reply.extend_from_slice(block);
                reply
            }
            None => negative(service::READ_MEMORY, nrc::REQUEST_OUT_OF_RANGE),
        }
    }

    fn erase(&self) -> Vec<u8> {
        let mut ecu = self.ecu.lock();
        if !ecu.programming {
            return negative(service::ROUTINE_CONTROL, nrc::CONDITIONS_NOT_CORRECT);
        }
        ecu.memory.fill(0xFF);
        ecu.write_offset = 0;
        ecu.next_sequence = 1;
        vec![0x71, 0x01, 0xFF, 0x00]
    }

    fn checksum(&self, args: &[u8]) -> Vec<u8> {
        let address = u32::from_be_bytes([args[0], args[1], args[2], args[3]]) as usize;
        let length = u32::from_be_bytes([args[4], args[5], args[6], args[7]]) as usize;
        let ecu = self.ecu.lock();
        match ecu.memory.get(address..address + length) {
            Some(region) => {
                let mut reply = vec![0x71, 0x01, 0xFF, 0x01];
                reply.extend_from_slice(&codec::checksum(region).to_be_bytes());
                reply
            }
            None => negative(service::ROUTINE_CONTROL, nrc::REQUEST_OUT_OF_RANGE),
        }
    }

    fn transfer(&self, sequence: u8, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (drop_now, as_timeout) = {
            let mut faults = self.faults.lock();
            let drop_now = match faults.drop_after_blocks {
                Some(0) => {
                    faults.drop_after_blocks = None;
                    true
                }
                Some(remaining) => {
                    faults.drop_after_blocks = Some(remaining - 1);
                    false
                }
                None => false,
            };
            (drop_now, faults.drop_as_timeout)
        };
        if drop_now {
            tracing::warn!(sequence, "Simulator dropping link mid-transfer");
            self.sever_link("link lost during transfer");
            return Err(if as_timeout {
                TransportError::Timeout(format!("no reply to transfer block {}", sequence))
            } else {
                TransportError::ConnectionClosed
            });
        }

        let corrupt = self.faults.lock().corrupt_writes;
        let mut ecu = self.ecu.lock();
        if !ecu.programming {
            return Ok(negative(service::TRANSFER_DATA, nrc::CONDITIONS_NOT_CORRECT));
        }
        if sequence != ecu.next_sequence {
            return Ok(negative(
                service::TRANSFER_DATA,
                nrc::WRONG_BLOCK_SEQUENCE_COUNTER,
            ));
        }
        let start = ecu.write_offset;
        let end = start + data.len();
        if end > ecu.memory.len() {
            return Ok(negative(
                service::TRANSFER_DATA,
                nrc::GENERAL_PROGRAMMING_FAILURE,
            ));
        }

        ecu.memory[start..end].copy_from_slice(data);
        if corrupt {
            if let Some(byte) = ecu.memory.get_mut(start) {
                *byte ^= 0xFF;
            }
        }
        ecu.write_offset = end;
        ecu.next_sequence = sequence.wrapping_add(1);

        Ok(vec![service::positive(service::TRANSFER_DATA), sequence])
    }
}

fn negative(sid: u8, code: u8) -> Vec<u8> {
    vec![service::NEGATIVE_RESPONSE, sid, code]
}

#[async_trait]
impl TransportAdapter for SimulatorAdapter {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.state.is_connected() {
            return Ok(());
        }
        if self.faults.lock().refuse_connections {
            let reason = "simulated adapter unreachable".to_string();
            self.state.publish(ConnectionState::Error(reason.clone()));
            return Err(TransportError::ConnectionFailed(reason));
        }

        self.state.publish(ConnectionState::Connecting);
        if self.config.connect_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.connect_delay_ms)).await;
        }
        self.state.publish(ConnectionState::Connected);
        tracing::info!(vin = %self.config.vin, "Simulator connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.publish(ConnectionState::Disconnected);
    }

    async fn send(&self, command: &str) -> Result<String, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let command = command.trim().to_ascii_uppercase();
        self.history.lock().push(command.clone());

        if self.config.latency_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.latency_ms)) => {}
                _ = self.state.lost() => return Err(TransportError::ConnectionClosed),
            }
        }
        if !self.state.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let response = self.respond(&command)?;
        tracing::trace!(%command, %response, "Simulator exchange");
        Ok(response)
    }

    fn state(&self) -> ConnectionState {
        self.state.current()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn describe(&self) -> String {
        format!("simulator (vin {})", self.config.vin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DiagnosticRequest, DiagnosticResponse, Pid};

    async fn connected() -> SimulatorAdapter {
        let adapter = SimulatorAdapter::new(&SimulatorConfig::instant());
        adapter.connect().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let adapter = SimulatorAdapter::new(&SimulatorConfig::instant());
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        assert_eq!(
            adapter.send("010C").await.unwrap_err(),
            TransportError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_connect_walks_through_connecting() {
        let adapter = SimulatorAdapter::new(&SimulatorConfig::instant());
        let mut rx = adapter.subscribe_state();

        adapter.connect().await.unwrap();
        adapter.connect().await.unwrap();
        adapter.disconnect().await;

        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_identification_is_deterministic() {
        let adapter = connected().await;
        let raw = adapter.send("0902").await.unwrap();
        assert_eq!(
            raw,
            "49 02 01 31 48 47 43 4D 38 32 36 33 33 41 30 30 34 33 35 32"
        );
    }

    #[tokio::test]
    async fn test_live_values_decode_in_range() {
        let adapter = connected().await;
        let request = DiagnosticRequest::read(Pid::EngineRpm);
        let raw = adapter.send(request.command()).await.unwrap();
        let response = DiagnosticResponse::parse(&request, &raw).unwrap();
        let rpm = codec::decode_rpm(&response).unwrap();
        assert!((1000.0..=8000.0).contains(&rpm));
    }

    #[tokio::test]
    async fn test_erase_requires_programming_session() {
        let adapter = connected().await;
        assert_eq!(adapter.send("3101FF00").await.unwrap(), "7F 31 22");

        assert_eq!(adapter.send("1002").await.unwrap(), "50 02");
        assert_eq!(adapter.send("3101FF00").await.unwrap(), "71 01 FF 00");
        assert!(adapter.memory().iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn test_transfer_checks_sequence() {
        let adapter = connected().await;
        adapter.send("1002").await.unwrap();
        adapter.send("3101FF00").await.unwrap();

        assert_eq!(adapter.send("3602AABB").await.unwrap(), "7F 36 73");
        assert_eq!(adapter.send("3601AABB").await.unwrap(), "76 01");
        assert_eq!(adapter.send("3602CCDD").await.unwrap(), "76 02");
        assert_eq!(&adapter.memory()[..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn test_dropped_link_fails_transfer() {
        let adapter = connected().await;
        adapter.send("1002").await.unwrap();
        adapter.drop_connection_after_blocks(1);

        assert_eq!(adapter.send("360100").await.unwrap(), "76 01");
        assert_eq!(
            adapter.send("360200").await.unwrap_err(),
            TransportError::ConnectionClosed
        );
        assert!(matches!(adapter.state(), ConnectionState::Error(_)));

        adapter.connect().await.unwrap();
        assert!(adapter.state().is_connected());
    }

    #[tokio::test]
    async fn test_unanswered_block_times_out_and_drops_link() {
        let adapter = connected().await;
        adapter.send("1002").await.unwrap();
        adapter.time_out_after_blocks(1);

        assert_eq!(adapter.send("360100").await.unwrap(), "76 01");
        assert!(matches!(
            adapter.send("360200").await.unwrap_err(),
            TransportError::Timeout(_)
        ));
        assert!(matches!(adapter.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_reprogramming_stores_dtc_until_cleared() {
        let adapter = connected().await;
        adapter.send("1002").await.unwrap();
        adapter.send("3101FF00").await.unwrap();
        adapter.send("3601AA").await.unwrap();
        assert_eq!(adapter.send("1101").await.unwrap(), "51 01");
        assert_eq!(adapter.stored_dtcs(), vec![0x0601]);

        assert_eq!(adapter.send("04").await.unwrap(), "44");
        assert!(adapter.stored_dtcs().is_empty());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_state() {
        let adapter = SimulatorAdapter::new(&SimulatorConfig::instant());
        adapter.refuse_connections(true);
        assert!(adapter.connect().await.is_err());
        assert!(matches!(adapter.state(), ConnectionState::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_send() {
        let adapter = std::sync::Arc::new(SimulatorAdapter::new(&SimulatorConfig {
            latency_ms: 500,
            ..SimulatorConfig::instant()
        }));
        adapter.connect().await.unwrap();

        let pending = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.send("010C").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        adapter.disconnect().await;

        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            TransportError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_battery_voltage_text() {
        let adapter = connected().await;
        assert_eq!(adapter.send("ATRV").await.unwrap(), "12.6V");
        adapter.set_battery_voltage(11.8);
        assert_eq!(adapter.send("atrv").await.unwrap(), "11.8V");
    }
}
