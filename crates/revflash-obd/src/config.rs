//! Adapter, client and poller configuration
//!
//! Loaded from the `[adapter]`, `[client]` and `[poller]` sections of the CLI
//! config file, or constructed programmatically.

use serde::{Deserialize, Serialize};

/// Which adapter to talk through
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    /// In-memory simulated vehicle
    Simulator(SimulatorConfig),
    /// ELM327-compatible adapter reachable over TCP (Wi-Fi dongles)
    Tcp(TcpConfig),
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::Simulator(SimulatorConfig::default())
    }
}

/// Simulated adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Simulated round-trip latency per command
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
    /// Simulated time spent in `Connecting`
    #[serde(default = "default_connect_delay")]
    pub connect_delay_ms: u64,
    /// VIN returned for identification requests
    #[serde(default = "default_vin")]
    pub vin: String,
    /// Size of the simulated ECU flash memory in bytes
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    /// Battery voltage reported for `ATRV`
    #[serde(default = "default_battery_voltage")]
    pub battery_voltage: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency(),
            connect_delay_ms: default_connect_delay(),
            vin: default_vin(),
            memory_size: default_memory_size(),
            battery_voltage: default_battery_voltage(),
        }
    }
}

impl SimulatorConfig {
    /// No latency and no connect delay
    pub fn instant() -> Self {
        Self {
            latency_ms: 0,
            connect_delay_ms: 0,
            ..Self::default()
        }
    }
}

fn default_latency() -> u64 {
    100
}

fn default_connect_delay() -> u64 {
    1000
}

fn default_vin() -> String {
    "1HGCM82633A004352".to_string()
}

fn default_memory_size() -> usize {
    4096
}

fn default_battery_voltage() -> f64 {
    12.6
}

/// TCP (Wi-Fi ELM327) adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Prompt character the adapter prints when a response is complete
    #[serde(default = "default_terminator")]
    pub terminator: char,
    /// Commands sent right after the socket opens
    #[serde(default = "default_init_commands")]
    pub init_commands: Vec<String>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            response_timeout_ms: default_response_timeout(),
            terminator: default_terminator(),
            init_commands: default_init_commands(),
        }
    }
}

fn default_host() -> String {
    "192.168.0.10".to_string()
}

fn default_port() -> u16 {
    35000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_response_timeout() -> u64 {
    2000
}

fn default_terminator() -> char {
    '>'
}

fn default_init_commands() -> Vec<String> {
    // Reset, echo off, automatic protocol selection
    vec!["ATZ".to_string(), "ATE0".to_string(), "ATSP0".to_string()]
}

/// Vehicle client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound for a single command round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Capacity of the FIFO command queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_command_timeout() -> u64 {
    5000
}

fn default_queue_depth() -> usize {
    32
}

/// Live telemetry poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Poll period; 200 ms gives 5 Hz
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_config_defaults_from_toml() {
        let config: AdapterConfig = toml::from_str(
            r#"
type = "tcp"
host = "10.0.0.5"
"#,
        )
        .unwrap();

        match config {
            AdapterConfig::Tcp(tcp) => {
                assert_eq!(tcp.host, "10.0.0.5");
                assert_eq!(tcp.port, 35000);
                assert_eq!(tcp.terminator, '>');
                assert_eq!(tcp.init_commands, vec!["ATZ", "ATE0", "ATSP0"]);
            }
            other => panic!("Expected tcp config, got {:?}", other),
        }
    }

    #[test]
    fn test_default_adapter_is_simulator() {
        assert!(matches!(AdapterConfig::default(), AdapterConfig::Simulator(_)));
        assert_eq!(PollerConfig::default().interval_ms, 200);
    }
}
