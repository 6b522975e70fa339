//! Configuration file handling for revflash

use std::path::Path;

use anyhow::{Context, Result};
use revflash_flash::FlashConfig;
use revflash_obd::{AdapterConfig, ClientConfig, PollerConfig};
use serde::{Deserialize, Serialize};

/// Contents of the TOML config file
///
/// ```toml
/// [adapter]
/// type = "tcp"
/// host = "192.168.0.10"
///
/// [poller]
/// interval_ms = 200
///
/// [flash.storage]
/// root = "/var/lib/revflash"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load from `path`, or fall back to defaults (simulated vehicle)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load_from(path),
            Some(path) => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_uses_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();

        assert!(matches!(config.adapter, AdapterConfig::Simulator(_)));
        assert!(config.flash.tracker.is_none());
        assert_eq!(config.flash.transfer.block_size, 128);
    }

    #[test]
    fn test_parse_all_sections() {
        let config = Config::parse(
            r#"
[adapter]
type = "tcp"
host = "10.0.0.7"
port = 35001

[poller]
interval_ms = 500

[client]
command_timeout_ms = 8000

[flash.tracker]
base_url = "https://api.example.com/api/v1/"
api_key = "secret"

[flash.storage]
root = "/var/lib/revflash"

[[flash.trust.keys]]
key_id = "rev_key_v1"
public_key_b64 = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="

[flash.safety]
min_battery_voltage = 12.2
"#,
        )
        .unwrap();

        match &config.adapter {
            AdapterConfig::Tcp(tcp) => {
                assert_eq!(tcp.host, "10.0.0.7");
                assert_eq!(tcp.port, 35001);
            }
            other => panic!("Expected tcp adapter, got {:?}", other),
        }
        assert_eq!(config.poller.interval_ms, 500);
        assert_eq!(config.client.command_timeout_ms, 8000);

        let tracker = config.flash.tracker.as_ref().unwrap();
        assert_eq!(tracker.api_key.as_deref(), Some("secret"));
        assert_eq!(tracker.api_key_header, "X-API-Key");
        assert_eq!(config.flash.storage.root, Path::new("/var/lib/revflash"));
        assert_eq!(config.flash.trust.keys.len(), 1);
        assert_eq!(config.flash.safety.min_battery_voltage, 12.2);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revflash.toml");
        std::fs::write(&path, "[adapter]\ntype = \"bluetooth\"\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
