//! Flash pipeline configuration with YAML support

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Flash pipeline configuration
///
/// Can be loaded from YAML or constructed programmatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Remote job tracker; reports are dropped when unset
    #[serde(default)]
    pub tracker: Option<RemoteConfig>,

    /// Remote tune catalog
    #[serde(default)]
    pub catalog: Option<RemoteConfig>,

    /// Local storage layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// Trusted package signing keys
    #[serde(default)]
    pub trust: TrustConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// ECU transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Pre-flight checks
    #[serde(default)]
    pub safety: SafetyConfig,
}

/// Connection settings for a remote collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the server
    pub base_url: String,

    /// API key for authentication (optional)
    #[serde(default)]
    pub api_key: Option<String>,

    /// API key header name (default: X-API-Key)
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            api_key_header: default_api_key_header(),
        }
    }
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// Local storage layout
///
/// ```text
/// <root>/backups/<vehicle>/...          ECU memory snapshots
/// <root>/tunes/quarantine/...           downloaded, not yet verified
/// <root>/tunes/verified/...             passed hash + signature checks
/// <root>/jobs/<job-id>.json             job journal
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("revflash-data")
}

impl StorageConfig {
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("tunes").join("quarantine")
    }

    pub fn verified_dir(&self) -> PathBuf {
        self.root.join("tunes").join("verified")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }
}

/// Trusted signing keys
///
/// Several keys may be trusted at once so the signing key can rotate while
/// packages signed with the previous key are still in circulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default)]
    pub keys: Vec<TrustedKey>,
}

/// One trusted Ed25519 public key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    /// Identifier packages refer to, e.g. `rev_key_v1`
    pub key_id: String,
    /// Raw 32-byte public key, base64 encoded
    pub public_key_b64: String,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// General request timeout in milliseconds (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_ms: u64,

    /// Connect timeout in milliseconds (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// Upper bound for one job tracker report (default: 5s)
    #[serde(default = "default_report_timeout")]
    pub report_ms: u64,

    /// Package download timeout in milliseconds (default: 5 minutes)
    #[serde(default = "default_download_timeout")]
    pub download_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
            connect_ms: default_connect_timeout(),
            report_ms: default_report_timeout(),
            download_ms: default_download_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_report_timeout() -> u64 {
    5_000
}

fn default_download_timeout() -> u64 {
    300_000 // 5 minutes
}

/// ECU memory transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per TransferData block
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Bytes per ReadMemory request while backing up
    #[serde(default = "default_read_block")]
    pub read_block: u16,

    /// Size of the flashable ECU region captured by backups
    #[serde(default = "default_memory_size")]
    pub memory_size: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            read_block: default_read_block(),
            memory_size: default_memory_size(),
        }
    }
}

fn default_block_size() -> usize {
    128
}

fn default_read_block() -> u16 {
    128
}

fn default_memory_size() -> u32 {
    4096
}

/// Pre-flight safety checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minimum battery voltage before any ECU memory is touched
    #[serde(default = "default_min_voltage")]
    pub min_battery_voltage: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_battery_voltage: default_min_voltage(),
        }
    }
}

fn default_min_voltage() -> f64 {
    12.5
}

impl FlashConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Create a builder for programmatic configuration
    pub fn builder(storage_root: impl Into<PathBuf>) -> FlashConfigBuilder {
        FlashConfigBuilder::new(storage_root)
    }
}

/// Builder for FlashConfig
pub struct FlashConfigBuilder {
    config: FlashConfig,
}

impl FlashConfigBuilder {
    /// Create a new builder with the given storage root
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            config: FlashConfig {
                storage: StorageConfig {
                    root: storage_root.into(),
                },
                ..FlashConfig::default()
            },
        }
    }

    /// Report jobs to the tracker at this base URL
    pub fn tracker(mut self, base_url: impl Into<String>) -> Self {
        self.config.tracker = Some(RemoteConfig::new(base_url));
        self
    }

    /// Resolve packages from the catalog at this base URL
    pub fn catalog(mut self, base_url: impl Into<String>) -> Self {
        self.config.catalog = Some(RemoteConfig::new(base_url));
        self
    }

    /// Set the API key on every configured remote
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        for remote in [&mut self.config.tracker, &mut self.config.catalog]
            .into_iter()
            .flatten()
        {
            remote.api_key = Some(key.clone());
        }
        self
    }

    /// Trust an additional signing key
    pub fn trusted_key(mut self, key_id: impl Into<String>, public_key_b64: impl Into<String>) -> Self {
        self.config.trust.keys.push(TrustedKey {
            key_id: key_id.into(),
            public_key_b64: public_key_b64.into(),
        });
        self
    }

    /// Set TransferData block size in bytes
    pub fn block_size(mut self, bytes: usize) -> Self {
        self.config.transfer.block_size = bytes;
        self
    }

    /// Set the size of the ECU region to back up
    pub fn memory_size(mut self, bytes: u32) -> Self {
        self.config.transfer.memory_size = bytes;
        self
    }

    /// Set the minimum battery voltage
    pub fn min_battery_voltage(mut self, volts: f64) -> Self {
        self.config.safety.min_battery_voltage = volts;
        self
    }

    /// Set request timeout in milliseconds
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeouts.request_ms = ms;
        self
    }

    /// Build the configuration
    pub fn build(self) -> FlashConfig {
        self.config
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
tracker:
  base_url: "https://api.example.com/api/v1"
  api_key: "secret123"

storage:
  root: "/var/lib/revflash"

trust:
  keys:
    - key_id: rev_key_v2
      public_key_b64: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
    - key_id: rev_key_v1
      public_key_b64: "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE="

transfer:
  block_size: 64
"#;

        let config = FlashConfig::from_yaml(yaml).unwrap();
        let tracker = config.tracker.unwrap();
        assert_eq!(tracker.base_url, "https://api.example.com/api/v1");
        assert_eq!(tracker.api_key, Some("secret123".to_string()));
        assert_eq!(tracker.api_key_header, "X-API-Key");
        assert!(config.catalog.is_none());
        assert_eq!(config.trust.keys.len(), 2);
        assert_eq!(config.transfer.block_size, 64);
        assert_eq!(config.transfer.read_block, 128);
        assert_eq!(config.safety.min_battery_voltage, 12.5);
        assert_eq!(
            config.storage.quarantine_dir(),
            PathBuf::from("/var/lib/revflash/tunes/quarantine")
        );
    }

    #[test]
    fn test_builder() {
        let config = FlashConfig::builder("/tmp/revflash")
            .tracker("http://localhost:8000/api/v1")
            .catalog("http://localhost:8000/api/v1")
            .api_key("my-secret")
            .trusted_key("rev_key_v1", "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=")
            .block_size(256)
            .build();

        assert_eq!(
            config.tracker.as_ref().unwrap().api_key.as_deref(),
            Some("my-secret")
        );
        assert_eq!(
            config.catalog.as_ref().unwrap().api_key.as_deref(),
            Some("my-secret")
        );
        assert_eq!(config.trust.keys[0].key_id, "rev_key_v1");
        assert_eq!(config.transfer.block_size, 256);
        assert_eq!(config.storage.backups_dir(), PathBuf::from("/tmp/revflash/backups"));
    }

    #[test]
    fn test_to_yaml() {
        let config = FlashConfig::builder("/tmp/revflash")
            .tracker("http://localhost:8000")
            .build();

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("base_url"));
        assert!(yaml.contains("http://localhost:8000"));
    }
}
