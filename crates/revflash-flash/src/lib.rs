//! revflash-flash - Staged, failure-aware ECU flashing
//!
//! This crate turns a tune package into ECU memory contents:
//!
//! - [`verifier`]: SHA-256 + Ed25519 integrity checks with rotatable keys
//! - [`download`]: quarantine/verified package storage
//! - [`backup`]: durable ECU memory snapshots
//! - [`orchestrator`]: the flash job state machine
//! - [`recovery`]: restoring a backup after a failed flash, or on demand
//! - [`progress`]: job journal, event stream and tracker reporting
//! - [`tracker`] / [`catalog`]: HTTP clients for the remote collaborators
//!
//! # Example
//!
//! ```rust,ignore
//! use revflash_flash::{FlashConfig, FlashOrchestrator, FlashRequest};
//!
//! let config = FlashConfig::from_yaml_file("flash.yaml")?;
//! let orchestrator = FlashOrchestrator::from_config(client, &config, catalog)?;
//! let job = orchestrator.run(FlashRequest::latest("veh-1", "stage-1")).await?;
//! ```

pub mod backup;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
mod remote;
pub mod testing;
pub mod tracker;
pub mod verifier;

pub use backup::{BackupStore, FsBackupStore, MemoryBackupStore};
pub use catalog::{FileCatalog, HttpCatalog};
pub use config::{
    ConfigError, FlashConfig, FlashConfigBuilder, RemoteConfig, StorageConfig, TrustConfig,
    TrustedKey,
};
pub use download::PackageStore;
pub use error::{BackupError, FlashError, FlashFailure, VerifyError};
pub use journal::JobJournal;
pub use orchestrator::{
    FlashHandle, FlashOrchestrator, FlashOrchestratorBuilder, FlashRequest, FlashSettings,
};
pub use progress::FlashEvent;
pub use recovery::RecoveryController;
pub use tracker::HttpJobTracker;
pub use verifier::PackageVerifier;
