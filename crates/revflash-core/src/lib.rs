//! revflash-core - Core types and collaborator traits for the ECU flash pipeline
//!
//! This crate holds the domain model shared by the diagnostic layer
//! (`revflash-obd`) and the flash pipeline (`revflash-flash`), together with
//! the traits implemented by remote collaborators (job tracker, tune catalog,
//! safety gate).

pub mod collaborator;
pub mod error;
pub mod models;

pub use collaborator::{
    AllowAllSafetyGate, JobTracker, JobUpdate, NoopJobTracker, PackageCatalog, SafetyGate,
    SafetyVerdict,
};
pub use error::{CollaboratorError, CollaboratorResult, JobError};
pub use models::*;
