//! Command implementations for revflash

pub mod backups;
pub mod flash;
pub mod identify;
pub mod monitor;
pub mod restore;

pub use backups::backups;
pub use flash::flash;
pub use identify::identify;
pub use monitor::monitor;
pub use restore::restore;
