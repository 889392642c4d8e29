//! Backup Engine Library
//!
//! Deduplicating, incremental, encrypted backups with multi-destination
//! replication, manifest verification and selective restore.

pub mod archive;
pub mod clock;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod db;
pub mod dedup;
pub mod executor;
pub mod fs;
pub mod models;
pub mod replicate;
pub mod restore;
pub mod snapshot;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::EngineConfig;
pub use executor::{BackupResult, BackupStatus, Engine};
pub use utils::errors::{EngineError, Result};
