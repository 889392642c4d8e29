//! Utility modules for the backup engine.

pub mod duration_ms;
pub mod errors;
pub mod hashing;
pub mod logger;
pub mod pool;

pub use errors::{EngineError, Result};
