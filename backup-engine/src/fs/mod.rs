//! Filesystem helpers: directory walking and stat metadata.

pub mod metadata;
pub mod walker;

pub use metadata::FileMetadata;
pub use walker::{walk_files, FileInfo, WalkOptions};
