//! Kiln Core - error taxonomy and engine configuration
//!
//! Types shared by the build engine and the command-line front end.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{
    CompressionKind, EngineConfig, ManifestFormatKind, RuntimeConfig, StorageDriverKind,
};
pub use error::{BuildError, ErrorKind, Result};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
