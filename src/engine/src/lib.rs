//! Kiln Engine - container image builds from Dockerfile-style scripts.
//!
//! Scripts are parsed into stages, stages run on layered working trees with
//! RUN commands confined to a sandbox, and every step is cached by a
//! content fingerprint. Results are committed as OCI or Docker images and
//! moved between the local store, registries and archives by transports.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod context;
pub mod digest;
pub mod fingerprint;
pub mod fsutil;
pub mod oci;
pub mod sandbox;
pub mod script;
pub mod store;
pub mod volume;

// Re-export common types
pub use build::{build, BuildCoordinator, BuildRequest, BuildResult, ContextSource, LogSink};
pub use build::{PruneReport, Services};
pub use cache::{CacheEntry, LayerCache};
pub use context::ContextView;
pub use digest::Digest;
pub use oci::{ImageConfigFile, ImageReference, Manifest, ManifestFormat, Compression, Transport};
pub use sandbox::{ExecResult, ExecRuntime, ExecSpec, NetworkMode, Sandbox, TransientMount};
pub use script::{Instruction, Script, Stage, Step};
pub use store::image::{ImageId, Removed};
pub use store::{ContentStore, ImageRecord, ImageStore, LayerStore, LocalImageStore, PullPolicy};

/// Kiln engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
