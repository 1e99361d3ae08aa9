//! Image formats and transports.
//!
//! Config, manifest and reference models, plus the registry, layout and
//! archive transports that move images in and out of the local store.

pub mod config;
pub mod credentials;
pub mod layout;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod transport;

pub use config::{ContainerConfig, HistoryEntry, ImageConfigFile};
pub use manifest::{Compression, Descriptor, Manifest, ManifestFormat};
pub use reference::ImageReference;
pub use transport::Transport;
