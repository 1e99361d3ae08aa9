//! Storage: content-addressed blobs, parent-chained layers and images.

pub mod changes;
pub mod content;
pub mod driver;
pub mod image;
pub mod layer;

pub use content::ContentStore;
pub use image::{CommittedImage, ImageRecord, ImageStore, LocalImageStore, PullPolicy};
pub use layer::{Layer, LayerId, LayerStore, LocalLayerStore, MountGuard, MountHandle};
