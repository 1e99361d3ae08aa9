//! Multi-stage builds.
//!
//! [`BuildCoordinator`] turns a [`BuildRequest`] into a committed image:
//! it orders the stages ([`graph`]), runs each on a mounted working tree
//! (`stage`), reuses cached steps and commits the target stage through the
//! image store.

mod copy;
pub mod coordinator;
pub mod graph;
pub mod progress;
pub mod request;
mod scope;
pub mod services;
mod stage;

use std::sync::Arc;

use kiln_core::error::Result;

pub use coordinator::BuildCoordinator;
pub use graph::{BaseRef, BuildGraph};
pub use progress::LogSink;
pub use request::{BuildRequest, BuildResult, ContextSource};
pub use services::{PruneReport, Services};

/// Build `request` against `services`.
pub async fn build(services: &Arc<Services>, request: BuildRequest) -> Result<BuildResult> {
    BuildCoordinator::new(services.clone()).build(request).await
}
