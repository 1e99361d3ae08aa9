//! CLI command definitions and dispatch.

mod build;
mod cache;
mod history;
mod image_inspect;
mod image_tag;
mod images;
mod load;
mod login;
mod logout;
mod pull;
mod push;
mod rmi;
mod save;
mod version;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kiln_core::config::EngineConfig;
use kiln_core::error::{BuildError, Result};
use kiln_engine::{ImageId, ImageStore, Services};

/// Kiln - build container images from Dockerfile-style scripts.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// State directory (default: $KILN_ROOT or ~/.kiln)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a build script
    Build(build::BuildArgs),
    /// List images
    Images(images::ImagesArgs),
    /// Display detailed image information as JSON
    Inspect(image_inspect::ImageInspectArgs),
    /// Show the history of an image
    History(history::HistoryArgs),
    /// Create a tag that refers to an existing image
    Tag(image_tag::ImageTagArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
    /// Pull an image from a registry or an OCI layout
    Pull(pull::PullArgs),
    /// Push an image to a registry or an OCI layout
    Push(push::PushArgs),
    /// Save images to an OCI archive
    Save(save::SaveArgs),
    /// Load images from an OCI archive
    Load(load::LoadArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
    /// Manage the layer cache
    #[command(subcommand)]
    Cache(cache::CacheCommand),
    /// Show version information
    Version(version::VersionArgs),
}

/// Engine configuration, with `--root` taking precedence over the
/// configured root.
pub(crate) fn engine_config(root: Option<PathBuf>) -> Result<EngineConfig> {
    match root {
        Some(root) => EngineConfig::load_from(root),
        None => EngineConfig::load(),
    }
}

/// Open the engine state.
pub(crate) fn open_services(root: Option<PathBuf>) -> Result<Arc<Services>> {
    Ok(Arc::new(Services::init(engine_config(root)?)?))
}

/// Resolve an image name or id in the local store.
pub(crate) fn find_image(services: &Services, reference: &str) -> Result<ImageId> {
    services
        .images
        .resolve(reference)?
        .ok_or_else(|| BuildError::ImageNotFound(reference.to_string()))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let root = cli.root;
    match cli.command {
        Command::Build(args) => build::execute(args, root).await,
        Command::Images(args) => images::execute(args, root).await,
        Command::Inspect(args) => image_inspect::execute(args, root).await,
        Command::History(args) => history::execute(args, root).await,
        Command::Tag(args) => image_tag::execute(args, root).await,
        Command::Rmi(args) => rmi::execute(args, root).await,
        Command::Pull(args) => pull::execute(args, root).await,
        Command::Push(args) => push::execute(args, root).await,
        Command::Save(args) => save::execute(args, root).await,
        Command::Load(args) => load::execute(args, root).await,
        Command::Login(args) => login::execute(args, root).await,
        Command::Logout(args) => logout::execute(args, root).await,
        Command::Cache(command) => cache::execute(command, root).await,
        Command::Version(args) => version::execute(args).await,
    }
}
