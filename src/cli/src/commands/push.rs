//! `kiln push` command - Push a local image to a registry or an OCI layout.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::ImageStore;

#[derive(Args)]
pub struct PushArgs {
    /// Local image name or id
    pub image: String,

    /// Destination (e.g., "ghcr.io/org/image:tag", "oci:/srv/layout:tag");
    /// defaults to the image name
    pub destination: Option<String>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    let id = super::find_image(&services, &args.image)?;
    let destination = args.destination.as_deref().unwrap_or(&args.image);

    if !args.quiet {
        println!("Pushing {}...", destination);
    }
    // Credentials: environment, then the store written by `kiln login`.
    let pushed = services.images.export(&id, destination).await?;

    if args.quiet {
        println!("{pushed}");
    } else {
        println!("Pushed: {pushed}");
    }
    Ok(())
}
