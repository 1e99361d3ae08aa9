//! `kiln pull` command - Pull an image into the local store.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::{ImageStore, PullPolicy};

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "alpine:3.19", "oci:/path/to/layout:tag")
    pub image: String,

    /// Only print the image id
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    if !args.quiet {
        println!("Pulling {}...", args.image);
    }
    let id = services.images.pull(&args.image, PullPolicy::Always).await?;
    println!("{id}");
    Ok(())
}
