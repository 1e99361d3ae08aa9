//! `kiln tag` command - create a tag that refers to an existing image.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::{BuildError, Result};
use kiln_engine::ImageStore;

#[derive(Args)]
pub struct ImageTagArgs {
    /// Source image name or id
    pub source: String,

    /// New name for the image
    pub target: String,
}

pub async fn execute(args: ImageTagArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    let id = super::find_image(&services, &args.source)?;
    let record = services
        .images
        .get(&id)?
        .ok_or_else(|| BuildError::ImageNotFound(args.source.clone()))?;

    let mut names = record.names;
    names.push(args.target.clone());
    services.images.tag(&id, &names)?;

    println!("{}", args.target);
    Ok(())
}
