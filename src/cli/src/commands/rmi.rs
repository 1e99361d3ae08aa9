//! `kiln rmi` command - remove one or more images.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::{BuildError, Result};
use kiln_engine::{ImageStore, Removed};

#[derive(Args)]
pub struct RmiArgs {
    /// Image names or ids to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Ignore images that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;

    let mut errors: Vec<String> = Vec::new();
    for reference in &args.images {
        match services.images.remove(reference) {
            Ok(Removed::Untagged(name)) => println!("Untagged: {name}"),
            Ok(Removed::Deleted(id)) => println!("Deleted: {id}"),
            Err(BuildError::ImageNotFound(_)) if args.force => continue,
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(BuildError::ImageNotFound(format!(
            "failed to remove image(s):\n{}",
            errors.join("\n")
        )))
    }
}
