//! `kiln load` command - Load images from an OCI archive or layout.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::ImageStore;

#[derive(Args)]
pub struct LoadArgs {
    /// Input archive, or an OCI layout directory
    #[arg(short, long)]
    pub input: PathBuf,

    /// Tag to assign to the loaded image
    #[arg(short, long)]
    pub tag: Option<String>,
}

pub async fn execute(args: LoadArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    let loaded = services.images.load(&args.input)?;

    for (id, mut names) in loaded {
        if let Some(tag) = &args.tag {
            names.push(tag.clone());
            services.images.tag(&id, &names)?;
        }
        if names.is_empty() {
            println!("Loaded image: {id}");
        }
        for name in &names {
            println!("Loaded image: {name}");
        }
    }
    Ok(())
}
