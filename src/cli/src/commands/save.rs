//! `kiln save` command - Save images to an OCI archive.
//!
//! The archive is a tarred OCI image layout with each image tagged by the
//! name it was saved under, suitable for `kiln load` on another machine.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::ImageStore;

use crate::output;

#[derive(Args)]
pub struct SaveArgs {
    /// Image names or ids to save
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Output file path (e.g., "app.tar")
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(args: SaveArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;

    let mut selected = Vec::with_capacity(args.images.len());
    for reference in &args.images {
        let id = super::find_image(&services, reference)?;
        let name = saved_name(reference, &id);
        selected.push((id, name));
    }
    services.images.save(&selected, &args.output)?;

    let size = std::fs::metadata(&args.output).map(|m| m.len()).unwrap_or(0);
    println!(
        "Saved {} to {} ({})",
        args.images.join(", "),
        args.output.display(),
        output::format_bytes(size)
    );
    Ok(())
}

/// Name recorded in the archive: the reference as given, unless it was an
/// image id.
fn saved_name(reference: &str, id: &kiln_engine::ImageId) -> Option<String> {
    let bare = reference.strip_prefix("sha256:").unwrap_or(reference);
    if id.hex().starts_with(bare) {
        None
    } else {
        Some(reference.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_engine::Digest;

    #[test]
    fn test_saved_name_skips_ids() {
        let id = Digest::of_bytes(b"config");
        assert_eq!(saved_name(&id.to_string(), &id), None);
        assert_eq!(saved_name(id.short(), &id), None);
        assert_eq!(saved_name("app:1", &id), Some("app:1".to_string()));
    }
}
