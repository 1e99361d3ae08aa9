//! `kiln inspect` command - display detailed image metadata as JSON.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::{BuildError, Result};
use kiln_engine::{ImageConfigFile, ImageRecord, ImageStore, Manifest};

#[derive(Args)]
pub struct ImageInspectArgs {
    /// Image names or ids to inspect
    #[arg(required = true)]
    pub images: Vec<String>,
}

pub async fn execute(args: ImageInspectArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;

    let mut out = Vec::with_capacity(args.images.len());
    for reference in &args.images {
        let id = super::find_image(&services, reference)?;
        let record = services
            .images
            .get(&id)?
            .ok_or_else(|| BuildError::ImageNotFound(reference.clone()))?;
        let config = services.images.config(&id)?;
        let manifest = services.images.manifest(&id)?;
        out.push(describe(&record, &config, &manifest)?);
    }

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn describe(
    record: &ImageRecord,
    config: &ImageConfigFile,
    manifest: &Manifest,
) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "Id": record.id.to_string(),
        "Digest": record.manifest_digest.to_string(),
        "RepoTags": record.names,
        "Created": record.created.to_rfc3339(),
        "Size": record.size,
        "Author": config.author,
        "Architecture": config.architecture,
        "Os": config.os,
        "Config": serde_json::to_value(&config.config)?,
        "RootFS": serde_json::to_value(&config.rootfs)?,
        "ManifestType": manifest.format().manifest_media_type(),
        "Layers": manifest.layers.iter().map(|l| l.digest.to_string()).collect::<Vec<_>>(),
        "History": serde_json::to_value(&config.history)?,
    }))
}
