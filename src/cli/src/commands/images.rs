//! `kiln images` command.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::{ImageRecord, ImageStore};

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image ids
    #[arg(short, long)]
    pub quiet: bool,

    /// Show full image ids
    #[arg(long)]
    pub no_trunc: bool,

    /// Format output using placeholders: {{.Repository}}, {{.Tag}}, {{.ID}},
    /// {{.Size}}, {{.Created}}
    #[arg(long)]
    pub format: Option<String>,
}

pub async fn execute(args: ImagesArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    let images = services.images.list()?;

    if args.quiet {
        let mut seen = Vec::new();
        for image in &images {
            let id = output::image_id(&image.id, args.no_trunc);
            if !seen.contains(&id) {
                println!("{id}");
                seen.push(id);
            }
        }
        return Ok(());
    }

    let rows: Vec<ImageRow> = images
        .iter()
        .flat_map(|image| ImageRow::from_record(image, args.no_trunc))
        .collect();

    if let Some(ref fmt) = args.format {
        for row in &rows {
            println!("{}", row.apply_format(fmt));
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"]);
    for row in &rows {
        table.add_row([&row.repository, &row.tag, &row.id, &row.created, &row.size]);
    }
    println!("{table}");
    Ok(())
}

/// Display fields for one name of an image.
struct ImageRow {
    repository: String,
    tag: String,
    id: String,
    created: String,
    size: String,
}

impl ImageRow {
    /// One row per name; an untagged image gets a single `<none>` row.
    fn from_record(image: &ImageRecord, no_trunc: bool) -> Vec<Self> {
        let id = output::image_id(&image.id, no_trunc);
        let created = output::format_ago(&image.created);
        let size = output::format_bytes(image.size);
        let names: Vec<(String, String)> = if image.names.is_empty() {
            vec![("<none>".to_string(), "<none>".to_string())]
        } else {
            image.names.iter().map(|n| output::repository_and_tag(n)).collect()
        };
        names
            .into_iter()
            .map(|(repository, tag)| Self {
                repository,
                tag,
                id: id.clone(),
                created: created.clone(),
                size: size.clone(),
            })
            .collect()
    }

    /// Apply a format template, replacing `{{.Field}}` placeholders.
    fn apply_format(&self, fmt: &str) -> String {
        fmt.replace("{{.Repository}}", &self.repository)
            .replace("{{.Tag}}", &self.tag)
            .replace("{{.ID}}", &self.id)
            .replace("{{.Size}}", &self.size)
            .replace("{{.Created}}", &self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_engine::Digest;

    fn record(names: &[&str]) -> ImageRecord {
        ImageRecord {
            id: Digest::of_bytes(b"config"),
            manifest_digest: Digest::of_bytes(b"manifest"),
            names: names.iter().map(|n| n.to_string()).collect(),
            top_layer: None,
            created: Utc::now(),
            size: 2048,
        }
    }

    #[test]
    fn test_untagged_image_row() {
        let rows = ImageRow::from_record(&record(&[]), false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repository, "<none>");
        assert_eq!(rows[0].tag, "<none>");
        assert_eq!(rows[0].id.len(), 12);
        assert_eq!(rows[0].size, "2.0 KB");
    }

    #[test]
    fn test_row_per_name() {
        let rows = ImageRow::from_record(
            &record(&["docker.io/library/app:1", "docker.io/library/app:latest"]),
            true,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].repository, "app");
        assert_eq!(rows[1].tag, "latest");
        assert!(rows[0].id.starts_with("sha256:"));
    }

    #[test]
    fn test_apply_format() {
        let rows = ImageRow::from_record(&record(&["docker.io/library/app:1"]), false);
        assert_eq!(rows[0].apply_format("{{.Repository}}:{{.Tag}}"), "app:1");
    }
}
