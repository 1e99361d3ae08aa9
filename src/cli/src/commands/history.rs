//! `kiln history` command - Show image history.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::oci::HistoryEntry;
use kiln_engine::{ImageStore, LayerStore};

use crate::output;

#[derive(Args)]
pub struct HistoryArgs {
    /// Image name or id
    pub image: String,

    /// Only show layer diff ids
    #[arg(short, long)]
    pub quiet: bool,

    /// Do not truncate output
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(args: HistoryArgs, root: Option<PathBuf>) -> Result<()> {
    let services = super::open_services(root)?;
    let id = super::find_image(&services, &args.image)?;
    let config = services.images.config(&id)?;

    if args.quiet {
        for diff_id in &config.rootfs.diff_ids {
            println!("{diff_id}");
        }
        return Ok(());
    }

    // Uncompressed size of each non-empty layer, base first.
    let layer_sizes: Vec<u64> = match services.images.get(&id)?.and_then(|r| r.top_layer) {
        Some(top) => services
            .layers
            .chain(&top)?
            .iter()
            .map(|l| l.uncompressed_size)
            .collect(),
        None => Vec::new(),
    };

    let mut table = output::new_table(&["CREATED", "CREATED BY", "SIZE", "COMMENT"]);
    for row in history_rows(&config.history, &layer_sizes, args.no_trunc).into_iter().rev() {
        table.add_row(row);
    }
    println!("{table}");
    Ok(())
}

/// Rows in commit order; each non-empty entry takes the next layer size.
fn history_rows(history: &[HistoryEntry], layer_sizes: &[u64], no_trunc: bool) -> Vec<[String; 4]> {
    let mut layer_idx = 0;
    history
        .iter()
        .map(|entry| {
            let created = entry
                .created
                .as_ref()
                .map(output::format_ago)
                .unwrap_or_else(|| "<unknown>".to_string());
            let created_by = entry.created_by.clone().unwrap_or_default();
            let created_by = if no_trunc {
                created_by
            } else {
                output::truncate_str(&created_by, 60)
            };
            let size = if entry.empty_layer {
                "0 B".to_string()
            } else {
                let s = layer_sizes.get(layer_idx).copied().unwrap_or(0);
                layer_idx += 1;
                output::format_bytes(s)
            };
            [created, created_by, size, entry.comment.clone().unwrap_or_default()]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(created_by: &str, empty_layer: bool) -> HistoryEntry {
        HistoryEntry {
            created_by: Some(created_by.to_string()),
            empty_layer,
            ..Default::default()
        }
    }

    #[test]
    fn test_sizes_follow_non_empty_entries() {
        let history = vec![
            entry("FROM scratch", true),
            entry("COPY a /", false),
            entry("ENV A=1", true),
            entry("RUN make", false),
        ];
        let rows = history_rows(&history, &[2048, 10], false);
        assert_eq!(rows[0][2], "0 B");
        assert_eq!(rows[1][2], "2.0 KB");
        assert_eq!(rows[2][2], "0 B");
        assert_eq!(rows[3][2], "10 B");
        assert_eq!(rows[0][0], "<unknown>");
    }

    #[test]
    fn test_created_by_truncation() {
        let long = format!("RUN {}", "x".repeat(100));
        let history = vec![entry(&long, true)];
        assert_eq!(history_rows(&history, &[], false)[0][1].len(), 60);
        assert_eq!(history_rows(&history, &[], true)[0][1], long);
    }
}
