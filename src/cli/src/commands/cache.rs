//! `kiln cache` commands - layer cache housekeeping.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use kiln_core::error::Result;

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Remove dangling cache entries and unreferenced layers and blobs
    Prune(PruneArgs),
}

#[derive(Args)]
pub struct PruneArgs {
    /// Drop every cache entry, not just dangling ones
    #[arg(short, long)]
    pub all: bool,
}

pub async fn execute(command: CacheCommand, root: Option<PathBuf>) -> Result<()> {
    match command {
        CacheCommand::Prune(args) => {
            let services = super::open_services(root)?;
            let report = services.prune(args.all)?;
            println!(
                "Removed {} cache entries, {} layers, {} blobs",
                report.cache_entries, report.layers, report.blobs
            );
            Ok(())
        }
    }
}
