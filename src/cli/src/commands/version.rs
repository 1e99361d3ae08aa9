//! `kiln version` command.

use clap::Args;
use kiln_core::error::Result;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<()> {
    println!("kiln version {}", kiln_engine::VERSION);
    Ok(())
}
