//! `kiln logout` command - Remove stored registry credentials.

use std::path::PathBuf;

use clap::Args;
use kiln_core::error::Result;
use kiln_engine::oci::credentials::{registry_key, CredentialStore};

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,
}

pub async fn execute(args: LogoutArgs, root: Option<PathBuf>) -> Result<()> {
    let config = super::engine_config(root)?;
    let server = registry_key(args.server.as_deref().unwrap_or_default());

    if CredentialStore::under_root(&config.root).remove(&server)? {
        println!("Removing login credentials for {}", server);
    } else {
        println!("Not logged in to {}", server);
    }
    Ok(())
}
