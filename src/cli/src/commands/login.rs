//! `kiln login` command - Store registry credentials.

use std::io::BufRead;
use std::path::PathBuf;

use clap::Args;
use kiln_core::error::{BuildError, Result};
use kiln_engine::oci::credentials::{registry_key, CredentialStore};

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

pub async fn execute(args: LoginArgs, root: Option<PathBuf>) -> Result<()> {
    let config = super::engine_config(root)?;
    let server = registry_key(args.server.as_deref().unwrap_or_default());

    let username = match args.username {
        Some(u) => u,
        None => {
            eprint!("Username: ");
            read_line()?
        }
    };

    let password = if args.password_stdin {
        read_line()?
    } else {
        match args.password {
            Some(p) => p,
            None => {
                eprint!("Password: ");
                read_line()?
            }
        }
    };

    if username.is_empty() || password.is_empty() {
        return Err(BuildError::Usage("Username and password are required".to_string()));
    }

    CredentialStore::under_root(&config.root).store(&server, &username, &password)?;
    println!("Login Succeeded");
    Ok(())
}

fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
