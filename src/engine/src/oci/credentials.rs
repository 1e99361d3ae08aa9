//! Registry logins saved by `kiln login`.
//!
//! One JSON document at `<root>/auth/credentials.json`, keyed by the
//! registry host the way image references name it (`docker.io`, never
//! `index.docker.io`), so a push of `alpine` finds the login for Docker Hub.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::reference::DEFAULT_REGISTRY;

/// Hosts that all mean Docker Hub.
const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "registry-1.docker.io"];

/// Username and password for one registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: BTreeMap<String, RegistryCredential>,
}

/// The credential file of one engine root.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn under_root(root: &Path) -> Self {
        Self {
            path: root.join("auth").join("credentials.json"),
        }
    }

    /// Save a login, replacing any earlier one for the same registry.
    pub fn store(&self, server: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        let key = registry_key(server);
        debug!(registry = %key, username, "Storing registry login");
        file.auths.insert(
            key,
            RegistryCredential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    pub fn get(&self, server: &str) -> Result<Option<RegistryCredential>> {
        Ok(self.load()?.auths.remove(&registry_key(server)))
    }

    /// Forget the login for a registry. False when there was none.
    pub fn remove(&self, server: &str) -> Result<bool> {
        let mut file = self.load()?;
        if file.auths.remove(&registry_key(server)).is_none() {
            return Ok(false);
        }
        self.save(&file)?;
        Ok(true)
    }

    fn load(&self) -> Result<AuthFile> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AuthFile::default()),
            Err(e) => {
                return Err(BuildError::Config(format!(
                    "Failed to read credentials {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&data).map_err(|e| {
            BuildError::Config(format!(
                "Malformed credentials {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Replace the file in one rename; only the owner may read it.
    fn save(&self, file: &AuthFile) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| BuildError::Config("credential path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        serde_json::to_writer_pretty(&mut tmp, file)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| BuildError::Io(e.error))?;
        Ok(())
    }
}

/// Registry host a login is filed under. Scheme, path and letter case are
/// dropped; Docker Hub aliases and an empty server mean `docker.io`.
pub fn registry_key(server: &str) -> String {
    let server = server.trim();
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = host.split('/').next().unwrap_or_default().to_lowercase();
    if host.is_empty() || DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DEFAULT_REGISTRY.to_string()
    } else {
        host
    }
}
