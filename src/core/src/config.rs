use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Engine configuration shared by the library and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of all persisted state (blobs, layers, cache, images)
    pub root: PathBuf,

    /// Layer storage backend
    pub storage_driver: StorageDriverKind,

    /// Command execution backend for RUN
    pub runtime: RuntimeConfig,

    /// Upper bound on stages executing at once
    pub max_parallel_stages: usize,

    /// Skip unknown instructions instead of failing
    pub permissive_instructions: bool,

    /// Wall-clock limit for a single RUN
    pub run_timeout_secs: Option<u64>,

    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace_secs: u64,

    pub default_compression: CompressionKind,

    pub default_manifest_format: ManifestFormatKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            storage_driver: StorageDriverKind::Vfs,
            runtime: RuntimeConfig::default(),
            max_parallel_stages: 4,
            permissive_instructions: false,
            run_timeout_secs: None,
            kill_grace_secs: 10,
            default_compression: CompressionKind::Gzip,
            default_manifest_format: ManifestFormatKind::Oci,
        }
    }
}

/// Supported layer storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriverKind {
    #[default]
    Vfs,
    Overlay,
}

/// Supported execution backends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuntimeConfig {
    /// In-process namespace + chroot launcher
    #[default]
    Chroot,
    /// External OCI runtime binary (runc, crun)
    Oci { binary: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormatKind {
    #[default]
    Oci,
    Docker,
}

impl std::str::FromStr for StorageDriverKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vfs" => Ok(Self::Vfs),
            "overlay" | "overlayfs" => Ok(Self::Overlay),
            other => Err(BuildError::Config(format!(
                "unknown storage driver '{}' (expected vfs or overlay)",
                other
            ))),
        }
    }
}

impl std::str::FromStr for RuntimeConfig {
    type Err = BuildError;

    /// `chroot`, or `oci` / `oci:<binary>` / a bare binary name such as `runc`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(BuildError::Config("empty runtime name".to_string())),
            "chroot" => Ok(Self::Chroot),
            "oci" => Ok(Self::Oci {
                binary: "runc".to_string(),
            }),
            other => {
                let binary = other.strip_prefix("oci:").unwrap_or(other);
                Ok(Self::Oci {
                    binary: binary.to_string(),
                })
            }
        }
    }
}

impl std::str::FromStr for CompressionKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(BuildError::Config(format!(
                "unknown compression '{}' (expected none, gzip or zstd)",
                other
            ))),
        }
    }
}

impl std::str::FromStr for ManifestFormatKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oci" | "ociv1" => Ok(Self::Oci),
            "docker" | "v2s2" | "dockerv2s2" => Ok(Self::Docker),
            other => Err(BuildError::Config(format!(
                "unknown manifest format '{}' (expected oci or docker)",
                other
            ))),
        }
    }
}

/// `$KILN_ROOT`, else `~/.kiln`, else `./.kiln`.
pub fn default_root() -> PathBuf {
    if let Some(root) = std::env::var_os("KILN_ROOT") {
        return PathBuf::from(root);
    }
    dirs::home_dir()
        .map(|h| h.join(".kiln"))
        .unwrap_or_else(|| PathBuf::from(".kiln"))
}

impl EngineConfig {
    /// Configuration rooted at `root`, other fields default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load `<root>/config.yaml` if present, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_root())
    }

    /// Load `<root>/config.yaml` for an explicit root. The root itself is
    /// never taken from the file.
    pub fn load_from(root: PathBuf) -> Result<Self> {
        let mut config = Self::load_file(&root.join("config.yaml"))?.unwrap_or_default();
        config.root = root;
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a YAML config file. `Ok(None)` if the file does not exist.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&data).map_err(|e| {
            BuildError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Loaded engine config");
        Ok(Some(config))
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(driver) = std::env::var("KILN_STORAGE_DRIVER") {
            self.storage_driver = driver.parse()?;
        }
        if let Ok(runtime) = std::env::var("KILN_RUNTIME") {
            self.runtime = runtime.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_stages == 0 {
            return Err(BuildError::Config(
                "max_parallel_stages must be at least 1".to_string(),
            ));
        }
        if self.default_compression == CompressionKind::Zstd
            && self.default_manifest_format == ManifestFormatKind::Docker
        {
            return Err(BuildError::Config(
                "zstd layers require the OCI manifest format".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::with_root("/tmp/kiln");
        assert_eq!(config.root, PathBuf::from("/tmp/kiln"));
        assert_eq!(config.storage_driver, StorageDriverKind::Vfs);
        assert_eq!(config.runtime, RuntimeConfig::Chroot);
        assert_eq!(config.max_parallel_stages, 4);
        assert!(!config.permissive_instructions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file_missing() {
        let tmp = TempDir::new().unwrap();
        assert!(EngineConfig::load_file(&tmp.path().join("config.yaml"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_file_partial() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(
            &path,
            "storage_driver: overlay\nruntime:\n  kind: oci\n  binary: crun\nmax_parallel_stages: 2\n",
        )
        .unwrap();

        let config = EngineConfig::load_file(&path).unwrap().unwrap();
        assert_eq!(config.storage_driver, StorageDriverKind::Overlay);
        assert_eq!(
            config.runtime,
            RuntimeConfig::Oci {
                binary: "crun".to_string()
            }
        );
        assert_eq!(config.max_parallel_stages, 2);
        assert_eq!(config.kill_grace_secs, 10);
    }

    #[test]
    fn test_load_file_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "max_parallel_stages: [oops").unwrap();
        let err = EngineConfig::load_file(&path).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn test_parse_runtime() {
        assert_eq!("chroot".parse::<RuntimeConfig>().unwrap(), RuntimeConfig::Chroot);
        assert_eq!(
            "oci".parse::<RuntimeConfig>().unwrap(),
            RuntimeConfig::Oci {
                binary: "runc".to_string()
            }
        );
        assert_eq!(
            "oci:/usr/bin/crun".parse::<RuntimeConfig>().unwrap(),
            RuntimeConfig::Oci {
                binary: "/usr/bin/crun".to_string()
            }
        );
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("overlay".parse::<StorageDriverKind>().unwrap(), StorageDriverKind::Overlay);
        assert!("btrfs".parse::<StorageDriverKind>().is_err());
        assert_eq!("zstd".parse::<CompressionKind>().unwrap(), CompressionKind::Zstd);
        assert_eq!("docker".parse::<ManifestFormatKind>().unwrap(), ManifestFormatKind::Docker);
        assert!("v1".parse::<ManifestFormatKind>().is_err());
    }

    #[test]
    fn test_validate_rejects_zstd_docker() {
        let config = EngineConfig {
            default_compression: CompressionKind::Zstd,
            default_manifest_format: ManifestFormatKind::Docker,
            ..EngineConfig::with_root("/tmp/kiln")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = EngineConfig {
            max_parallel_stages: 0,
            ..EngineConfig::with_root("/tmp/kiln")
        };
        assert!(config.validate().is_err());
    }
}
