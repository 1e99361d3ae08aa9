//! Materialization of layer chains into working trees.
//!
//! `vfs` copies: every mount extracts the whole chain into a fresh
//! directory. `overlay` extracts each layer once into `overlay/<hex>/diff`
//! and stacks the chain as overlayfs lower directories under a private
//! upper directory. Both drivers compute diffs the same way, by comparing
//! snapshots of the merged tree, so the produced layers are identical.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_core::config::StorageDriverKind;
use kiln_core::error::{BuildError, Result};
use tracing::{debug, warn};

use super::changes::{self, WhiteoutMode};
use super::content::ContentStore;
use super::layer::Layer;
use crate::fsutil;

/// A materialized working tree.
#[derive(Debug)]
pub struct DriverMount {
    /// Mount directory owned by the store
    pub dir: PathBuf,
    /// Tree presented to callers
    pub rootfs: PathBuf,
    overlay: bool,
}

#[derive(Debug)]
pub enum StorageDriver {
    Vfs,
    Overlay { layers_dir: PathBuf },
}

impl StorageDriver {
    pub fn new(kind: StorageDriverKind, root: &Path) -> Result<Self> {
        match kind {
            StorageDriverKind::Vfs => Ok(StorageDriver::Vfs),
            StorageDriverKind::Overlay => {
                let layers_dir = root.join("overlay");
                fs::create_dir_all(layers_dir.join("empty"))?;
                Ok(StorageDriver::Overlay { layers_dir })
            }
        }
    }

    pub fn kind(&self) -> StorageDriverKind {
        match self {
            StorageDriver::Vfs => StorageDriverKind::Vfs,
            StorageDriver::Overlay { .. } => StorageDriverKind::Overlay,
        }
    }

    /// Release every mount directory left by a previous process.
    pub fn recover(&self, mounts_dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(mounts_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            let merged = dir.join("merged");
            if merged.exists() {
                let _ = umount_detach(&merged);
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "Removed stale mount"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove stale mount"),
            }
        }
        Ok(())
    }

    /// Per-layer work when a layer is first recorded.
    pub fn prepare_layer(&self, layer: &Layer, content: &ContentStore) -> Result<()> {
        match self {
            StorageDriver::Vfs => Ok(()),
            StorageDriver::Overlay { layers_dir } => {
                let dir = layers_dir.join(layer.id.0.hex());
                let diff_dir = dir.join("diff");
                if diff_dir.exists() {
                    return Ok(());
                }
                let staging = dir.join("diff.partial");
                let _ = fsutil::remove_any(&staging);
                fs::create_dir_all(&staging)?;
                changes::apply_diff(&staging, content.open(&layer.diff_digest)?, WhiteoutMode::Overlay)?;
                fs::rename(&staging, &diff_dir)?;
                Ok(())
            }
        }
    }

    pub fn remove_layer(&self, layer: &Layer) -> Result<()> {
        if let StorageDriver::Overlay { layers_dir } = self {
            fsutil::remove_any(&layers_dir.join(layer.id.0.hex()))?;
        }
        Ok(())
    }

    /// Materialize `chain` (base first) under `dir`.
    pub fn mount(&self, dir: &Path, chain: &[Layer], content: &ContentStore) -> Result<DriverMount> {
        match self {
            StorageDriver::Vfs => {
                let rootfs = dir.join("rootfs");
                fs::create_dir_all(&rootfs)?;
                for layer in chain {
                    changes::apply_diff(
                        &rootfs,
                        content.open(&layer.diff_digest)?,
                        WhiteoutMode::Apply,
                    )?;
                }
                Ok(DriverMount {
                    dir: dir.to_path_buf(),
                    rootfs,
                    overlay: false,
                })
            }
            StorageDriver::Overlay { layers_dir } => {
                let mut lower: Vec<String> = Vec::with_capacity(chain.len().max(1));
                for layer in chain.iter().rev() {
                    let diff_dir = layers_dir.join(layer.id.0.hex()).join("diff");
                    if !diff_dir.exists() {
                        self.prepare_layer(layer, content)?;
                    }
                    lower.push(diff_dir.to_string_lossy().into_owned());
                }
                if lower.is_empty() {
                    lower.push(layers_dir.join("empty").to_string_lossy().into_owned());
                }
                let upper = dir.join("upper");
                let work = dir.join("work");
                let merged = dir.join("merged");
                for d in [&upper, &work, &merged] {
                    fs::create_dir_all(d)?;
                }
                let options = format!(
                    "lowerdir={},upperdir={},workdir={}",
                    lower.join(":"),
                    upper.display(),
                    work.display()
                );
                mount_overlay(&merged, &options)?;
                Ok(DriverMount {
                    dir: dir.to_path_buf(),
                    rootfs: merged,
                    overlay: true,
                })
            }
        }
    }

    pub fn unmount(&self, mount: &DriverMount) -> Result<()> {
        if mount.overlay {
            umount_detach(&mount.rootfs)?;
        }
        fs::remove_dir_all(&mount.dir).map_err(|e| {
            BuildError::MountFailed(format!("removing {}: {}", mount.dir.display(), e))
        })
    }
}

#[cfg(target_os = "linux")]
fn mount_overlay(target: &Path, options: &str) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        MsFlags::empty(),
        Some(options),
    )
    .map_err(|e| match e {
        nix::errno::Errno::EPERM => BuildError::PermissionDenied(format!(
            "overlay mount of {} requires privileges",
            target.display()
        )),
        e => BuildError::MountFailed(format!("overlay mount of {}: {}", target.display(), e)),
    })
}

#[cfg(not(target_os = "linux"))]
fn mount_overlay(target: &Path, _options: &str) -> Result<()> {
    Err(BuildError::MountFailed(format!(
        "overlay driver is only available on Linux ({})",
        target.display()
    )))
}

#[cfg(target_os = "linux")]
fn umount_detach(target: &Path) -> Result<()> {
    use nix::mount::{umount2, MntFlags};

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(BuildError::MountFailed(format!(
            "unmount {}: {}",
            target.display(),
            e
        ))),
    }
}

#[cfg(not(target_os = "linux"))]
fn umount_detach(_target: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vfs_mount_empty_chain() {
        let tmp = TempDir::new().unwrap();
        let content = ContentStore::init(tmp.path()).unwrap();
        let driver = StorageDriver::new(StorageDriverKind::Vfs, tmp.path()).unwrap();
        let dir = tmp.path().join("m");
        let mount = driver.mount(&dir, &[], &content).unwrap();
        assert!(mount.rootfs.is_dir());
        assert_eq!(fs::read_dir(&mount.rootfs).unwrap().count(), 0);
        driver.unmount(&mount).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_recover_removes_leftovers() {
        let tmp = TempDir::new().unwrap();
        let mounts = tmp.path().join("mounts");
        fs::create_dir_all(mounts.join("stale/rootfs/etc")).unwrap();
        let driver = StorageDriver::new(StorageDriverKind::Vfs, tmp.path()).unwrap();
        driver.recover(&mounts).unwrap();
        assert_eq!(fs::read_dir(&mounts).unwrap().count(), 0);
    }
}
