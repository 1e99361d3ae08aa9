//! Volume bookkeeping for RUN steps.
//!
//! Paths declared with VOLUME keep their content across RUN: the tracker
//! archives each volume before the process starts and puts the archived
//! state back afterwards, so writes under a volume never reach a layer.
//! COPY and ADD still land in volumes; they invalidate the saved copy so the
//! next RUN archives the new content.
//!
//! Archives are taken lazily. A volume that nothing touched since its last
//! archive keeps the old one.

use std::fs::{self, File};
use std::io::BufWriter;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use tempfile::TempDir;
use tracing::debug;

use crate::fsutil;
use crate::store::changes::{self, DirSnapshot, EntryKind, EntryMeta, WhiteoutMode};

/// Saved state of one volume.
enum Saved {
    /// The path did not exist; restore removes whatever RUN created there.
    Absent,
    Present {
        archive: PathBuf,
        /// Metadata of the volume directory itself
        dir: EntryMeta,
        /// Metadata of everything beneath it, for exact timestamps on restore
        tree: DirSnapshot,
    },
}

struct Volume {
    path: String,
    saved: Option<Saved>,
}

/// Tracks the volumes declared in one stage.
pub struct VolumeTracker {
    rootfs: PathBuf,
    scratch: TempDir,
    volumes: Vec<Volume>,
    next_archive: u64,
}

impl VolumeTracker {
    pub fn new(rootfs: &Path) -> Result<Self> {
        Ok(Self {
            rootfs: rootfs.to_path_buf(),
            scratch: TempDir::new()?,
            volumes: Vec::new(),
            next_archive: 0,
        })
    }

    /// Start tracking `path`. Nested declarations collapse into the
    /// outermost volume.
    pub fn declare(&mut self, path: &str) {
        let path = fsutil::clean_path(path);
        if let Some(outer) = self
            .volumes
            .iter_mut()
            .find(|v| fsutil::is_within(&path, &v.path))
        {
            if outer.path != path {
                debug!(volume = %path, outer = %outer.path, "Volume nested in existing volume");
                outer.saved = None;
            }
            return;
        }
        // A parent of existing volumes replaces them.
        self.volumes.retain(|v| !fsutil::is_within(&v.path, &path));
        debug!(volume = %path, "Tracking volume");
        self.volumes.push(Volume { path, saved: None });
    }

    /// Content at or around `path` changed outside of RUN; re-archive the
    /// affected volumes before the next RUN.
    pub fn invalidate(&mut self, path: &str) {
        let path = fsutil::clean_path(path);
        for volume in &mut self.volumes {
            if fsutil::is_within(&path, &volume.path) || fsutil::is_within(&volume.path, &path) {
                volume.saved = None;
            }
        }
    }

    /// Invalidate every volume, e.g. after the tree was replaced by a cached
    /// layer.
    pub fn invalidate_all(&mut self) {
        for volume in &mut self.volumes {
            volume.saved = None;
        }
    }

    /// Archive every volume that has no current archive.
    pub fn snapshot_all(&mut self) -> Result<()> {
        for i in 0..self.volumes.len() {
            if self.volumes[i].saved.is_some() {
                continue;
            }
            let path = self.volumes[i].path.clone();
            let saved = self.save(&path)?;
            self.volumes[i].saved = Some(saved);
        }
        Ok(())
    }

    fn save(&mut self, path: &str) -> Result<Saved> {
        let host = fsutil::resolve_in_root(&self.rootfs, path)?;
        let meta = match fs::symlink_metadata(&host) {
            Ok(meta) if meta.is_dir() => meta,
            Ok(_) => {
                return Err(BuildError::storage(format!(
                    "volume {} exists and is not a directory",
                    path
                )))
            }
            Err(_) => {
                debug!(volume = %path, "Volume path absent");
                return Ok(Saved::Absent);
            }
        };
        let dir = EntryMeta::from_metadata(&meta, &host)?;

        self.next_archive += 1;
        let archive = self
            .scratch
            .path()
            .join(format!("volume-{}.tar", self.next_archive));
        let file = BufWriter::new(File::create(&archive)?);
        let (file, stats) = changes::write_tree(&host, file)?;
        file.into_inner()
            .map_err(|e| BuildError::Io(e.into_error()))?
            .sync_all()?;
        let tree = DirSnapshot::capture(&host)?;
        debug!(volume = %path, entries = stats.entries, bytes = stats.content_size, "Archived volume");
        Ok(Saved::Present { archive, dir, tree })
    }

    /// Put every volume back to its archived state. Returns the restored
    /// paths; their content matches the last commit again, but not their
    /// inodes.
    pub fn restore_all(&self) -> Result<Vec<String>> {
        let mut restored = Vec::new();
        for volume in &self.volumes {
            let Some(saved) = &volume.saved else {
                continue;
            };
            let host = fsutil::resolve_in_root(&self.rootfs, &volume.path)?;
            match saved {
                Saved::Absent => fsutil::remove_any(&host)?,
                Saved::Present { archive, dir, tree } => {
                    restore_dir(&host, archive, dir, tree)?;
                    debug!(volume = %volume.path, "Restored volume");
                }
            }
            restored.push(volume.path.clone());
        }
        Ok(restored)
    }
}

fn restore_dir(host: &Path, archive: &Path, dir: &EntryMeta, tree: &DirSnapshot) -> Result<()> {
    match fs::symlink_metadata(host) {
        Ok(meta) if meta.is_dir() => fsutil::clear_dir(host)?,
        Ok(_) => {
            fsutil::remove_any(host)?;
            fs::create_dir_all(host)?;
        }
        Err(_) => fs::create_dir_all(host)?,
    }
    changes::apply_diff(host, File::open(archive)?, WhiteoutMode::Ignore)?;

    // Tar headers carry whole seconds only.
    for (rel, meta) in &tree.entries {
        if meta.kind != EntryKind::Dir {
            let path = host.join(rel);
            if fs::symlink_metadata(&path).is_ok() {
                fsutil::set_mtime(&path, meta.mtime, meta.mtime_nsec)?;
            }
        }
    }
    fsutil::lchown_if_privileged(host, dir.uid, dir.gid)?;
    fs::set_permissions(host, fs::Permissions::from_mode(dir.mode))?;
    fsutil::set_mtime(host, dir.mtime, dir.mtime_nsec)?;
    Ok(())
}
