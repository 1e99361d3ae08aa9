//! Fingerprint to layer mapping.
//!
//! One JSON file per fingerprint under `<root>/cache/`. Entries are created
//! with an atomic link so that two stages racing on the same fingerprint
//! agree on a single winner; the loser adopts the winner's layer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::Digest;
use crate::store::layer::LayerId;

/// What a fingerprint resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Digest,
    /// Top layer after the step; `None` while the stage is still empty
    pub layer: Option<LayerId>,
    /// Whether the step added no filesystem change
    pub empty_layer: bool,
    /// Digest of the image config blob after the step
    pub state: Digest,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
}

#[derive(Debug, Clone)]
pub struct LayerCache {
    dir: PathBuf,
    enabled: bool,
}

impl LayerCache {
    pub fn new(root: &Path) -> Result<Self> {
        let dir = root.join("cache");
        fs::create_dir_all(&dir).map_err(|e| {
            BuildError::storage(format!(
                "Failed to create layer cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir, enabled: true })
    }

    /// Same store with lookups disabled. Records still go through.
    pub fn disabled(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entry_path(&self, fingerprint: &Digest) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.hex()))
    }

    pub fn lookup(&self, fingerprint: &Digest) -> Result<CacheLookup> {
        if !self.enabled {
            return Ok(CacheLookup::Miss);
        }
        Ok(match self.read(fingerprint)? {
            Some(entry) => CacheLookup::Hit(entry),
            None => CacheLookup::Miss,
        })
    }

    fn read(&self, fingerprint: &Digest) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CacheEntry>(&data) {
            Ok(entry) if &entry.fingerprint == fingerprint => Ok(Some(entry)),
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "Discarding corrupt cache entry");
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Record `entry`. Recording the same layer twice is a no-op; a
    /// different layer for a known fingerprint is `CacheInconsistent`.
    pub fn record(&self, entry: &CacheEntry) -> Result<()> {
        let existing = self.record_or_adopt(entry)?;
        if existing.layer != entry.layer {
            return Err(inconsistent(entry, &existing));
        }
        Ok(())
    }

    /// Record `entry`, or return the entry that won a concurrent race.
    pub fn record_or_adopt(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let path = self.entry_path(&entry.fingerprint);
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        fs::write(tmp.path(), serde_json::to_vec_pretty(entry)?)?;

        match fs::hard_link(tmp.path(), &path) {
            Ok(()) => {
                debug!(
                    fingerprint = %entry.fingerprint.short(),
                    layer = ?entry.layer.as_ref().map(|l| l.short().to_string()),
                    "Recorded cache entry"
                );
                Ok(entry.clone())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match self.read(&entry.fingerprint)? {
                Some(existing) => Ok(existing),
                // Lost to a corrupt entry that was just discarded.
                None => {
                    fs::hard_link(tmp.path(), &path)?;
                    Ok(entry.clone())
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    pub fn invalidate(&self, fingerprint: &Digest) -> Result<()> {
        match fs::remove_file(self.entry_path(fingerprint)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(entry) = serde_json::from_slice::<CacheEntry>(&fs::read(&path)?) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Remove entries for which `keep` returns false. Returns the count.
    pub fn prune(&self, mut keep: impl FnMut(&CacheEntry) -> bool) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if !keep(&entry) {
                self.invalidate(&entry.fingerprint)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn inconsistent(entry: &CacheEntry, existing: &CacheEntry) -> BuildError {
    let show = |l: &Option<LayerId>| l.as_ref().map(|l| l.to_string()).unwrap_or_else(|| "<none>".into());
    BuildError::CacheInconsistent(format!(
        "fingerprint {} maps to {} but {} was recorded",
        entry.fingerprint,
        show(&existing.layer),
        show(&entry.layer)
    ))
}
