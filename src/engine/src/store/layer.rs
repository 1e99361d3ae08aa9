//! Parent-chained diff layers.
//!
//! A layer is an immutable diff tar stored uncompressed in the
//! [`ContentStore`] under its diff digest, plus a small JSON record under
//! `<root>/layers/`. Layer identity is the chain id: the diff digest for a
//! base layer, `sha256(parent + " " + diff)` otherwise, so the same diff on
//! two different parents yields two layers.
//!
//! Mounts are writable working trees. Each mount keeps a baseline snapshot;
//! `commit` turns the difference between baseline and live tree into a new
//! layer and moves the baseline forward.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_core::config::StorageDriverKind;
use kiln_core::error::{BuildError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::changes::{self, DirSnapshot, WhiteoutMode};
use super::content::ContentStore;
use super::driver::{DriverMount, StorageDriver};
use crate::digest::Digest;

/// Chain id of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub Digest);

impl LayerId {
    /// Identity of a layer with `diff` on top of `parent`.
    pub fn chain(parent: Option<&LayerId>, diff: &Digest) -> Self {
        match parent {
            None => LayerId(diff.clone()),
            Some(parent) => LayerId(Digest::of_bytes(
                format!("{} {}", parent.0, diff).as_bytes(),
            )),
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.short()
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable layer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    pub diff_digest: Digest,
    /// Size of the diff tar
    pub diff_size: u64,
    /// Bytes of file content once extracted
    pub uncompressed_size: u64,
    pub created_at: DateTime<Utc>,
}

/// Token for a mounted working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub id: String,
    pub root: PathBuf,
    pub label: String,
}

/// Outcome of [`LayerStore::commit`].
#[derive(Debug)]
pub enum CommitOutcome {
    /// The tree did not change; the parent remains the top layer.
    Empty,
    /// A new layer, with its diff opened for reading.
    Layer { layer: Layer, diff: fs::File },
}

/// Layered diff storage consumed by the engine.
pub trait LayerStore: Send + Sync {
    fn driver(&self) -> StorageDriverKind;

    fn get(&self, id: &LayerId) -> Result<Option<Layer>>;

    fn exists(&self, id: &LayerId) -> bool;

    /// Ancestor chain of `top`, ordered from base to top.
    fn chain(&self, top: &LayerId) -> Result<Vec<Layer>>;

    /// Mount `layer` (or an empty tree) as a writable working tree.
    fn mount(&self, layer: Option<&LayerId>, label: &str) -> Result<MountHandle>;

    fn unmount(&self, handle: &MountHandle) -> Result<()>;

    /// Capture changes since the mount's baseline as a child of `parent`.
    fn commit(&self, parent: Option<&LayerId>, handle: &MountHandle) -> Result<CommitOutcome>;

    /// Bring a mount at `layer`'s parent forward to `layer` without a commit.
    fn apply(&self, handle: &MountHandle, layer: &LayerId) -> Result<()>;

    /// Take the current state of `paths` (absolute inside the mount) as
    /// already committed. For trees put back to their committed content by
    /// other means, such as restored volumes.
    fn refresh_baseline(&self, handle: &MountHandle, paths: &[String]) -> Result<()>;

    fn diff_digest(&self, layer: &Layer) -> Result<Digest>;

    /// Open the uncompressed diff tar of a layer.
    fn open_diff(&self, id: &LayerId) -> Result<fs::File>;

    /// Import an uncompressed diff as a child of `parent`.
    fn register(&self, parent: Option<&LayerId>, diff: &mut dyn Read) -> Result<Layer>;

    fn remove(&self, id: &LayerId) -> Result<()>;

    fn list(&self) -> Result<Vec<Layer>>;

    /// Release every mount still held.
    fn shutdown(&self) -> Result<()>;
}

/// Unmounts on drop.
pub struct MountGuard {
    store: Arc<dyn LayerStore>,
    handle: MountHandle,
}

impl MountGuard {
    pub fn new(store: Arc<dyn LayerStore>, handle: MountHandle) -> Self {
        Self { store, handle }
    }

    pub fn handle(&self) -> &MountHandle {
        &self.handle
    }

    pub fn store(&self) -> &Arc<dyn LayerStore> {
        &self.store
    }

    pub fn root(&self) -> &Path {
        &self.handle().root
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.unmount(&self.handle) {
            warn!(mount = %self.handle.id, error = %e, "Failed to release mount");
        }
    }
}

struct MountState {
    handle: MountHandle,
    top: Option<LayerId>,
    baseline: DirSnapshot,
    driver_mount: DriverMount,
}

/// Local layer store over a [`StorageDriver`].
pub struct LocalLayerStore {
    layers_dir: PathBuf,
    mounts_dir: PathBuf,
    content: Arc<ContentStore>,
    driver: StorageDriver,
    records: RwLock<HashMap<LayerId, Layer>>,
    mounts: Mutex<HashMap<String, MountState>>,
}

impl LocalLayerStore {
    /// Open the store; mounts left by an interrupted process are released.
    pub fn init(root: &Path, content: Arc<ContentStore>, driver: StorageDriverKind) -> Result<Self> {
        let layers_dir = root.join("layers");
        let mounts_dir = root.join("mounts");
        for dir in [&layers_dir, &mounts_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                BuildError::storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        let driver = StorageDriver::new(driver, root)?;
        driver.recover(&mounts_dir)?;

        let mut records = HashMap::new();
        for entry in fs::read_dir(&layers_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(BuildError::from)
                .and_then(|data| Ok(serde_json::from_slice::<Layer>(&data)?))
            {
                Ok(layer) => {
                    records.insert(layer.id.clone(), layer);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable layer record"),
            }
        }
        debug!(count = records.len(), "Loaded layer records");

        Ok(Self {
            layers_dir,
            mounts_dir,
            content,
            driver,
            records: RwLock::new(records),
            mounts: Mutex::new(HashMap::new()),
        })
    }

    /// Run `f` on the state of an active mount. The state is taken out of
    /// the map meanwhile, so diff and blob I/O of one stage does not block
    /// the mounts of another.
    fn with_mount<T>(
        &self,
        handle: &MountHandle,
        f: impl FnOnce(&mut MountState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.mounts.lock().remove(&handle.id).ok_or_else(|| {
            BuildError::storage(format!("mount {} is not active", handle.id))
        })?;
        let result = f(&mut state);
        self.mounts.lock().insert(handle.id.clone(), state);
        result
    }

    fn record_path(&self, id: &LayerId) -> PathBuf {
        self.layers_dir.join(format!("{}.json", id.0.hex()))
    }

    fn persist(&self, layer: &Layer) -> Result<()> {
        let data = serde_json::to_vec_pretty(layer)?;
        let tmp = self.record_path(&layer.id).with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, self.record_path(&layer.id))?;
        self.records.write().insert(layer.id.clone(), layer.clone());
        Ok(())
    }

    /// Store a diff already written to `tmp` and record the layer.
    fn finish_layer(
        &self,
        parent: Option<&LayerId>,
        diff: fs::File,
        uncompressed_size: u64,
    ) -> Result<Layer> {
        if let Some(parent) = parent {
            if !self.exists(parent) {
                return Err(BuildError::storage_layer(
                    "parent layer does not exist",
                    parent.to_string(),
                ));
            }
        }
        let mut diff = diff;
        diff.seek(SeekFrom::Start(0))?;
        let (diff_digest, diff_size) = self.content.put_reader(&mut diff)?;
        let id = LayerId::chain(parent, &diff_digest);
        if let Some(existing) = self.get(&id)? {
            return Ok(existing);
        }
        let layer = Layer {
            id,
            parent: parent.cloned(),
            diff_digest,
            diff_size,
            uncompressed_size,
            created_at: Utc::now(),
        };
        self.driver.prepare_layer(&layer, &self.content)?;
        self.persist(&layer)?;
        info!(layer = %layer.id.short(), parent = ?parent.map(|p| p.short().to_string()), diff_size, "Committed layer");
        Ok(layer)
    }
}

impl LayerStore for LocalLayerStore {
    fn driver(&self) -> StorageDriverKind {
        self.driver.kind()
    }

    fn get(&self, id: &LayerId) -> Result<Option<Layer>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn exists(&self, id: &LayerId) -> bool {
        self.records.read().contains_key(id)
    }

    fn chain(&self, top: &LayerId) -> Result<Vec<Layer>> {
        let records = self.records.read();
        let mut chain = Vec::new();
        let mut cursor = Some(top.clone());
        while let Some(id) = cursor {
            let layer = records.get(&id).ok_or_else(|| {
                BuildError::storage_layer("layer missing from store", id.to_string())
            })?;
            cursor = layer.parent.clone();
            chain.push(layer.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    fn mount(&self, layer: Option<&LayerId>, label: &str) -> Result<MountHandle> {
        let chain = match layer {
            Some(id) => self.chain(id)?,
            None => Vec::new(),
        };
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.mounts_dir.join(&id);
        fs::create_dir_all(&dir)?;

        let driver_mount = match self.driver.mount(&dir, &chain, &self.content) {
            Ok(m) => m,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        };
        let baseline = DirSnapshot::capture(&driver_mount.rootfs)?;
        let handle = MountHandle {
            id: id.clone(),
            root: driver_mount.rootfs.clone(),
            label: label.to_string(),
        };
        debug!(mount = %id, label, layer = ?layer.map(|l| l.short().to_string()), "Mounted layer");
        self.mounts.lock().insert(
            id,
            MountState {
                handle: handle.clone(),
                top: layer.cloned(),
                baseline,
                driver_mount,
            },
        );
        Ok(handle)
    }

    fn unmount(&self, handle: &MountHandle) -> Result<()> {
        let state = self.mounts.lock().remove(&handle.id);
        if let Some(state) = state {
            self.driver.unmount(&state.driver_mount)?;
            debug!(mount = %handle.id, label = %state.handle.label, "Released mount");
        }
        Ok(())
    }

    fn commit(&self, parent: Option<&LayerId>, handle: &MountHandle) -> Result<CommitOutcome> {
        self.with_mount(handle, |state| {
            if state.top.as_ref() != parent {
                return Err(BuildError::storage_layer(
                    format!(
                        "commit parent does not match mount top {:?}",
                        state.top.as_ref().map(|t| t.to_string())
                    ),
                    parent.map(|p| p.to_string()).unwrap_or_default(),
                ));
            }

            let after = DirSnapshot::capture(&handle.root)?;
            let change_set = state.baseline.changes(&after);
            if change_set.is_empty() {
                state.baseline = after;
                return Ok(CommitOutcome::Empty);
            }

            let tmp = tempfile::tempfile()?;
            let (writer, stats) =
                changes::write_diff(&handle.root, &after, &change_set, BufWriter::new(tmp))?;
            let file = writer
                .into_inner()
                .map_err(|e| BuildError::storage(e.into_error().to_string()))?;
            let layer = self.finish_layer(parent, file, stats.content_size)?;

            state.top = Some(layer.id.clone());
            state.baseline = after;
            let diff = self.content.open(&layer.diff_digest)?;
            Ok(CommitOutcome::Layer { layer, diff })
        })
    }

    fn apply(&self, handle: &MountHandle, layer_id: &LayerId) -> Result<()> {
        let layer = self
            .get(layer_id)?
            .ok_or_else(|| BuildError::storage_layer("layer missing from store", layer_id.to_string()))?;
        self.with_mount(handle, |state| {
            if state.top.as_ref() == Some(layer_id) {
                return Ok(());
            }
            if layer.parent != state.top {
                return Err(BuildError::storage_layer(
                    "layer is not a child of the mounted top",
                    layer_id.to_string(),
                ));
            }
            let diff = self.content.open(&layer.diff_digest)?;
            changes::apply_diff(&handle.root, diff, WhiteoutMode::Apply)?;
            state.top = Some(layer.id.clone());
            state.baseline = DirSnapshot::capture(&handle.root)?;
            Ok(())
        })
    }

    fn refresh_baseline(&self, handle: &MountHandle, paths: &[String]) -> Result<()> {
        self.with_mount(handle, |state| {
            for path in paths {
                let rel = Path::new(path.trim_start_matches('/'));
                state.baseline.refresh(&handle.root, rel)?;
            }
            Ok(())
        })
    }

    fn diff_digest(&self, layer: &Layer) -> Result<Digest> {
        if !self.content.exists(&layer.diff_digest) {
            return Err(BuildError::storage_layer(
                "diff blob missing",
                layer.id.to_string(),
            ));
        }
        Ok(layer.diff_digest.clone())
    }

    fn open_diff(&self, id: &LayerId) -> Result<fs::File> {
        let layer = self
            .get(id)?
            .ok_or_else(|| BuildError::storage_layer("layer missing from store", id.to_string()))?;
        self.content.open(&layer.diff_digest)
    }

    fn register(&self, parent: Option<&LayerId>, diff: &mut dyn Read) -> Result<Layer> {
        let mut tmp = tempfile::tempfile()?;
        std::io::copy(diff, &mut tmp)?;
        tmp.seek(SeekFrom::Start(0))?;
        let content_size = tar_content_size(&mut tmp)?;
        self.finish_layer(parent, tmp, content_size)
    }

    fn remove(&self, id: &LayerId) -> Result<()> {
        let children = self
            .records
            .read()
            .values()
            .any(|l| l.parent.as_ref() == Some(id));
        if children {
            return Err(BuildError::storage_layer("layer has children", id.to_string()));
        }
        let layer = self.records.write().remove(id);
        if let Some(layer) = layer {
            let _ = fs::remove_file(self.record_path(id));
            self.driver.remove_layer(&layer)?;
            let shared = self
                .records
                .read()
                .values()
                .any(|l| l.diff_digest == layer.diff_digest);
            if !shared {
                self.content.remove(&layer.diff_digest)?;
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<Layer>> {
        let mut layers: Vec<Layer> = self.records.read().values().cloned().collect();
        layers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(layers)
    }

    fn shutdown(&self) -> Result<()> {
        let states: Vec<MountState> = self.mounts.lock().drain().map(|(_, s)| s).collect();
        for state in states {
            self.driver.unmount(&state.driver_mount)?;
        }
        Ok(())
    }
}

/// Sum of regular file sizes in a tar.
fn tar_content_size(reader: &mut dyn Read) -> Result<u64> {
    let mut archive = tar::Archive::new(reader);
    let mut total = 0;
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            total += entry.header().size()?;
        }
    }
    Ok(total)
}
