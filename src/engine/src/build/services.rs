//! The stores and sandbox a build runs against, opened from one
//! [`EngineConfig`].

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use kiln_core::config::EngineConfig;
use kiln_core::error::Result;
use tracing::{debug, info, warn};

use crate::cache::LayerCache;
use crate::digest::Digest;
use crate::sandbox::{ExecRuntime, Sandbox};
use crate::store::image::ImageStore;
use crate::store::layer::{Layer, LayerId};
use crate::store::{ContentStore, LayerStore, LocalImageStore, LocalLayerStore};

/// What [`Services::prune`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub cache_entries: usize,
    pub layers: usize,
    pub blobs: usize,
}

pub struct Services {
    pub config: EngineConfig,
    pub content: Arc<ContentStore>,
    pub layers: Arc<dyn LayerStore>,
    pub images: Arc<LocalImageStore>,
    pub cache: LayerCache,
    pub sandbox: Sandbox,
}

impl Services {
    /// Open every store under `config.root` with the configured runtime.
    pub fn init(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let sandbox = Sandbox::from_config(&config)?;
        Self::open(config, sandbox)
    }

    /// Open the stores with a caller-supplied runtime.
    pub fn with_runtime(config: EngineConfig, runtime: Arc<dyn ExecRuntime>) -> Result<Self> {
        config.validate()?;
        let sandbox = Sandbox::init(&config.root, runtime)?;
        Self::open(config, sandbox)
    }

    fn open(config: EngineConfig, sandbox: Sandbox) -> Result<Self> {
        let root: &Path = &config.root;
        let content = Arc::new(ContentStore::init(root)?);
        let layers: Arc<dyn LayerStore> = Arc::new(LocalLayerStore::init(
            root,
            content.clone(),
            config.storage_driver,
        )?);
        let images = Arc::new(LocalImageStore::init(root, content.clone(), layers.clone())?);
        let cache = LayerCache::new(root)?;
        info!(
            root = %root.display(),
            driver = ?config.storage_driver,
            runtime = %sandbox.runtime().name(),
            "Opened engine state"
        );
        Ok(Self {
            config,
            content,
            layers,
            images,
            cache,
            sandbox,
        })
    }

    /// Release mounts and temporary blobs.
    pub fn shutdown(&self) -> Result<()> {
        self.layers.shutdown()?;
        self.content.shutdown()
    }

    /// Drop dangling cache entries (every entry with `all`), then the
    /// layers and blobs nothing references any more.
    pub fn prune(&self, all: bool) -> Result<PruneReport> {
        let mut report = PruneReport {
            cache_entries: self.cache.prune(|entry| {
                !all
                    && self.content.exists(&entry.state)
                    && entry.layer.as_ref().map_or(true, |l| self.layers.exists(l))
            })?,
            ..Default::default()
        };

        let images = self.images.list()?;
        let entries = self.cache.entries()?;

        let mut live: HashSet<LayerId> = HashSet::new();
        let tops = images
            .iter()
            .filter_map(|i| i.top_layer.clone())
            .chain(entries.iter().filter_map(|e| e.layer.clone()));
        for top in tops {
            if live.contains(&top) {
                continue;
            }
            for layer in self.layers.chain(&top)? {
                live.insert(layer.id);
            }
        }

        let mut dead: Vec<Layer> = self
            .layers
            .list()?
            .into_iter()
            .filter(|l| !live.contains(&l.id))
            .collect();
        // Children first: a layer with children cannot be removed.
        loop {
            let parents: HashSet<LayerId> = dead.iter().filter_map(|l| l.parent.clone()).collect();
            let (leaves, rest): (Vec<Layer>, Vec<Layer>) =
                dead.into_iter().partition(|l| !parents.contains(&l.id));
            if leaves.is_empty() {
                break;
            }
            for layer in &leaves {
                self.layers.remove(&layer.id)?;
                report.layers += 1;
            }
            dead = rest;
        }

        let mut keep: HashSet<Digest> = HashSet::new();
        for record in &images {
            keep.insert(record.manifest_digest.clone());
            match self.images.manifest(&record.id) {
                Ok(manifest) => {
                    keep.insert(manifest.config.digest.clone());
                    keep.extend(manifest.layers.iter().map(|d| d.digest.clone()));
                }
                Err(e) => warn!(image = %record.id.short(), error = %e, "Cannot read manifest"),
            }
        }
        for layer in self.layers.list()? {
            keep.insert(layer.diff_digest.clone());
        }
        for entry in self.cache.entries()? {
            keep.insert(entry.state);
        }
        for digest in self.content.list()? {
            if !keep.contains(&digest) && self.content.remove(&digest)? {
                debug!(blob = %digest.short(), "Removed blob");
                report.blobs += 1;
            }
        }

        info!(
            cache_entries = report.cache_entries,
            layers = report.layers,
            blobs = report.blobs,
            "Pruned build state"
        );
        Ok(report)
    }
}
