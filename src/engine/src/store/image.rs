//! Local image store.
//!
//! ```text
//! <root>/images/index.json     image records (id, manifest, names, top layer)
//! <root>/images/blobinfo.json  compressed blob per (diff digest, compression)
//! ```
//!
//! An image id is the digest of its config blob. Manifests, configs and
//! layer blobs live in the [`ContentStore`]; layers are registered in the
//! [`LayerStore`] so pulled bases mount like locally built ones. The blob
//! info cache makes a second commit of the same layers reuse the same
//! compressed blobs, which keeps manifest digests stable across builds.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::content::ContentStore;
use super::layer::{Layer, LayerId, LayerStore};
use crate::digest::Digest;
use crate::oci::config::ImageConfigFile;
use crate::oci::credentials::CredentialStore;
use crate::oci::layout::{OciLayout, UnpackedArchive};
use crate::oci::manifest::{Compression, Descriptor, Manifest, ManifestFormat};
use crate::oci::reference::ImageReference;
use crate::oci::transport::Transport;

/// Local image identity: the config digest.
pub type ImageId = Digest;

/// When `pull` contacts the image source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Only when the image is not in the local store
    #[default]
    IfMissing,
    Always,
    /// Never; a missing image is an error
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "missing" | "if-missing" | "ifmissing" => Ok(PullPolicy::IfMissing),
            "always" | "true" => Ok(PullPolicy::Always),
            "never" | "false" => Ok(PullPolicy::Never),
            other => Err(BuildError::Usage(format!(
                "unknown pull policy '{}' (expected always, missing or never)",
                other
            ))),
        }
    }
}

/// Persisted image record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub manifest_digest: Digest,
    #[serde(default)]
    pub names: Vec<String>,
    pub top_layer: Option<LayerId>,
    pub created: DateTime<Utc>,
    /// Sum of the uncompressed layer diffs
    pub size: u64,
}

/// Result of [`ImageStore::commit`].
#[derive(Debug, Clone)]
pub struct CommittedImage {
    pub id: ImageId,
    pub manifest_digest: Digest,
    pub manifest: Manifest,
    pub config: ImageConfigFile,
}

/// What [`ImageStore::remove`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removed {
    Untagged(String),
    Deleted(ImageId),
}

/// Image storage and transport boundary consumed by the engine.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Make `reference` available locally according to `policy`.
    async fn pull(&self, reference: &str, policy: PullPolicy) -> Result<ImageId>;

    /// Local image for a name, full id or unique id prefix.
    fn resolve(&self, reference: &str) -> Result<Option<ImageId>>;

    /// Write config and manifest for the layer chain ending at `top`.
    fn commit(
        &self,
        top: Option<&LayerId>,
        config: &ImageConfigFile,
        format: ManifestFormat,
        compression: Compression,
    ) -> Result<CommittedImage>;

    /// Point `names` at `id`, moving them off any other image.
    fn tag(&self, id: &ImageId, names: &[String]) -> Result<()>;

    /// Send an image to a transport destination. Returns the reference
    /// the destination reports.
    async fn export(&self, id: &ImageId, destination: &str) -> Result<String>;

    fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>>;

    fn config(&self, id: &ImageId) -> Result<ImageConfigFile>;

    fn manifest(&self, id: &ImageId) -> Result<Manifest>;

    fn list(&self) -> Result<Vec<ImageRecord>>;

    /// Untag `reference`, deleting the image once it has no names left or
    /// when addressed by id.
    fn remove(&self, reference: &str) -> Result<Removed>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    images: Vec<ImageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobInfo {
    digest: Digest,
    size: u64,
}

pub struct LocalImageStore {
    index_path: PathBuf,
    blobinfo_path: PathBuf,
    content: Arc<ContentStore>,
    layers: Arc<dyn LayerStore>,
    credentials: CredentialStore,
    index: Mutex<IndexFile>,
    blobinfo: Mutex<BTreeMap<String, BlobInfo>>,
}

impl LocalImageStore {
    pub fn init(
        root: &Path,
        content: Arc<ContentStore>,
        layers: Arc<dyn LayerStore>,
    ) -> Result<Self> {
        let dir = root.join("images");
        fs::create_dir_all(&dir).map_err(|e| {
            BuildError::storage(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        let index_path = dir.join("index.json");
        let blobinfo_path = dir.join("blobinfo.json");
        let index: IndexFile = read_json(&index_path)?.unwrap_or_default();
        let blobinfo = read_json(&blobinfo_path)?.unwrap_or_default();
        debug!(images = index.images.len(), "Loaded image index");
        Ok(Self {
            index_path,
            blobinfo_path,
            content,
            layers,
            credentials: CredentialStore::under_root(root),
            index: Mutex::new(index),
            blobinfo: Mutex::new(blobinfo),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    fn save_index(&self, index: &IndexFile) -> Result<()> {
        write_json(&self.index_path, index)
    }

    fn record(&self, id: &ImageId) -> Result<ImageRecord> {
        self.get(id)?
            .ok_or_else(|| BuildError::ImageNotFound(id.to_string()))
    }

    /// Insert or update a record, moving its names off other images.
    fn upsert(&self, mut record: ImageRecord) -> Result<()> {
        let mut index = self.index.lock();
        for other in index.images.iter_mut() {
            if other.id != record.id {
                other.names.retain(|n| !record.names.contains(n));
            }
        }
        if let Some(existing) = index.images.iter_mut().find(|r| r.id == record.id) {
            for name in existing.names.drain(..) {
                if !record.names.contains(&name) {
                    record.names.push(name);
                }
            }
            record.created = existing.created.min(record.created);
            *existing = record;
        } else {
            index.images.push(record);
        }
        self.save_index(&index)
    }

    /// Register the layers of an image already in the content store and
    /// record it under `names`.
    fn import(&self, manifest: &Manifest, manifest_digest: &Digest, names: Vec<String>) -> Result<ImageId> {
        let config_digest = manifest.config.digest.clone();
        let config = ImageConfigFile::from_slice(&self.content.read(&config_digest)?)?;
        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(BuildError::storage(format!(
                "image {} lists {} layers but {} diff ids",
                config_digest,
                manifest.layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }

        let mut parent: Option<LayerId> = None;
        let mut size = 0;
        for (desc, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids) {
            let compression = Compression::from_media_type(&desc.media_type)?;
            let id = LayerId::chain(parent.as_ref(), diff_id);
            let layer = match self.layers.get(&id)? {
                Some(layer) => layer,
                None => {
                    let blob = self.content.open(&desc.digest)?;
                    let mut reader = decompress(blob, compression)?;
                    let layer = self.layers.register(parent.as_ref(), &mut reader)?;
                    if &layer.diff_digest != diff_id {
                        let _ = self.layers.remove(&layer.id);
                        return Err(BuildError::storage_layer(
                            format!("diff digest {} does not match config diff id {}", layer.diff_digest, diff_id),
                            desc.digest.to_string(),
                        ));
                    }
                    layer
                }
            };
            self.blobinfo.lock().insert(
                blobinfo_key(diff_id, compression),
                BlobInfo {
                    digest: desc.digest.clone(),
                    size: desc.size,
                },
            );
            size += layer.diff_size;
            parent = Some(layer.id);
        }
        write_json(&self.blobinfo_path, &*self.blobinfo.lock())?;

        self.upsert(ImageRecord {
            id: config_digest.clone(),
            manifest_digest: manifest_digest.clone(),
            names,
            top_layer: parent,
            created: config.created.unwrap_or_else(Utc::now),
            size,
        })?;
        info!(image = %config_digest.short(), layers = manifest.layers.len(), "Imported image");
        Ok(config_digest)
    }

    /// Compressed blob for a layer, reusing an earlier one when possible.
    fn layer_blob(&self, layer: &Layer, compression: Compression) -> Result<BlobInfo> {
        let key = blobinfo_key(&layer.diff_digest, compression);
        if let Some(info) = self.blobinfo.lock().get(&key) {
            if self.content.exists(&info.digest) {
                return Ok(info.clone());
            }
        }
        let diff = self.layers.open_diff(&layer.id)?;
        let info = match compression {
            Compression::None => BlobInfo {
                digest: layer.diff_digest.clone(),
                size: layer.diff_size,
            },
            Compression::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(
                    self.content.writer()?,
                    flate2::Compression::default(),
                );
                io::copy(&mut io::BufReader::new(diff), &mut encoder)?;
                let (digest, size) = encoder.finish()?.commit()?;
                BlobInfo { digest, size }
            }
            Compression::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(self.content.writer()?, 3)?;
                io::copy(&mut io::BufReader::new(diff), &mut encoder)?;
                let (digest, size) = encoder.finish()?.commit()?;
                BlobInfo { digest, size }
            }
        };
        debug!(layer = %layer.id.short(), blob = %info.digest.short(), ?compression, "Stored layer blob");
        let mut blobinfo = self.blobinfo.lock();
        blobinfo.insert(key, info.clone());
        write_json(&self.blobinfo_path, &*blobinfo)?;
        Ok(info)
    }

    /// Normalized store name for a user-supplied reference.
    fn normalize_name(name: &str) -> String {
        Transport::parse(name)
            .map(|t| t.local_name())
            .unwrap_or_else(|_| name.to_string())
    }

    /// Write images into an OCI archive, tagged with their full names.
    pub fn save(&self, images: &[(ImageId, Option<String>)], path: &Path) -> Result<()> {
        let archive = UnpackedArchive::empty()?;
        for (id, name) in images {
            let record = self.record(id)?;
            archive
                .layout
                .write_image(&self.content, &record.manifest_digest, name.as_deref())?;
        }
        archive.layout.pack(path)?;
        info!(path = %path.display(), images = images.len(), "Saved images");
        Ok(())
    }

    /// Import every image of an OCI archive or layout directory.
    pub fn load(&self, path: &Path) -> Result<Vec<(ImageId, Vec<String>)>> {
        let archive;
        let (layout, scheme) = if path.is_dir() {
            (OciLayout::open(path)?, "oci")
        } else {
            archive = UnpackedArchive::open(path)?;
            (OciLayout::open(archive.layout.dir())?, "oci-archive")
        };
        let mut loaded = Vec::new();
        for desc in layout.index()?.manifests {
            let (manifest, manifest_digest) = layout.import(&desc, &self.content)?;
            let names = match desc.ref_name() {
                Some(name) if name.contains('/') => match ImageReference::parse(name) {
                    Ok(reference) => vec![reference.full_reference()],
                    Err(_) => vec![format!("{}:{}:{}", scheme, path.display(), name)],
                },
                Some(tag) => vec![format!("{}:{}:{}", scheme, path.display(), tag)],
                None => Vec::new(),
            };
            let id = self.import(&manifest, &manifest_digest, names.clone())?;
            loaded.push((id, names));
        }
        Ok(loaded)
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn pull(&self, reference: &str, policy: PullPolicy) -> Result<ImageId> {
        let local = self.resolve(reference)?;
        match (policy, local) {
            (PullPolicy::IfMissing | PullPolicy::Never, Some(id)) => return Ok(id),
            (PullPolicy::Never, None) => {
                return Err(BuildError::ImageNotFound(Self::normalize_name(reference)))
            }
            _ => {}
        }
        let transport = Transport::parse(reference)?;
        let fetched = transport.fetch(&self.content, &self.credentials).await?;
        self.import(&fetched.manifest, &fetched.manifest_digest, fetched.names)
    }

    fn resolve(&self, reference: &str) -> Result<Option<ImageId>> {
        let index = self.index.lock();
        if let Ok(digest) = Digest::parse(reference) {
            if let Some(r) = index.images.iter().find(|r| r.id == digest) {
                return Ok(Some(r.id.clone()));
            }
        }
        let name = Self::normalize_name(reference);
        if let Some(r) = index
            .images
            .iter()
            .find(|r| r.names.iter().any(|n| n == &name || n == reference))
        {
            return Ok(Some(r.id.clone()));
        }
        let prefix = reference.strip_prefix("sha256:").unwrap_or(reference);
        if prefix.len() >= 4 && prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            let matches: Vec<&ImageRecord> = index
                .images
                .iter()
                .filter(|r| r.id.hex().starts_with(prefix))
                .collect();
            match matches.as_slice() {
                [only] => return Ok(Some(only.id.clone())),
                [] => {}
                _ => {
                    return Err(BuildError::Usage(format!(
                        "image id prefix '{}' is ambiguous",
                        prefix
                    )))
                }
            }
        }
        Ok(None)
    }

    fn commit(
        &self,
        top: Option<&LayerId>,
        config: &ImageConfigFile,
        format: ManifestFormat,
        compression: Compression,
    ) -> Result<CommittedImage> {
        let layer_media_type = format.layer_media_type(compression)?;
        let chain = match top {
            Some(top) => self.layers.chain(top)?,
            None => Vec::new(),
        };

        let mut config = config.clone();
        config.rootfs.diff_ids = chain.iter().map(|l| l.diff_digest.clone()).collect();

        let mut layer_descs = Vec::with_capacity(chain.len());
        for layer in &chain {
            let blob = self.layer_blob(layer, compression)?;
            layer_descs.push(Descriptor::new(layer_media_type, blob.digest, blob.size));
        }

        let config_bytes = config.to_vec()?;
        let config_digest = self.content.put_bytes(&config_bytes)?;
        let manifest = Manifest::new(
            format,
            Descriptor::new(
                format.config_media_type(),
                config_digest.clone(),
                config_bytes.len() as u64,
            ),
            layer_descs,
        );
        let manifest_digest = self.content.put_bytes(&manifest.to_vec()?)?;

        self.upsert(ImageRecord {
            id: config_digest.clone(),
            manifest_digest: manifest_digest.clone(),
            names: Vec::new(),
            top_layer: top.cloned(),
            created: config.created.unwrap_or_else(Utc::now),
            size: chain.iter().map(|l| l.diff_size).sum(),
        })?;
        info!(image = %config_digest.short(), manifest = %manifest_digest.short(), layers = chain.len(), "Committed image");

        Ok(CommittedImage {
            id: config_digest,
            manifest_digest,
            manifest,
            config,
        })
    }

    fn tag(&self, id: &ImageId, names: &[String]) -> Result<()> {
        let mut record = self.record(id)?;
        record.names = names.iter().map(|n| Self::normalize_name(n)).collect();
        self.upsert(record)
    }

    async fn export(&self, id: &ImageId, destination: &str) -> Result<String> {
        let record = self.record(id)?;
        let transport = Transport::parse(destination)?;
        let reference = transport
            .send(&self.content, &record.manifest_digest, &self.credentials)
            .await?;
        info!(image = %id.short(), destination = %transport, "Exported image");
        Ok(reference)
    }

    fn get(&self, id: &ImageId) -> Result<Option<ImageRecord>> {
        Ok(self.index.lock().images.iter().find(|r| &r.id == id).cloned())
    }

    fn config(&self, id: &ImageId) -> Result<ImageConfigFile> {
        Ok(ImageConfigFile::from_slice(&self.content.read(id)?)?)
    }

    fn manifest(&self, id: &ImageId) -> Result<Manifest> {
        let record = self.record(id)?;
        Manifest::from_slice(&self.content.read(&record.manifest_digest)?)
    }

    fn list(&self) -> Result<Vec<ImageRecord>> {
        let mut images = self.index.lock().images.clone();
        images.sort_by(|a, b| b.created.cmp(&a.created).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    fn remove(&self, reference: &str) -> Result<Removed> {
        let id = self
            .resolve(reference)?
            .ok_or_else(|| BuildError::ImageNotFound(reference.to_string()))?;
        let name = Self::normalize_name(reference);
        let mut index = self.index.lock();
        let pos = index
            .images
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| BuildError::ImageNotFound(reference.to_string()))?;
        let record = &mut index.images[pos];
        let by_name = record.names.iter().any(|n| n == &name);
        let removed = if by_name && record.names.len() > 1 {
            record.names.retain(|n| n != &name);
            Removed::Untagged(name)
        } else {
            index.images.remove(pos);
            Removed::Deleted(id)
        };
        self.save_index(&index)?;
        Ok(removed)
    }
}

fn blobinfo_key(diff: &Digest, compression: Compression) -> String {
    let suffix = match compression {
        Compression::None => "none",
        Compression::Gzip => "gzip",
        Compression::Zstd => "zstd",
    };
    format!("{}+{}", diff, suffix)
}

/// Reader over the uncompressed content of a layer blob.
pub fn decompress<'a>(reader: impl Read + 'a, compression: Compression) -> Result<Box<dyn Read + 'a>> {
    let reader = io::BufReader::new(reader);
    Ok(match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
            BuildError::storage(format!("{} is corrupt: {}", path.display(), e))
        })?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
