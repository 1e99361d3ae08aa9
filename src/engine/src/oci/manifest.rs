//! Manifest, descriptor and index documents for OCI v1 and Docker v2s2.

use std::collections::BTreeMap;

use kiln_core::config::{CompressionKind, ManifestFormatKind};
use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Annotation carrying the tag of a manifest inside an OCI layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Manifest schema written by `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestFormat {
    #[default]
    OciV1,
    DockerV2S2,
}

/// Compression applied to layer blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl From<ManifestFormatKind> for ManifestFormat {
    fn from(kind: ManifestFormatKind) -> Self {
        match kind {
            ManifestFormatKind::Oci => ManifestFormat::OciV1,
            ManifestFormatKind::Docker => ManifestFormat::DockerV2S2,
        }
    }
}

impl From<CompressionKind> for Compression {
    fn from(kind: CompressionKind) -> Self {
        match kind {
            CompressionKind::None => Compression::None,
            CompressionKind::Gzip => Compression::Gzip,
            CompressionKind::Zstd => Compression::Zstd,
        }
    }
}

impl ManifestFormat {
    pub fn manifest_media_type(self) -> &'static str {
        match self {
            ManifestFormat::OciV1 => MEDIA_TYPE_OCI_MANIFEST,
            ManifestFormat::DockerV2S2 => MEDIA_TYPE_DOCKER_MANIFEST,
        }
    }

    pub fn config_media_type(self) -> &'static str {
        match self {
            ManifestFormat::OciV1 => MEDIA_TYPE_OCI_CONFIG,
            ManifestFormat::DockerV2S2 => MEDIA_TYPE_DOCKER_CONFIG,
        }
    }

    /// Layer media type for `compression`; Docker v2s2 has no zstd type.
    pub fn layer_media_type(self, compression: Compression) -> Result<&'static str> {
        match (self, compression) {
            (ManifestFormat::OciV1, Compression::None) => Ok(MEDIA_TYPE_OCI_LAYER),
            (ManifestFormat::OciV1, Compression::Gzip) => Ok(MEDIA_TYPE_OCI_LAYER_GZIP),
            (ManifestFormat::OciV1, Compression::Zstd) => Ok(MEDIA_TYPE_OCI_LAYER_ZSTD),
            (ManifestFormat::DockerV2S2, Compression::None) => Ok(MEDIA_TYPE_DOCKER_LAYER),
            (ManifestFormat::DockerV2S2, Compression::Gzip) => Ok(MEDIA_TYPE_DOCKER_LAYER_GZIP),
            (ManifestFormat::DockerV2S2, Compression::Zstd) => Err(BuildError::Config(
                "zstd layers require the OCI manifest format".to_string(),
            )),
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            MEDIA_TYPE_OCI_MANIFEST => Some(ManifestFormat::OciV1),
            MEDIA_TYPE_DOCKER_MANIFEST => Some(ManifestFormat::DockerV2S2),
            _ => None,
        }
    }
}

impl Compression {
    /// Compression implied by a layer media type.
    pub fn from_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            MEDIA_TYPE_OCI_LAYER | MEDIA_TYPE_DOCKER_LAYER => Ok(Compression::None),
            MEDIA_TYPE_OCI_LAYER_GZIP | MEDIA_TYPE_DOCKER_LAYER_GZIP => Ok(Compression::Gzip),
            MEDIA_TYPE_OCI_LAYER_ZSTD => Ok(Compression::Zstd),
            other => Err(BuildError::Serialization(format!(
                "unsupported layer media type '{}'",
                other
            ))),
        }
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()?
            .get(ANNOTATION_REF_NAME)
            .map(String::as_str)
    }
}

/// Image manifest (OCI v1 and Docker v2s2 share this shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    pub fn new(format: ManifestFormat, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(format.manifest_media_type().to_string()),
            config,
            layers,
            annotations: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| BuildError::Serialization(format!("invalid manifest: {}", e)))
    }

    /// Canonical bytes: compact JSON in declaration order.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn format(&self) -> ManifestFormat {
        self.media_type
            .as_deref()
            .and_then(ManifestFormat::from_media_type)
            .unwrap_or(ManifestFormat::OciV1)
    }
}

/// OCI image index (used as `index.json` of an image layout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: Vec::new(),
        }
    }
}
