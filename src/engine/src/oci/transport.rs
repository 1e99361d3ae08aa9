//! Image transports: where images are fetched from and sent to.
//!
//! ```text
//! docker://registry/repo:tag    registry (also the meaning of a bare name)
//! oci:/path/to/layout[:tag]     OCI image layout directory
//! oci-archive:/path/file[:tag]  tarred OCI image layout
//! ```

use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};

use super::credentials::CredentialStore;
use super::layout::{OciLayout, UnpackedArchive};
use super::manifest::Manifest;
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryClient};
use crate::digest::Digest;
use crate::store::content::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Registry(ImageReference),
    OciDir { path: PathBuf, tag: Option<String> },
    OciArchive { path: PathBuf, tag: Option<String> },
}

/// Image brought into the content store by [`Transport::fetch`].
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub manifest: Manifest,
    pub manifest_digest: Digest,
    /// Names the image should be recorded under locally
    pub names: Vec<String>,
}

impl Transport {
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("docker://") {
            return Ok(Transport::Registry(ImageReference::parse(rest)?));
        }
        if let Some(rest) = s.strip_prefix("oci-archive:") {
            let (path, tag) = split_path_tag(rest)?;
            return Ok(Transport::OciArchive { path, tag });
        }
        if let Some(rest) = s.strip_prefix("oci:") {
            let (path, tag) = split_path_tag(rest)?;
            return Ok(Transport::OciDir { path, tag });
        }
        Ok(Transport::Registry(ImageReference::parse(s)?))
    }

    /// Name under which the local store records images of this transport.
    pub fn local_name(&self) -> String {
        match self {
            Transport::Registry(reference) => reference.full_reference(),
            Transport::OciDir { path, tag } => with_tag("oci", path, tag.as_deref()),
            Transport::OciArchive { path, tag } => with_tag("oci-archive", path, tag.as_deref()),
        }
    }

    pub async fn fetch(
        &self,
        content: &ContentStore,
        credentials: &CredentialStore,
    ) -> Result<FetchedImage> {
        match self {
            Transport::Registry(reference) => {
                let auth = RegistryAuth::resolve(credentials, &reference.registry);
                let pulled = RegistryClient::new(auth).pull(reference, content).await?;
                let manifest_digest = content.put_bytes(&pulled.manifest.to_vec()?)?;
                Ok(FetchedImage {
                    manifest: pulled.manifest,
                    manifest_digest,
                    names: vec![reference.full_reference()],
                })
            }
            Transport::OciDir { path, tag } => {
                let layout = OciLayout::open(path)?;
                self.fetch_layout(&layout, tag.as_deref(), content)
            }
            Transport::OciArchive { path, tag } => {
                let archive = UnpackedArchive::open(path)?;
                self.fetch_layout(&archive.layout, tag.as_deref(), content)
            }
        }
    }

    fn fetch_layout(
        &self,
        layout: &OciLayout,
        tag: Option<&str>,
        content: &ContentStore,
    ) -> Result<FetchedImage> {
        let desc = layout.find(tag)?;
        let (manifest, manifest_digest) = layout.import(&desc, content)?;
        Ok(FetchedImage {
            manifest,
            manifest_digest,
            names: vec![self.local_name()],
        })
    }

    /// Send the image behind `manifest_digest` (all blobs in `content`).
    /// Returns the reference it is reachable under.
    pub async fn send(
        &self,
        content: &ContentStore,
        manifest_digest: &Digest,
        credentials: &CredentialStore,
    ) -> Result<String> {
        match self {
            Transport::Registry(reference) => {
                let manifest = Manifest::from_slice(&content.read(manifest_digest)?)?;
                let auth = RegistryAuth::resolve(credentials, &reference.registry);
                RegistryClient::new(auth)
                    .push(reference, &manifest, content)
                    .await
            }
            Transport::OciDir { path, tag } => {
                let layout = OciLayout::create(path)?;
                let desc = layout.write_image(content, manifest_digest, tag.as_deref())?;
                Ok(format!("{}@{}", self.local_name(), desc.digest))
            }
            Transport::OciArchive { path, tag } => {
                let archive = UnpackedArchive::open_or_create(path)?;
                let desc = archive
                    .layout
                    .write_image(content, manifest_digest, tag.as_deref())?;
                archive.layout.pack(path)?;
                Ok(format!("{}@{}", self.local_name(), desc.digest))
            }
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Registry(reference) => write!(f, "docker://{}", reference),
            _ => write!(f, "{}", self.local_name()),
        }
    }
}

fn with_tag(scheme: &str, path: &Path, tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("{}:{}:{}", scheme, path.display(), tag),
        None => format!("{}:{}", scheme, path.display()),
    }
}

/// `path[:tag]`; the tag is whatever follows the last `:` when it holds no `/`.
fn split_path_tag(s: &str) -> Result<(PathBuf, Option<String>)> {
    if s.is_empty() {
        return Err(BuildError::Usage("missing path in transport reference".to_string()));
    }
    match s.rsplit_once(':') {
        Some((path, tag)) if !tag.contains('/') && !path.is_empty() => {
            if tag.is_empty() {
                return Err(BuildError::Usage(format!("empty tag in '{}'", s)));
            }
            Ok((PathBuf::from(path), Some(tag.to_string())))
        }
        _ => Ok((PathBuf::from(s), None)),
    }
}
