//! Registry client for pulling base images and pushing built ones.
//!
//! Uses the `oci-distribution` crate. Blobs go straight into the
//! [`ContentStore`] and are verified against their descriptor digest.

use kiln_core::error::{BuildError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::credentials::CredentialStore;
use super::manifest::Manifest;
use super::reference::ImageReference;
use crate::digest::Digest;
use crate::store::content::ContentStore;

/// Credentials for one registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, if both are set.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("REGISTRY_USERNAME").ok()?;
        let password = std::env::var("REGISTRY_PASSWORD").ok()?;
        Some(Self::basic(username, password))
    }

    /// Environment first, then the credential store, then anonymous.
    pub fn resolve(store: &CredentialStore, registry: &str) -> Self {
        if let Some(auth) = Self::from_env() {
            return auth;
        }
        match store.get(registry) {
            Ok(Some(login)) => Self::basic(login.username, login.password),
            Ok(None) => Self::anonymous(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                Self::anonymous()
            }
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Image fetched from a registry.
#[derive(Debug, Clone)]
pub struct PulledManifest {
    pub manifest: Manifest,
    /// Digest the registry reported for the manifest
    pub remote_digest: String,
}

pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Pull manifest, config and layers of `reference` into `content`.
    /// Blobs already present are not downloaded again.
    pub async fn pull(
        &self,
        reference: &ImageReference,
        content: &ContentStore,
    ) -> Result<PulledManifest> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        tracing::info!(reference = %reference, "Pulling image from registry");

        let (image_manifest, remote_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_error(reference, format!("Failed to pull manifest: {}", e)))?;

        self.pull_blob(&oci_ref, reference, &image_manifest.config, content)
            .await?;
        for layer in &image_manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            self.pull_blob(&oci_ref, reference, layer, content).await?;
        }

        let manifest = Manifest::from_slice(&serde_json::to_vec(&image_manifest)?)?;
        tracing::info!(reference = %reference, digest = %remote_digest, "Image pulled");
        Ok(PulledManifest {
            manifest,
            remote_digest,
        })
    }

    async fn pull_blob(
        &self,
        oci_ref: &Reference,
        reference: &ImageReference,
        descriptor: &OciDescriptor,
        content: &ContentStore,
    ) -> Result<()> {
        let digest = Digest::parse(&descriptor.digest)?;
        if content.exists(&digest) {
            return Ok(());
        }
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(oci_ref, descriptor, &mut data)
            .await
            .map_err(|e| {
                registry_error(
                    reference,
                    format!("Failed to pull blob {}: {}", descriptor.digest, e),
                )
            })?;
        content.put_verified(&data[..], &digest)?;
        Ok(())
    }

    /// Push an image whose blobs are all in `content`. Returns the manifest URL.
    pub async fn push(
        &self,
        reference: &ImageReference,
        manifest: &Manifest,
        content: &ContentStore,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        tracing::info!(reference = %reference, "Pushing image to registry");

        let config = Config::new(
            content.read(&manifest.config.digest)?,
            manifest.config.media_type.clone(),
            None,
        );
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for desc in &manifest.layers {
            let data = content.read(&desc.digest)?;
            tracing::debug!(digest = %desc.digest, size = data.len(), "Read layer for push");
            layers.push(ImageLayer::new(data, desc.media_type.clone(), None));
        }
        let oci_manifest: OciImageManifest = serde_json::from_slice(&manifest.to_vec()?)?;

        let auth = self.auth.to_oci_auth();
        let response: PushResponse = self
            .client
            .push(&oci_ref, &layers, config, &auth, Some(oci_manifest))
            .await
            .map_err(|e| registry_error(reference, format!("Failed to push image: {}", e)))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );
        Ok(response.manifest_url)
    }
}

fn registry_error(reference: &ImageReference, message: String) -> BuildError {
    BuildError::Registry {
        registry: reference.registry.clone(),
        message,
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        BuildError::Usage(format!("Invalid image reference '{}': {}", ref_str, e))
    })
}

/// Picks the linux manifest for the host architecture out of an index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = super::config::host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
