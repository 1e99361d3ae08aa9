//! OCI image layout directories and archives.
//!
//! ```text
//! <dir>/oci-layout          {"imageLayoutVersion":"1.0.0"}
//! <dir>/index.json          manifests, tagged with ref.name annotations
//! <dir>/blobs/sha256/<hex>
//! ```
//!
//! An archive is the same tree packed into a tar file.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use tempfile::TempDir;

use super::manifest::{Descriptor, ImageIndex, Manifest, ANNOTATION_REF_NAME};
use crate::digest::Digest;
use crate::store::content::ContentStore;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

pub struct OciLayout {
    dir: PathBuf,
}

impl OciLayout {
    /// Open an existing layout.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.join(OCI_LAYOUT_FILE).is_file() {
            return Err(BuildError::ImageNotFound(format!(
                "{} is not an OCI image layout",
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Open a layout, creating the skeleton if absent.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join("blobs").join("sha256"))?;
        let marker = dir.join(OCI_LAYOUT_FILE);
        if !marker.exists() {
            fs::write(&marker, OCI_LAYOUT_CONTENT)?;
        }
        if !dir.join("index.json").exists() {
            fs::write(dir.join("index.json"), serde_json::to_vec_pretty(&ImageIndex::default())?)?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join("blobs").join("sha256").join(digest.hex())
    }

    pub fn index(&self) -> Result<ImageIndex> {
        let data = fs::read(self.dir.join("index.json")).map_err(|e| {
            BuildError::ImageNotFound(format!("{}: cannot read index.json: {}", self.dir.display(), e))
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let tmp = self.dir.join("index.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        fs::rename(&tmp, self.dir.join("index.json"))?;
        Ok(())
    }

    /// Manifest descriptor for `tag`. Without a tag the layout must hold a
    /// single manifest.
    pub fn find(&self, tag: Option<&str>) -> Result<Descriptor> {
        let index = self.index()?;
        let found = match tag {
            Some(tag) => index
                .manifests
                .iter()
                .find(|d| d.ref_name() == Some(tag))
                .cloned(),
            None if index.manifests.len() == 1 => index.manifests.first().cloned(),
            None => None,
        };
        found.ok_or_else(|| {
            BuildError::ImageNotFound(format!(
                "{}{}",
                self.dir.display(),
                tag.map(|t| format!(":{}", t)).unwrap_or_else(|| " (no single manifest)".to_string())
            ))
        })
    }

    /// Copy the image behind `descriptor` into `content`; returns its
    /// manifest and the local manifest digest.
    pub fn import(&self, descriptor: &Descriptor, content: &ContentStore) -> Result<(Manifest, Digest)> {
        let manifest_digest = self.copy_in(&descriptor.digest, content)?;
        let manifest = Manifest::from_slice(&content.read(&manifest_digest)?)?;
        self.copy_in(&manifest.config.digest, content)?;
        for layer in &manifest.layers {
            self.copy_in(&layer.digest, content)?;
        }
        Ok((manifest, manifest_digest))
    }

    fn copy_in(&self, digest: &Digest, content: &ContentStore) -> Result<Digest> {
        if content.exists(digest) {
            return Ok(digest.clone());
        }
        let file = fs::File::open(self.blob_path(digest)).map_err(|e| {
            BuildError::storage(format!("{}: blob {} unreadable: {}", self.dir.display(), digest, e))
        })?;
        content.put_verified(file, digest)?;
        Ok(digest.clone())
    }

    /// Write the image whose manifest is `manifest_digest` (already in
    /// `content`) and point `tag` at it. An existing entry with the same
    /// tag is replaced.
    pub fn write_image(
        &self,
        content: &ContentStore,
        manifest_digest: &Digest,
        tag: Option<&str>,
    ) -> Result<Descriptor> {
        let manifest_bytes = content.read(manifest_digest)?;
        let manifest = Manifest::from_slice(&manifest_bytes)?;
        let mut blobs = vec![manifest.config.digest.clone()];
        blobs.extend(manifest.layers.iter().map(|l| l.digest.clone()));
        blobs.push(manifest_digest.clone());
        for digest in &blobs {
            let dest = self.blob_path(digest);
            if !dest.exists() {
                fs::copy(content.path(digest), &dest)?;
            }
        }

        let mut desc = Descriptor::new(
            manifest.format().manifest_media_type(),
            manifest_digest.clone(),
            manifest_bytes.len() as u64,
        );
        let mut index = self.index()?;
        if let Some(tag) = tag {
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
            desc.annotations = Some(annotations);
            index.manifests.retain(|d| d.ref_name() != Some(tag));
        } else {
            index
                .manifests
                .retain(|d| d.ref_name().is_some() || d.digest != *manifest_digest);
        }
        index.manifests.push(desc.clone());
        self.write_index(&index)?;
        Ok(desc)
    }

    /// Pack the layout into a tar file at `path`, entries sorted by name.
    pub fn pack(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp)?;
            let mut builder = tar::Builder::new(io::BufWriter::new(file));
            builder.mode(tar::HeaderMode::Deterministic);
            builder.append_path_with_name(self.dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT_FILE)?;
            builder.append_path_with_name(self.dir.join("index.json"), "index.json")?;
            let mut blobs: Vec<PathBuf> = fs::read_dir(self.dir.join("blobs").join("sha256"))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            blobs.sort();
            for blob in blobs {
                if let Some(name) = blob.file_name().and_then(|n| n.to_str()) {
                    builder.append_path_with_name(&blob, format!("blobs/sha256/{}", name))?;
                }
            }
            builder
                .into_inner()?
                .into_inner()
                .map_err(|e| BuildError::Io(e.into_error()))?
                .sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// An archive unpacked into a temporary layout; removed on drop.
pub struct UnpackedArchive {
    _dir: TempDir,
    pub layout: OciLayout,
}

impl UnpackedArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).map_err(|e| {
            BuildError::ImageNotFound(format!("{}: {}", path.display(), e))
        })?;
        let dir = TempDir::new()?;
        tar::Archive::new(io::BufReader::new(file))
            .unpack(dir.path())
            .map_err(|e| BuildError::storage(format!("{}: invalid archive: {}", path.display(), e)))?;
        let layout = OciLayout::open(dir.path())?;
        Ok(Self { _dir: dir, layout })
    }

    /// A fresh layout to be packed later.
    pub fn empty() -> Result<Self> {
        let dir = TempDir::new()?;
        let layout = OciLayout::create(dir.path())?;
        Ok(Self { _dir: dir, layout })
    }

    /// Unpack an existing archive, or start an empty one.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::open(path);
        }
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::manifest::{ManifestFormat, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER};

    fn image_in(content: &ContentStore) -> Digest {
        let config = content.put_bytes(b"{\"architecture\":\"amd64\",\"os\":\"linux\"}").unwrap();
        let layer = content.put_bytes(b"layer").unwrap();
        let manifest = Manifest::new(
            ManifestFormat::OciV1,
            Descriptor::new(MEDIA_TYPE_OCI_CONFIG, config, 36),
            vec![Descriptor::new(MEDIA_TYPE_OCI_LAYER, layer, 5)],
        );
        content.put_bytes(&manifest.to_vec().unwrap()).unwrap()
    }

    #[test]
    fn test_write_and_import() {
        let tmp = TempDir::new().unwrap();
        let src = ContentStore::init(&tmp.path().join("src")).unwrap();
        let manifest_digest = image_in(&src);

        let layout = OciLayout::create(&tmp.path().join("layout")).unwrap();
        layout.write_image(&src, &manifest_digest, Some("v1")).unwrap();
        layout.write_image(&src, &manifest_digest, Some("v1")).unwrap();
        assert_eq!(layout.index().unwrap().manifests.len(), 1);

        let dst = ContentStore::init(&tmp.path().join("dst")).unwrap();
        let desc = layout.find(Some("v1")).unwrap();
        let (manifest, digest) = layout.import(&desc, &dst).unwrap();
        assert_eq!(digest, manifest_digest);
        assert!(dst.exists(&manifest.config.digest));
        assert!(dst.exists(&manifest.layers[0].digest));
        assert!(layout.find(Some("v2")).is_err());
    }

    #[test]
    fn test_find_without_tag_needs_single_manifest() {
        let tmp = TempDir::new().unwrap();
        let content = ContentStore::init(&tmp.path().join("c")).unwrap();
        let digest = image_in(&content);
        let layout = OciLayout::create(&tmp.path().join("layout")).unwrap();
        assert!(layout.find(None).is_err());
        layout.write_image(&content, &digest, None).unwrap();
        assert_eq!(layout.find(None).unwrap().digest, digest);
    }

    #[test]
    fn test_archive_pack_and_open() {
        let tmp = TempDir::new().unwrap();
        let content = ContentStore::init(&tmp.path().join("c")).unwrap();
        let digest = image_in(&content);
        let archive_path = tmp.path().join("image.tar");

        let archive = UnpackedArchive::open_or_create(&archive_path).unwrap();
        archive.layout.write_image(&content, &digest, Some("latest")).unwrap();
        archive.layout.pack(&archive_path).unwrap();

        let reopened = UnpackedArchive::open(&archive_path).unwrap();
        assert_eq!(reopened.layout.find(Some("latest")).unwrap().digest, digest);
    }

    #[test]
    fn test_open_rejects_plain_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            OciLayout::open(tmp.path()),
            Err(BuildError::ImageNotFound(_))
        ));
    }
}
