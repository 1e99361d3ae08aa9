//! Content-addressed blob store.
//!
//! ```text
//! <root>/blobs/sha256/<hex>   # blob bytes, named by digest
//! <root>/tmp/                 # in-flight writes
//! ```
//!
//! Writes land in `tmp/` and are renamed into place once their digest is
//! known, so a blob path either does not exist or holds complete content.
//! Identical content is stored once.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use tracing::debug;

use crate::digest::{Digest, DigestWriter};

/// Process-wide blob store. Safe to share across threads.
#[derive(Debug)]
pub struct ContentStore {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn init(root: &Path) -> Result<Self> {
        let blobs_dir = root.join("blobs").join("sha256");
        let tmp_dir = root.join("tmp");
        for dir in [&blobs_dir, &tmp_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                BuildError::storage(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(Self { blobs_dir, tmp_dir })
    }

    /// Remove leftovers of interrupted writes.
    pub fn shutdown(&self) -> Result<()> {
        if let Ok(entries) = fs::read_dir(&self.tmp_dir) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Path of the blob for `digest` (whether or not it exists).
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir.join(digest.hex())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    pub fn size(&self, digest: &Digest) -> Result<u64> {
        Ok(fs::metadata(self.path(digest))
            .map_err(|e| self.missing(digest, e))?
            .len())
    }

    pub fn put_bytes(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(data);
        if self.exists(&digest) {
            debug!(digest = %digest, "Blob already exists");
            return Ok(digest);
        }
        let mut writer = self.writer()?;
        writer.write_all(data).map_err(storage_io)?;
        let (stored, _) = writer.commit()?;
        Ok(stored)
    }

    /// Stream `reader` into the store; returns digest and size.
    pub fn put_reader(&self, mut reader: impl Read) -> Result<(Digest, u64)> {
        let mut writer = self.writer()?;
        io::copy(&mut reader, &mut writer).map_err(storage_io)?;
        writer.commit()
    }

    /// Stream `reader` and fail unless it hashes to `expected`.
    pub fn put_verified(&self, mut reader: impl Read, expected: &Digest) -> Result<u64> {
        if self.exists(expected) {
            return self.size(expected);
        }
        let mut writer = self.writer()?;
        io::copy(&mut reader, &mut writer).map_err(storage_io)?;
        let (_, size) = writer.commit_expecting(Some(expected))?;
        Ok(size)
    }

    /// A writer whose content becomes a blob on [`BlobWriter::commit`].
    /// Dropping it without committing discards the data.
    pub fn writer(&self) -> Result<BlobWriter<'_>> {
        let tmp = tempfile::NamedTempFile::new_in(&self.tmp_dir).map_err(storage_io)?;
        let file = tmp.reopen().map_err(storage_io)?;
        Ok(BlobWriter {
            store: self,
            tmp,
            inner: DigestWriter::new(BufWriter::new(file)),
        })
    }

    pub fn open(&self, digest: &Digest) -> Result<File> {
        File::open(self.path(digest)).map_err(|e| self.missing(digest, e))
    }

    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.path(digest)).map_err(|e| self.missing(digest, e))
    }

    /// Remove a blob. Returns whether it existed.
    pub fn remove(&self, digest: &Digest) -> Result<bool> {
        match fs::remove_file(self.path(digest)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_io(e)),
        }
    }

    /// All stored digests.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        for entry in fs::read_dir(&self.blobs_dir).map_err(storage_io)? {
            let entry = entry.map_err(storage_io)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(d) = Digest::parse(&format!("sha256:{}", name)) {
                    digests.push(d);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn missing(&self, digest: &Digest, e: io::Error) -> BuildError {
        BuildError::storage(format!("Blob {} unavailable: {}", digest, e))
    }
}

/// In-flight blob write. Hashes as it goes.
pub struct BlobWriter<'a> {
    store: &'a ContentStore,
    tmp: tempfile::NamedTempFile,
    inner: DigestWriter<BufWriter<File>>,
}

impl BlobWriter<'_> {
    pub fn commit(self) -> Result<(Digest, u64)> {
        self.commit_expecting(None)
    }

    fn commit_expecting(self, expected: Option<&Digest>) -> Result<(Digest, u64)> {
        let (buf, digest, size) = self.inner.finish();
        let file = buf
            .into_inner()
            .map_err(|e| storage_io(e.into_error()))?;
        file.sync_all().map_err(storage_io)?;

        if let Some(expected) = expected {
            if &digest != expected {
                return Err(BuildError::storage(format!(
                    "Digest mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }

        let dest = self.store.path(&digest);
        if !dest.exists() {
            self.tmp
                .persist(&dest)
                .map_err(|e| storage_io(e.error))?;
            debug!(digest = %digest, size, "Stored new blob");
        }
        Ok((digest, size))
    }
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn storage_io(e: io::Error) -> BuildError {
    BuildError::storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::init(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_put_and_read() {
        let (_tmp, store) = store();
        let digest = store.put_bytes(b"hello").unwrap();
        assert_eq!(digest, Digest::of_bytes(b"hello"));
        assert!(store.exists(&digest));
        assert_eq!(store.read(&digest).unwrap(), b"hello");
        assert_eq!(store.size(&digest).unwrap(), 5);
    }

    #[test]
    fn test_put_is_deduplicated() {
        let (_tmp, store) = store();
        let a = store.put_bytes(b"same").unwrap();
        let (b, size) = store.put_reader(&b"same"[..]).unwrap();
        assert_eq!(a, b);
        assert_eq!(size, 4);
        assert_eq!(store.list().unwrap(), vec![a]);
    }

    #[test]
    fn test_put_verified_mismatch() {
        let (_tmp, store) = store();
        let wrong = Digest::of_bytes(b"other");
        let err = store.put_verified(&b"data"[..], &wrong).unwrap_err();
        assert!(matches!(err, BuildError::StorageError { .. }));
        assert!(!store.exists(&wrong));
        assert!(!store.exists(&Digest::of_bytes(b"data")));
    }

    #[test]
    fn test_dropped_writer_leaves_nothing() {
        let (tmp, store) = store();
        {
            let mut writer = store.writer().unwrap();
            writer.write_all(b"partial").unwrap();
        }
        assert!(store.list().unwrap().is_empty());
        assert_eq!(fs::read_dir(tmp.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_blob_is_storage_error() {
        let (_tmp, store) = store();
        let err = store.read(&Digest::of_bytes(b"absent")).unwrap_err();
        assert!(matches!(err, BuildError::StorageError { .. }));
    }

    #[test]
    fn test_remove() {
        let (_tmp, store) = store();
        let digest = store.put_bytes(b"bye").unwrap();
        assert!(store.remove(&digest).unwrap());
        assert!(!store.remove(&digest).unwrap());
    }
}
