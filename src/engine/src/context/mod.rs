//! Read-only, filtered view over the build context.
//!
//! The context is a directory supplied by the user, or a tar stream that is
//! extracted into a private temporary directory first. Paths are resolved
//! inside the context root so symlinks never reach outside it, and the
//! user's tree is never written to.

pub mod ignore;

use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use tar::{EntryType, Header};
use tempfile::TempDir;
use tracing::debug;

use crate::digest::{Digest, DigestWriter};
use crate::fsutil;
pub use ignore::{IgnoreRules, IGNORE_FILES};

/// Metadata of a context entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub kind: FileKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub link_target: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl FileMeta {
    fn from_metadata(meta: &fs::Metadata, path: &Path) -> io::Result<Self> {
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };
        Ok(Self {
            kind,
            mode: meta.mode() & 0o7777,
            size: if kind == FileKind::File { meta.len() } else { 0 },
            mtime: meta.mtime(),
            link_target: if kind == FileKind::Symlink {
                Some(fs::read_link(path)?)
            } else {
                None
            },
        })
    }
}

/// Outcome of [`ContextView::open`].
#[derive(Debug)]
pub enum OpenResult {
    Found(File),
    NotFound,
    Excluded,
}

pub struct ContextView {
    root: PathBuf,
    rules: IgnoreRules,
    ignore_file: Option<String>,
    _extracted: Option<TempDir>,
}

impl std::fmt::Debug for ContextView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextView")
            .field("root", &self.root)
            .field("ignore_file", &self.ignore_file)
            .finish()
    }
}

impl ContextView {
    /// View over a directory.
    pub fn open_dir(path: &Path) -> Result<Self> {
        let root = fs::canonicalize(path).map_err(|e| {
            BuildError::ContextError(format!("cannot access {}: {}", path.display(), e))
        })?;
        if !root.is_dir() {
            return Err(BuildError::ContextError(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        Self::with_root(root, None)
    }

    /// View over a tar stream, extracted into a temporary directory.
    pub fn from_tar(reader: impl Read) -> Result<Self> {
        let dir = TempDir::new()?;
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive
            .unpack(dir.path())
            .map_err(|e| BuildError::ContextError(format!("invalid context archive: {}", e)))?;
        let root = dir.path().to_path_buf();
        Self::with_root(root, Some(dir))
    }

    fn with_root(root: PathBuf, extracted: Option<TempDir>) -> Result<Self> {
        let mut rules = IgnoreRules::default();
        let mut ignore_file = None;
        for name in IGNORE_FILES {
            let path = root.join(name);
            if path.is_file() {
                let content = fs::read_to_string(&path).map_err(|e| {
                    BuildError::ContextError(format!("cannot read {}: {}", path.display(), e))
                })?;
                rules = IgnoreRules::parse(&content)?;
                ignore_file = Some(name.to_string());
                debug!(file = name, "Loaded context ignore rules");
                break;
            }
        }
        Ok(Self {
            root,
            rules,
            ignore_file,
            _extracted: extracted,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ignore_file(&self) -> Option<&str> {
        self.ignore_file.as_deref()
    }

    /// Whether `rel` is hidden from copies.
    pub fn is_excluded(&self, rel: &str) -> bool {
        let rel = rel.trim_matches('/');
        Some(rel) == self.ignore_file.as_deref() || self.rules.is_excluded(rel)
    }

    /// Host path of `rel`, resolved inside the context.
    pub fn host_path(&self, rel: &str) -> Result<PathBuf> {
        fsutil::resolve_in_root(&self.root, rel)
    }

    pub fn metadata(&self, rel: &str) -> Result<Option<FileMeta>> {
        let path = self.host_path(rel)?;
        match fs::symlink_metadata(&path) {
            Ok(meta) => Ok(Some(FileMeta::from_metadata(&meta, &path)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn open(&self, rel: &str) -> Result<OpenResult> {
        let clean = normalize(rel);
        if self.is_excluded(&clean) {
            return Ok(OpenResult::Excluded);
        }
        let path = self.host_path(&clean)?;
        match File::open(&path) {
            Ok(f) => Ok(OpenResult::Found(f)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(OpenResult::NotFound),
            Err(e) => Err(BuildError::ContextError(format!(
                "cannot open {}: {}",
                clean, e
            ))),
        }
    }

    /// Lazy traversal of `rel` and its subtree in component-wise
    /// lexicographic order. Excluded entries are skipped.
    pub fn walk(&self, rel: &str) -> Result<Walk<'_>> {
        self.walk_inner(rel, false)
    }

    fn walk_inner(&self, rel: &str, show_ignore_file: bool) -> Result<Walk<'_>> {
        let start = normalize(rel);
        let mut stack = Vec::new();
        if let Some(meta) = self.metadata(&start)? {
            stack.push((start, meta));
        }
        Ok(Walk {
            view: self,
            stack,
            show_ignore_file,
        })
    }

    /// Digest of the normalized tar of `rel` and its subtree. Timestamps
    /// and ownership are left out so that only names, modes and content
    /// count. The ignore file is part of the digest.
    pub fn digest(&self, rel: &str) -> Result<Digest> {
        let mut out = DigestWriter::new(io::sink());
        {
            let mut builder = tar::Builder::new(&mut out);
            builder.mode(tar::HeaderMode::Deterministic);
            for item in self.walk_inner(rel, true)? {
                let (path, meta) = item?;
                let name = if path.is_empty() { ".".to_string() } else { path.clone() };
                let mut header = Header::new_gnu();
                header.set_mode(meta.mode);
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
                match meta.kind {
                    FileKind::Dir => {
                        header.set_entry_type(EntryType::Directory);
                        header.set_size(0);
                        builder.append_data(&mut header, &name, io::empty())?;
                    }
                    FileKind::Symlink => {
                        header.set_entry_type(EntryType::Symlink);
                        header.set_size(0);
                        let target = meta.link_target.clone().unwrap_or_default();
                        builder.append_link(&mut header, &name, &target)?;
                    }
                    FileKind::File => {
                        header.set_entry_type(EntryType::Regular);
                        header.set_size(meta.size);
                        let file = File::open(self.root.join(&path))?;
                        builder.append_data(&mut header, &name, file)?;
                    }
                    FileKind::Other => {}
                }
            }
            builder.finish()?;
        }
        let (_, digest, _) = out.finish();
        Ok(digest)
    }

    /// Context paths matching a wildcard source, sorted.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let clean = normalize(pattern);
        let matcher = glob::Pattern::new(&clean)
            .map_err(|e| BuildError::ContextError(format!("invalid pattern '{}': {}", pattern, e)))?;
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let depth = clean.split('/').count();
        let mut matches = Vec::new();
        for item in self.walk("")? {
            let (path, _) = item?;
            if path.is_empty() || path.split('/').count() != depth {
                continue;
            }
            if matcher.matches_with(&path, options) {
                matches.push(path);
            }
        }
        Ok(matches)
    }
}

/// Whether a source operand contains wildcard characters.
pub fn has_wildcards(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Relative `/`-separated form, `""` for the root.
fn normalize(rel: &str) -> String {
    fsutil::clean_path(rel).trim_start_matches('/').to_string()
}

/// Iterator returned by [`ContextView::walk`]. Yields `(relative path,
/// metadata)`; the root of the walk comes first.
pub struct Walk<'a> {
    view: &'a ContextView,
    stack: Vec<(String, FileMeta)>,
    show_ignore_file: bool,
}

impl Walk<'_> {
    fn hidden(&self, rel: &str) -> bool {
        if self.show_ignore_file && Some(rel) == self.view.ignore_file.as_deref() {
            return false;
        }
        self.view.is_excluded(rel)
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<(String, FileMeta)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (rel, meta) = self.stack.pop()?;
            if meta.kind == FileKind::Dir {
                let dir = self.view.root.join(&rel);
                let mut children: Vec<(String, FileMeta)> = Vec::new();
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) => return Some(Err(e.into())),
                };
                for entry in entries {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => return Some(Err(e.into())),
                    };
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let child = if rel.is_empty() {
                        name
                    } else {
                        format!("{}/{}", rel, name)
                    };
                    // Excluded directories are still entered when a negation
                    // could re-include something beneath them.
                    let hidden = self.hidden(&child);
                    let path = entry.path();
                    let child_meta = match fs::symlink_metadata(&path)
                        .and_then(|m| FileMeta::from_metadata(&m, &path))
                    {
                        Ok(m) => m,
                        Err(e) => return Some(Err(e.into())),
                    };
                    let descend = child_meta.kind == FileKind::Dir && self.view.rules.has_negations();
                    if hidden && !descend {
                        continue;
                    }
                    children.push((child, child_meta));
                }
                // Popped from the end: push in reverse byte order.
                children.sort_by(|a, b| b.0.as_bytes().cmp(a.0.as_bytes()));
                self.stack.extend(children);
            }
            if !rel.is_empty() && self.hidden(&rel) {
                continue;
            }
            return Some(Ok((rel, meta)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn walked(view: &ContextView, rel: &str) -> Vec<String> {
        view.walk(rel).unwrap().map(|r| r.unwrap().0).collect()
    }

    #[test]
    fn test_walk_is_lexicographic_per_component() {
        let dir = context(&[("b", ""), ("a/z", ""), ("a.txt", ""), ("a/b", "")]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert_eq!(walked(&view, ""), vec!["", "a", "a/b", "a/z", "a.txt", "b"]);
    }

    #[test]
    fn test_walk_honours_ignore_file() {
        let dir = context(&[
            (".dockerignore", "*.log\nbuild\n!build/keep\n"),
            ("app.log", ""),
            ("main.rs", ""),
            ("build/out", ""),
            ("build/keep", ""),
        ]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert_eq!(view.ignore_file(), Some(".dockerignore"));
        assert_eq!(walked(&view, ""), vec!["", "build/keep", "main.rs"]);
    }

    #[test]
    fn test_walk_large_ignored_tree() {
        let dir = context(&[
            (".dockerignore", "node_modules\n!README.md\n"),
            ("README.md", "readme"),
            ("index.js", ""),
        ]);
        for i in 0..8000 {
            fs::create_dir_all(dir.path().join(format!("node_modules/pkg{i}"))).unwrap();
        }
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert_eq!(walked(&view, ""), vec!["", "README.md", "index.js"]);
        assert!(view.digest("").is_ok());
    }

    #[test]
    fn test_containerignore_preferred() {
        let dir = context(&[(".containerignore", "a\n"), (".dockerignore", "b\n"), ("a", ""), ("b", "")]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert!(view.is_excluded("a"));
        assert!(!view.is_excluded("b"));
        assert!(view.is_excluded(".containerignore"));
    }

    #[test]
    fn test_open_results() {
        let dir = context(&[(".dockerignore", "secret\n"), ("hello", "hi\n"), ("secret", "x")]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        match view.open("hello").unwrap() {
            OpenResult::Found(mut f) => {
                let mut s = String::new();
                f.read_to_string(&mut s).unwrap();
                assert_eq!(s, "hi\n");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(view.open("secret").unwrap(), OpenResult::Excluded));
        assert!(matches!(view.open("missing").unwrap(), OpenResult::NotFound));
    }

    #[test]
    fn test_symlink_cannot_escape() {
        let outside = context(&[("passwd", "root")]);
        let dir = context(&[]);
        std::os::unix::fs::symlink(outside.path().join("passwd"), dir.path().join("link")).unwrap();
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert!(matches!(view.open("link").unwrap(), OpenResult::NotFound));
    }

    #[test]
    fn test_digest_tracks_content_not_mtime() {
        let dir = context(&[("a", "x")]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        let first = view.digest("a").unwrap();
        fsutil::set_mtime(&dir.path().join("a"), 1, 0).unwrap();
        assert_eq!(view.digest("a").unwrap(), first);
        fs::write(dir.path().join("a"), "y").unwrap();
        assert_ne!(view.digest("a").unwrap(), first);
    }

    #[test]
    fn test_digest_sees_ignore_file() {
        let dir = context(&[(".dockerignore", "tmp\n"), ("src", "")]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        let before = view.digest("").unwrap();
        fs::write(dir.path().join(".dockerignore"), "tmp\nother\n").unwrap();
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert_ne!(view.digest("").unwrap(), before);
    }

    #[test]
    fn test_glob() {
        let dir = context(&[("a.txt", ""), ("b.txt", ""), ("c.rs", ""), ("sub/d.txt", "")]);
        let view = ContextView::open_dir(dir.path()).unwrap();
        assert_eq!(view.glob("*.txt").unwrap(), vec!["a.txt", "b.txt"]);
        assert_eq!(view.glob("sub/*").unwrap(), vec!["sub/d.txt"]);
        assert!(has_wildcards("*.txt"));
        assert!(!has_wildcards("plain"));
    }

    #[test]
    fn test_from_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        builder.append_data(&mut header, "hello", &b"hi\n"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();
        let view = ContextView::from_tar(&bytes[..]).unwrap();
        assert_eq!(fs::read(view.root().join("hello")).unwrap(), b"hi\n");
    }

    #[test]
    fn test_missing_context_is_error() {
        let err = ContextView::open_dir(Path::new("/nonexistent/kiln-context")).unwrap_err();
        assert!(matches!(err, BuildError::ContextError(_)));
    }
}
