//! File transfer for COPY and ADD.
//!
//! Sources come from the build context, from another stage's tree or image
//! (`--from`), or, for ADD, from a URL. Directory sources copy their
//! contents. Modes and modification times are preserved; ownership is
//! `0:0` unless `--chown` names someone else. ADD additionally unpacks
//! local tar archives, compressed or not.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::error::{BuildError, Result};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::context::{has_wildcards, ContextView, FileKind};
use crate::digest::{Digest, DigestWriter};
use crate::fsutil;
use crate::sandbox::user;

/// Owner and mode override applied to everything one instruction copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopyOptions {
    pub uid: u32,
    pub gid: u32,
    pub chmod: Option<u32>,
}

impl CopyOptions {
    /// Resolve `--chown` against the users of `rootfs` and parse `--chmod`.
    pub fn resolve(rootfs: &Path, chown: Option<&str>, chmod: Option<&str>) -> Result<Self> {
        let (uid, gid) = match chown {
            Some(spec) if !spec.is_empty() => {
                let user = user::resolve(rootfs, spec)?;
                (user.uid, user.gid)
            }
            _ => (0, 0),
        };
        let chmod = chmod.map(parse_chmod).transpose()?;
        Ok(Self { uid, gid, chmod })
    }
}

/// Parse an octal `--chmod` value.
pub(crate) fn parse_chmod(value: &str) -> Result<u32> {
    match u32::from_str_radix(value, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(BuildError::ScriptInvalid(format!(
            "invalid --chmod value '{}': expected an octal mode",
            value
        ))),
    }
}

/// Where an instruction copies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Destination {
    /// Clean absolute path inside the container
    pub path: String,
    /// Written as a directory: trailing `/`, `.`, or several sources
    pub is_dir: bool,
}

impl Destination {
    pub fn new(workdir: &str, dest: &str, source_count: usize) -> Self {
        let joined = if dest.starts_with('/') {
            dest.to_string()
        } else {
            format!("{}/{}", workdir, dest)
        };
        let is_dir = source_count > 1
            || dest.ends_with('/')
            || dest == "."
            || dest.ends_with("/.");
        Self {
            path: fsutil::clean_path(&joined),
            is_dir,
        }
    }

    /// Container path for a file named `name` copied here.
    fn file_target(&self, rootfs: &Path, name: &str) -> Result<String> {
        let existing_dir = fsutil::resolve_in_root(rootfs, &self.path)?.is_dir();
        if self.is_dir || existing_dir {
            Ok(join(&self.path, name))
        } else {
            Ok(self.path.clone())
        }
    }
}

fn join(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        base.to_string()
    } else if base == "/" {
        format!("/{}", rel)
    } else {
        format!("{}/{}", base, rel)
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Context-relative `/`-separated form, `""` for the root.
fn relative(path: &str) -> String {
    fsutil::clean_path(path).trim_start_matches('/').to_string()
}

/// Expand source operands into context paths. Wildcards match against the
/// context; a source that matches nothing, does not exist or is excluded by
/// the ignore file is `CopySourceMissing`.
pub(crate) fn context_sources(context: &ContextView, sources: &[String]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for source in sources {
        let rel = relative(source);
        let matched = if has_wildcards(&rel) {
            let found = context.glob(&rel)?;
            if found.is_empty() {
                return Err(BuildError::CopySourceMissing(format!(
                    "no files in the build context match '{}'",
                    source
                )));
            }
            found
        } else {
            if !rel.is_empty() && context.is_excluded(&rel) {
                return Err(BuildError::CopySourceMissing(format!(
                    "'{}' is excluded by {}",
                    source,
                    context.ignore_file().unwrap_or("the ignore file")
                )));
            }
            if context.metadata(&rel)?.is_none() {
                return Err(BuildError::CopySourceMissing(format!(
                    "'{}' does not exist in the build context",
                    source
                )));
            }
            vec![rel]
        };
        for path in matched {
            if !out.contains(&path) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

/// Host paths of the sources inside another stage's tree. Wildcards are
/// allowed in the final component only.
pub(crate) fn tree_sources(tree: &Path, sources: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for source in sources {
        let clean = fsutil::clean_path(source);
        let name = base_name(&clean);
        if has_wildcards(name) {
            let parent = match clean.rfind('/') {
                Some(0) | None => "/",
                Some(i) => &clean[..i],
            };
            if has_wildcards(parent) {
                return Err(BuildError::ScriptInvalid(format!(
                    "'{}': wildcards are only supported in the last path component with --from",
                    source
                )));
            }
            let pattern = glob::Pattern::new(name).map_err(|e| {
                BuildError::ScriptInvalid(format!("invalid pattern '{}': {}", source, e))
            })?;
            let dir = fsutil::resolve_in_root(tree, parent)?;
            let mut names: Vec<String> = match fs::read_dir(&dir) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| pattern.matches(n))
                    .collect(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            names.sort();
            if names.is_empty() {
                return Err(BuildError::CopySourceMissing(format!(
                    "no files match '{}'",
                    source
                )));
            }
            for n in names {
                out.push((n.clone(), dir.join(n)));
            }
        } else {
            let host = fsutil::resolve_in_root(tree, &clean)?;
            if fs::symlink_metadata(&host).is_err() {
                return Err(BuildError::CopySourceMissing(format!("'{}' does not exist", source)));
            }
            out.push((name.to_string(), host));
        }
    }
    Ok(out)
}

/// Copy one context source (file or directory) to `dest`.
pub(crate) fn copy_context_source(
    context: &ContextView,
    rel: &str,
    rootfs: &Path,
    dest: &Destination,
    options: CopyOptions,
) -> Result<()> {
    let meta = context
        .metadata(rel)?
        .ok_or_else(|| BuildError::CopySourceMissing(format!("'{}' vanished from the context", rel)))?;
    let host = context.host_path(rel)?;
    if meta.kind == FileKind::Dir {
        let prefix = if rel.is_empty() { String::new() } else { format!("{}/", rel) };
        let mut entries = Vec::new();
        for item in context.walk(rel)? {
            let (path, _) = item?;
            let sub = if path == rel {
                String::new()
            } else {
                path.strip_prefix(&prefix).unwrap_or(&path).to_string()
            };
            let source = if sub.is_empty() { host.clone() } else { host.join(&sub) };
            entries.push((sub, source));
        }
        copy_planned(&entries, rootfs, &dest.path, options)
    } else {
        let target = dest.file_target(rootfs, base_name(rel))?;
        copy_planned(&[(String::new(), host)], rootfs, &target, options)
    }
}

/// Copy one source out of another stage's tree to `dest`.
pub(crate) fn copy_tree_source(
    name: &str,
    host: &Path,
    rootfs: &Path,
    dest: &Destination,
    options: CopyOptions,
) -> Result<()> {
    // A symlink naming a directory copies the directory.
    if host.is_dir() {
        copy_planned(&plan_tree(host)?, rootfs, &dest.path, options)
    } else {
        let target = dest.file_target(rootfs, name)?;
        copy_planned(&[(String::new(), host.to_path_buf())], rootfs, &target, options)
    }
}

/// `(relative path, host path)` for `root` and everything beneath it,
/// parents before children, names in byte order.
fn plan_tree(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = vec![(String::new(), root.to_path_buf())];
    let mut pending = Vec::new();
    if root.is_dir() {
        pending.push((String::new(), root.to_path_buf()));
    }
    while let Some((rel, dir)) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if rel.is_empty() { name } else { format!("{}/{}", rel, name) };
            if entry.file_type()?.is_dir() {
                pending.push((child.clone(), entry.path()));
            }
            out.push((child, entry.path()));
        }
    }
    out.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    Ok(out)
}

/// Copy planned entries below the container path `target`. The entry with
/// an empty relative path is the source itself.
fn copy_planned(
    entries: &[(String, PathBuf)],
    rootfs: &Path,
    target: &str,
    options: CopyOptions,
) -> Result<()> {
    let mut dirs: Vec<(PathBuf, fs::Metadata, bool)> = Vec::new();
    for (rel, source) in entries {
        let in_container = join(target, rel);
        // The source itself follows symlinks; entries beneath it do not.
        let meta = if rel.is_empty() {
            fs::metadata(source)?
        } else {
            fs::symlink_metadata(source)?
        };
        let dest = fsutil::resolve_parent_in_root(rootfs, &in_container)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_type = meta.file_type();
        if file_type.is_dir() {
            let existed = match fs::symlink_metadata(&dest) {
                Ok(m) if m.is_dir() => true,
                Ok(_) => {
                    fsutil::remove_any(&dest)?;
                    false
                }
                Err(_) => false,
            };
            if !existed {
                fs::create_dir(&dest)?;
            }
            // An existing destination root keeps its own metadata.
            let adopt = !(rel.is_empty() && existed);
            if adopt {
                let mode = options.chmod.unwrap_or(meta.mode() & 0o7777);
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
                fsutil::lchown_if_privileged(&dest, options.uid, options.gid)?;
            }
            dirs.push((dest, meta, adopt));
        } else if file_type.is_symlink() {
            fsutil::remove_any(&dest)?;
            std::os::unix::fs::symlink(fs::read_link(source)?, &dest)?;
            fsutil::lchown_if_privileged(&dest, options.uid, options.gid)?;
            fsutil::set_mtime(&dest, meta.mtime(), meta.mtime_nsec())?;
        } else if file_type.is_file() {
            fsutil::remove_any(&dest)?;
            fs::copy(source, &dest)?;
            let mode = options.chmod.unwrap_or(meta.mode() & 0o7777);
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            fsutil::lchown_if_privileged(&dest, options.uid, options.gid)?;
            fsutil::set_mtime(&dest, meta.mtime(), meta.mtime_nsec())?;
        } else {
            debug!(path = %source.display(), "Skipping special file");
        }
    }
    // Directory times last, once their contents stopped changing.
    for (dest, meta, adopt) in dirs.iter().rev() {
        if *adopt {
            fsutil::set_mtime(dest, meta.mtime(), meta.mtime_nsec())?;
        }
    }
    Ok(())
}

pub(crate) fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// A downloaded ADD source.
#[derive(Debug)]
pub(crate) struct Download {
    pub url: String,
    pub file: NamedTempFile,
    pub digest: Digest,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Download {
    /// File name taken from the last path segment of the URL.
    pub fn file_name(&self) -> Result<String> {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .splitn(4, '/')
            .nth(3)
            .unwrap_or_default();
        let name = base_name(path);
        if name.is_empty() {
            return Err(BuildError::CopySourceMissing(format!(
                "cannot determine a file name from {}",
                self.url
            )));
        }
        Ok(name.to_string())
    }

    /// Write the download to `dest` with mode 0600. The modification time
    /// is `Last-Modified` when the server sent one, else `fallback`.
    pub fn install(
        &self,
        rootfs: &Path,
        dest: &Destination,
        options: CopyOptions,
        fallback: DateTime<Utc>,
    ) -> Result<()> {
        let target = dest.file_target(rootfs, &self.file_name()?)?;
        let host = fsutil::resolve_parent_in_root(rootfs, &target)?;
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent)?;
        }
        fsutil::remove_any(&host)?;
        fs::copy(self.file.path(), &host)?;
        fs::set_permissions(&host, fs::Permissions::from_mode(options.chmod.unwrap_or(0o600)))?;
        fsutil::lchown_if_privileged(&host, options.uid, options.gid)?;
        let mtime = self.last_modified.unwrap_or(fallback);
        fsutil::set_mtime(&host, mtime.timestamp(), i64::from(mtime.timestamp_subsec_nanos()))?;
        Ok(())
    }
}

/// Fetch `url` into a temporary file. Any non-success status is
/// `CopySourceMissing`; an empty body is a valid empty file.
pub(crate) async fn download(url: &str) -> Result<Download> {
    let missing = |e: String| BuildError::CopySourceMissing(format!("{}: {}", url, e));
    let mut response = reqwest::get(url).await.map_err(|e| missing(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(missing(format!("server returned {}", status)));
    }
    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc));

    let file = NamedTempFile::new()?;
    let mut writer = DigestWriter::new(file.reopen()?);
    while let Some(chunk) = response.chunk().await.map_err(|e| missing(e.to_string()))? {
        writer.write_all(&chunk)?;
    }
    writer.flush()?;
    let (_, digest, size) = writer.finish();
    debug!(url, size, "Downloaded ADD source");
    Ok(Download {
        url: url.to_string(),
        file,
        digest,
        last_modified,
    })
}

/// Magic numbers of the compression formats ADD recognizes.
fn decoder<'a>(mut file: File) -> Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; 6];
    let n = read_full(&mut file, &mut magic)?;
    let magic = &magic[..n];
    let head = io::Cursor::new(magic.to_vec());
    let reader = io::BufReader::new(head.chain(file));
    Ok(if magic.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::MultiGzDecoder::new(reader))
    } else if magic.starts_with(b"BZh") {
        Box::new(bzip2::read::BzDecoder::new(reader))
    } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Box::new(xz2::read::XzDecoder::new(reader))
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Box::new(zstd::stream::read::Decoder::with_buffer(reader)?)
    } else {
        Box::new(reader)
    })
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// If `host` is a tar archive (optionally compressed), unpack it into the
/// directory `dest` and return true. Anything else is left alone.
pub(crate) fn extract_archive(host: &Path, rootfs: &Path, dest: &Destination) -> Result<bool> {
    if !host.is_file() {
        return Ok(false);
    }
    let mut reader = match decoder(File::open(host)?) {
        Ok(r) => r,
        Err(_) => return Ok(false),
    };
    let mut header = [0u8; 512];
    let n = match read_full(&mut reader, &mut header) {
        Ok(n) => n,
        // Compressed but corrupt, or not compressed after all.
        Err(_) => return Ok(false),
    };
    if n < 512 || &header[257..262] != b"ustar" {
        return Ok(false);
    }

    let target = fsutil::resolve_in_root(rootfs, &dest.path)?;
    fs::create_dir_all(&target)?;
    let mut archive = tar::Archive::new(io::Cursor::new(header.to_vec()).chain(reader));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(fsutil::is_root_user());
    archive.set_overwrite(true);
    archive.unpack(&target).map_err(|e| {
        BuildError::ContextError(format!("failed to extract {}: {}", host.display(), e))
    })?;
    debug!(archive = %host.display(), dest = %dest.path, "Extracted archive");
    Ok(true)
}
