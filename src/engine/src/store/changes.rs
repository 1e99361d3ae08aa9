//! Filesystem snapshots, diff tars and diff application.
//!
//! A [`DirSnapshot`] records the metadata of every path under a root. Two
//! snapshots yield the change set that becomes a layer: added and modified
//! paths with their parent directories, plus `.wh.` whiteouts for deletions.
//! Entries are written in component-wise lexicographic order so the same
//! tree always produces the same tar bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use tar::{EntryType, Header};

use crate::fsutil;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// Metadata recorded for one path.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
    pub link_target: Option<PathBuf>,
    pub rdev: u64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
}

impl EntryMeta {
    pub fn from_metadata(meta: &std::fs::Metadata, path: &Path) -> io::Result<Self> {
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            EntryKind::Dir
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_char_device() {
            EntryKind::CharDevice
        } else if ft.is_block_device() {
            EntryKind::BlockDevice
        } else if ft.is_fifo() {
            EntryKind::Fifo
        } else if ft.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::File
        };
        let link_target = match kind {
            EntryKind::Symlink => Some(std::fs::read_link(path)?),
            _ => None,
        };
        Ok(Self {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size: if kind == EntryKind::File { meta.size() } else { 0 },
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
            link_target,
            rdev: meta.rdev(),
            dev: meta.dev(),
            ino: meta.ino(),
            nlink: meta.nlink(),
        })
    }

    /// Whether `other` describes the same content. Directory timestamps
    /// are ignored since adding a child always bumps them. Files also have
    /// to be the same inode, unchanged since the snapshot: a replacement
    /// can carry over size and mtime.
    pub fn same_as(&self, other: &EntryMeta) -> bool {
        if self.kind != other.kind
            || self.mode != other.mode
            || self.uid != other.uid
            || self.gid != other.gid
        {
            return false;
        }
        match self.kind {
            EntryKind::Dir => true,
            EntryKind::Symlink => self.link_target == other.link_target,
            EntryKind::CharDevice | EntryKind::BlockDevice => self.rdev == other.rdev,
            _ => {
                self.size == other.size
                    && self.mtime == other.mtime
                    && self.mtime_nsec == other.mtime_nsec
                    && self.dev == other.dev
                    && self.ino == other.ino
                    && self.ctime == other.ctime
                    && self.ctime_nsec == other.ctime_nsec
            }
        }
    }
}

/// Metadata of every path under a root, keyed by root-relative path.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    pub entries: BTreeMap<PathBuf, EntryMeta>,
}

impl DirSnapshot {
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if root.exists() {
            walk(root, Path::new(""), &mut entries)?;
        }
        Ok(DirSnapshot { entries })
    }

    /// Re-capture `rel` and everything beneath it from the tree at `root`.
    pub fn refresh(&mut self, root: &Path, rel: &Path) -> Result<()> {
        if rel.as_os_str().is_empty() {
            *self = Self::capture(root)?;
            return Ok(());
        }
        self.entries.retain(|path, _| !path.starts_with(rel));
        let path = root.join(rel);
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            return Ok(());
        };
        let record = EntryMeta::from_metadata(&meta, &path)?;
        let is_dir = record.kind == EntryKind::Dir;
        self.entries.insert(rel.to_path_buf(), record);
        if is_dir {
            walk(root, rel, &mut self.entries)?;
        }
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<&EntryMeta> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths added or modified in `after`, and paths deleted from `self`.
    pub fn changes(&self, after: &DirSnapshot) -> ChangeSet {
        let mut changed = BTreeSet::new();
        for (path, meta) in &after.entries {
            match self.entries.get(path) {
                Some(before) if before.same_as(meta) => {}
                _ => {
                    changed.insert(path.clone());
                }
            }
        }

        let mut deleted = BTreeSet::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            // A deleted or retyped ancestor already covers this path.
            let covered = path.ancestors().skip(1).any(|ancestor| {
                if ancestor.as_os_str().is_empty() {
                    return false;
                }
                match (self.entries.get(ancestor), after.entries.get(ancestor)) {
                    (Some(_), None) => true,
                    (Some(b), Some(a)) => b.kind != a.kind,
                    _ => false,
                }
            });
            if !covered {
                deleted.insert(path.clone());
            }
        }

        ChangeSet { changed, deleted }
    }
}

fn walk(root: &Path, rel: &Path, entries: &mut BTreeMap<PathBuf, EntryMeta>) -> Result<()> {
    let dir = root.join(rel);
    let read_dir = std::fs::read_dir(&dir).map_err(|e| {
        BuildError::storage(format!("Failed to read directory {}: {}", dir.display(), e))
    })?;
    for entry in read_dir {
        let entry = entry?;
        let rel_path = rel.join(entry.file_name());
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        let record = EntryMeta::from_metadata(&meta, &path)?;
        let is_dir = record.kind == EntryKind::Dir;
        entries.insert(rel_path.clone(), record);
        if is_dir {
            walk(root, &rel_path, entries)?;
        }
    }
    Ok(())
}

/// Result of comparing two snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Counters of a written diff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiffStats {
    pub entries: u64,
    /// Sum of regular file sizes, i.e. bytes once extracted.
    pub content_size: u64,
}

enum DiffItem<'a> {
    Entry(&'a EntryMeta),
    Whiteout,
}

/// Write the tar for `changes` of the tree at `root` to `out`.
pub fn write_diff<W: Write>(
    root: &Path,
    after: &DirSnapshot,
    changes: &ChangeSet,
    out: W,
) -> Result<(W, DiffStats)> {
    let mut items: BTreeMap<PathBuf, DiffItem<'_>> = BTreeMap::new();

    for path in &changes.changed {
        if let Some(meta) = after.get(path) {
            items.insert(path.clone(), DiffItem::Entry(meta));
        }
    }
    for path in &changes.deleted {
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            let mut wh = std::ffi::OsString::from(WHITEOUT_PREFIX);
            wh.push(name);
            items.insert(parent.join(wh), DiffItem::Whiteout);
        }
    }

    // Parent directories travel with their children.
    let paths: Vec<PathBuf> = items.keys().cloned().collect();
    for path in paths {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() || items.contains_key(ancestor) {
                continue;
            }
            if let Some(meta) = after.get(ancestor) {
                items.insert(ancestor.to_path_buf(), DiffItem::Entry(meta));
            }
        }
    }

    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    let mut stats = DiffStats::default();
    let mut links: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for (path, item) in &items {
        match item {
            DiffItem::Whiteout => {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
                builder.append_data(&mut header, path, io::empty())?;
            }
            DiffItem::Entry(meta) => {
                append_entry(&mut builder, root, path, meta, &mut links, &mut stats)?;
            }
        }
        stats.entries += 1;
    }

    let out = builder.into_inner()?;
    Ok((out, stats))
}

/// Write a whole tree (every path under `root`) as a tar.
pub fn write_tree<W: Write>(root: &Path, out: W) -> Result<(W, DiffStats)> {
    let snapshot = DirSnapshot::capture(root)?;
    let changes = DirSnapshot::default().changes(&snapshot);
    write_diff(root, &snapshot, &changes, out)
}

fn base_header(meta: &EntryMeta, kind: EntryType) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(meta.mode);
    header.set_uid(meta.uid as u64);
    header.set_gid(meta.gid as u64);
    header.set_mtime(meta.mtime.max(0) as u64);
    header.set_size(0);
    header
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
    meta: &EntryMeta,
    links: &mut HashMap<(u64, u64), PathBuf>,
    stats: &mut DiffStats,
) -> Result<()> {
    let host = root.join(rel);
    match meta.kind {
        EntryKind::Dir => {
            let mut header = base_header(meta, EntryType::Directory);
            builder.append_data(&mut header, rel, io::empty())?;
        }
        EntryKind::File => {
            if meta.nlink > 1 {
                if let Some(first) = links.get(&(meta.dev, meta.ino)) {
                    let mut header = base_header(meta, EntryType::Link);
                    builder.append_link(&mut header, rel, first)?;
                    return Ok(());
                }
                links.insert((meta.dev, meta.ino), rel.to_path_buf());
            }
            let mut header = base_header(meta, EntryType::Regular);
            header.set_size(meta.size);
            let file = File::open(&host)?;
            builder.append_data(&mut header, rel, file.take(meta.size))?;
            stats.content_size += meta.size;
        }
        EntryKind::Symlink => {
            let mut header = base_header(meta, EntryType::Symlink);
            let target = meta.link_target.clone().unwrap_or_default();
            builder.append_link(&mut header, rel, target)?;
        }
        EntryKind::CharDevice | EntryKind::BlockDevice => {
            let kind = if meta.kind == EntryKind::CharDevice {
                EntryType::Char
            } else {
                EntryType::Block
            };
            let mut header = base_header(meta, kind);
            header.set_device_major(nix::sys::stat::major(meta.rdev) as u32)?;
            header.set_device_minor(nix::sys::stat::minor(meta.rdev) as u32)?;
            builder.append_data(&mut header, rel, io::empty())?;
        }
        EntryKind::Fifo => {
            let mut header = base_header(meta, EntryType::Fifo);
            builder.append_data(&mut header, rel, io::empty())?;
        }
        EntryKind::Socket => {
            tracing::debug!(path = %rel.display(), "Skipping socket in diff");
        }
    }
    Ok(())
}

/// How whiteout entries are materialized on extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutMode {
    /// Delete the named path (single-directory extraction).
    Apply,
    /// Create overlayfs markers (char device 0/0, opaque xattr).
    Overlay,
    /// Treat `.wh.` names as ordinary files (plain archives).
    Ignore,
}

/// Extract a diff tar into `root`. Returns bytes of regular file content.
pub fn apply_diff(root: &Path, reader: impl Read, mode: WhiteoutMode) -> Result<u64> {
    let mut archive = tar::Archive::new(reader);
    let privileged = fsutil::is_root_user();
    let mut written: HashSet<PathBuf> = HashSet::new();
    let mut dir_times: Vec<(PathBuf, i64)> = Vec::new();
    let mut total = 0u64;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = sanitize_entry_path(&entry.path()?)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let rel_str = rel.to_string_lossy().into_owned();
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if mode != WhiteoutMode::Ignore && name.starts_with(WHITEOUT_PREFIX) {
            let parent_rel = rel.parent().unwrap_or(Path::new(""));
            let parent = fsutil::resolve_in_root(root, &parent_rel.to_string_lossy())?;
            apply_whiteout(&parent, parent_rel, &name, mode, &written)?;
            continue;
        }

        let dst = fsutil::resolve_parent_in_root(root, &rel_str)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let header = entry.header();
        let entry_type = header.entry_type();
        let mode_bits = header.mode()? & 0o7777;
        let uid = header.uid()? as u32;
        let gid = header.gid()? as u32;
        let mtime = header.mtime()? as i64;

        let existing = std::fs::symlink_metadata(&dst).ok();
        match entry_type {
            EntryType::Directory => {
                if let Some(meta) = &existing {
                    if !meta.is_dir() {
                        fsutil::remove_any(&dst)?;
                    }
                }
                if !dst.is_dir() {
                    std::fs::create_dir(&dst)?;
                }
                set_owner_mode(&dst, uid, gid, mode_bits, privileged)?;
                dir_times.push((dst.clone(), mtime));
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                if existing.is_some() {
                    fsutil::remove_any(&dst)?;
                }
                let mut file = File::create(&dst)?;
                total += io::copy(&mut entry, &mut file)?;
                drop(file);
                set_owner_mode(&dst, uid, gid, mode_bits, privileged)?;
                fsutil::set_mtime(&dst, mtime, 0)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| BuildError::storage(format!("symlink {} has no target", rel_str)))?
                    .into_owned();
                if existing.is_some() {
                    fsutil::remove_any(&dst)?;
                }
                std::os::unix::fs::symlink(&target, &dst)?;
                if privileged {
                    std::os::unix::fs::lchown(&dst, Some(uid), Some(gid))?;
                }
                fsutil::set_mtime(&dst, mtime, 0)?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| BuildError::storage(format!("hard link {} has no target", rel_str)))?;
                let target_rel = sanitize_entry_path(&target)?;
                let source = fsutil::resolve_parent_in_root(root, &target_rel.to_string_lossy())?;
                if existing.is_some() {
                    fsutil::remove_any(&dst)?;
                }
                std::fs::hard_link(&source, &dst)?;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                if existing.is_some() {
                    fsutil::remove_any(&dst)?;
                }
                make_node(&dst, entry_type, &entry, mode_bits)?;
                if std::fs::symlink_metadata(&dst).is_ok() {
                    set_owner_mode(&dst, uid, gid, mode_bits, privileged)?;
                }
            }
            EntryType::XHeader | EntryType::XGlobalHeader | EntryType::GNULongName
            | EntryType::GNULongLink => {}
            other => {
                tracing::debug!(path = %rel_str, kind = ?other, "Skipping unsupported tar entry");
            }
        }
        written.insert(rel);
    }

    // Children bump directory times; restore them last, deepest first.
    dir_times.sort_by(|a, b| b.0.cmp(&a.0));
    for (dir, mtime) in dir_times {
        fsutil::set_mtime(&dir, mtime, 0)?;
    }
    Ok(total)
}

fn apply_whiteout(
    parent: &Path,
    parent_rel: &Path,
    name: &str,
    mode: WhiteoutMode,
    written: &HashSet<PathBuf>,
) -> Result<()> {
    if name == WHITEOUT_OPAQUE {
        match mode {
            WhiteoutMode::Apply => {
                if let Ok(entries) = std::fs::read_dir(parent) {
                    for child in entries {
                        let child = child?;
                        // Entries from this same layer survive the opaque marker.
                        if !written.contains(&parent_rel.join(child.file_name())) {
                            fsutil::remove_any(&child.path())?;
                        }
                    }
                }
            }
            WhiteoutMode::Overlay => {
                std::fs::create_dir_all(parent)?;
                set_xattr(parent, "trusted.overlay.opaque", b"y")?;
            }
            WhiteoutMode::Ignore => {}
        }
        return Ok(());
    }

    let target = parent.join(&name[WHITEOUT_PREFIX.len()..]);
    match mode {
        WhiteoutMode::Apply => fsutil::remove_any(&target)?,
        WhiteoutMode::Overlay => {
            std::fs::create_dir_all(parent)?;
            fsutil::remove_any(&target)?;
            nix::sys::stat::mknod(
                &target,
                nix::sys::stat::SFlag::S_IFCHR,
                nix::sys::stat::Mode::empty(),
                0,
            )
            .map_err(|e| mount_err("whiteout", &target, e))?;
        }
        WhiteoutMode::Ignore => {}
    }
    Ok(())
}

fn make_node<R: Read>(dst: &Path, kind: EntryType, entry: &tar::Entry<'_, R>, mode: u32) -> Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};
    let header = entry.header();
    let (flag, dev) = match kind {
        EntryType::Char | EntryType::Block => {
            let major = header.device_major()?.unwrap_or(0) as u64;
            let minor = header.device_minor()?.unwrap_or(0) as u64;
            let flag = if kind == EntryType::Char {
                SFlag::S_IFCHR
            } else {
                SFlag::S_IFBLK
            };
            (flag, makedev(major, minor))
        }
        _ => (SFlag::S_IFIFO, 0),
    };
    match mknod(dst, flag, Mode::from_bits_truncate(mode), dev) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EPERM) if flag != SFlag::S_IFIFO => {
            tracing::warn!(path = %dst.display(), "Skipping device node: insufficient privileges");
            Ok(())
        }
        Err(e) => Err(mount_err("mknod", dst, e)),
    }
}

fn set_owner_mode(path: &Path, uid: u32, gid: u32, mode: u32, privileged: bool) -> Result<()> {
    if privileged {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn set_xattr(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| BuildError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let c_name = std::ffi::CString::new(name)
        .map_err(|e| BuildError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    // SAFETY: both strings are NUL-terminated; value pointer/len describe a valid slice.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn mount_err(op: &str, path: &Path, e: nix::errno::Errno) -> BuildError {
    match e {
        nix::errno::Errno::EPERM => {
            BuildError::PermissionDenied(format!("{} {}: {}", op, path.display(), e))
        }
        _ => BuildError::storage(format!("{} {}: {}", op, path.display(), e)),
    }
}

/// Strip leading `/` and `./`, reject `..`.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BuildError::storage(format!(
                    "refusing tar entry outside root: {}",
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    fn diff_bytes(root: &Path, before: &DirSnapshot) -> (Vec<u8>, DiffStats) {
        let after = DirSnapshot::capture(root).unwrap();
        let changes = before.changes(&after);
        write_diff(root, &after, &changes, Vec::new()).unwrap()
    }

    #[test]
    fn test_no_changes_yields_empty_set() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let snap = DirSnapshot::capture(dir.path()).unwrap();
        let again = DirSnapshot::capture(dir.path()).unwrap();
        assert!(snap.changes(&again).is_empty());
    }

    #[test]
    fn test_added_file_at_root() {
        let dir = TempDir::new().unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::write(dir.path().join("hello"), b"hi\n").unwrap();
        let (bytes, stats) = diff_bytes(dir.path(), &before);
        assert_eq!(entry_names(&bytes), vec!["hello"]);
        assert_eq!(stats.content_size, 3);
    }

    #[test]
    fn test_zero_length_file_is_header_only() {
        let dir = TempDir::new().unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::write(dir.path().join("empty"), b"").unwrap();
        let (bytes, stats) = diff_bytes(dir.path(), &before);
        assert_eq!(entry_names(&bytes), vec!["empty"]);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.content_size, 0);
    }

    #[test]
    fn test_nested_change_includes_parents() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/conf.d")).unwrap();
        std::fs::write(dir.path().join("etc/other"), b"o").unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::write(dir.path().join("etc/conf.d/x"), b"x").unwrap();
        let (bytes, _) = diff_bytes(dir.path(), &before);
        assert_eq!(entry_names(&bytes), vec!["etc", "etc/conf.d", "etc/conf.d/x"]);
    }

    #[test]
    fn test_deletion_emits_whiteout_only_for_top() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("gone/deep")).unwrap();
        std::fs::write(dir.path().join("gone/deep/f"), b"f").unwrap();
        std::fs::write(dir.path().join("file"), b"f").unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::remove_dir_all(dir.path().join("gone")).unwrap();
        std::fs::remove_file(dir.path().join("file")).unwrap();
        let (bytes, _) = diff_bytes(dir.path(), &before);
        assert_eq!(entry_names(&bytes), vec![".wh.file", ".wh.gone"]);
    }

    #[test]
    fn test_modified_file_detected_by_mtime() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"aaaa").unwrap();
        fsutil::set_mtime(&file, 1_000, 0).unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::write(&file, b"bbbb").unwrap();
        let after = DirSnapshot::capture(dir.path()).unwrap();
        assert_eq!(
            before.changes(&after).changed.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("f")]
        );
    }

    #[test]
    fn test_replaced_file_with_same_size_and_mtime_detected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"AA").unwrap();
        fsutil::set_mtime(&file, 1_000, 0).unwrap();
        let mut before = DirSnapshot::capture(dir.path()).unwrap();

        std::fs::remove_file(&file).unwrap();
        std::fs::write(&file, b"BB").unwrap();
        fsutil::set_mtime(&file, 1_000, 0).unwrap();
        let after = DirSnapshot::capture(dir.path()).unwrap();
        assert_eq!(
            before.changes(&after).changed.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("f")]
        );

        before.refresh(dir.path(), Path::new("f")).unwrap();
        assert!(before.changes(&after).is_empty());
    }

    #[test]
    fn test_refresh_drops_removed_subtree() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        std::fs::write(dir.path().join("d/sub/f"), b"x").unwrap();
        let mut snap = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::remove_dir_all(dir.path().join("d/sub")).unwrap();

        snap.refresh(dir.path(), Path::new("d/sub")).unwrap();
        assert!(snap.get(Path::new("d")).is_some());
        assert!(snap.get(Path::new("d/sub")).is_none());
        assert!(snap.get(Path::new("d/sub/f")).is_none());
    }

    #[test]
    fn test_mode_change_detected_for_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::set_permissions(dir.path().join("d"), std::fs::Permissions::from_mode(0o700))
            .unwrap();
        let after = DirSnapshot::capture(dir.path()).unwrap();
        assert!(before.changes(&after).changed.contains(Path::new("d")));
    }

    #[test]
    fn test_diff_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let before = DirSnapshot::capture(dir.path()).unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b/z"), b"z").unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        let (first, _) = diff_bytes(dir.path(), &before);
        let (second, _) = diff_bytes(dir.path(), &before);
        assert_eq!(first, second);
        assert_eq!(entry_names(&first), vec!["a", "b", "b/z"]);
    }

    #[test]
    fn test_apply_roundtrip_with_symlink_and_hardlink() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("bin")).unwrap();
        std::fs::write(src.path().join("bin/tool"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(src.path().join("bin/tool"), std::fs::Permissions::from_mode(0o755))
            .unwrap();
        std::fs::hard_link(src.path().join("bin/tool"), src.path().join("bin/alias")).unwrap();
        symlink("tool", src.path().join("bin/link")).unwrap();
        let (bytes, _) = write_tree(src.path(), Vec::new()).unwrap();

        let dst = TempDir::new().unwrap();
        apply_diff(dst.path(), &bytes[..], WhiteoutMode::Apply).unwrap();
        assert_eq!(std::fs::read(dst.path().join("bin/tool")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(std::fs::read(dst.path().join("bin/alias")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(
            std::fs::read_link(dst.path().join("bin/link")).unwrap(),
            PathBuf::from("tool")
        );
        let mode = std::fs::metadata(dst.path().join("bin/tool")).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o755);
        let ino_a = std::fs::metadata(dst.path().join("bin/tool")).unwrap().ino();
        let ino_b = std::fs::metadata(dst.path().join("bin/alias")).unwrap().ino();
        assert_eq!(ino_a, ino_b);
    }

    #[test]
    fn test_apply_whiteout_deletes() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/old"), b"x").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "etc/.wh.old", io::empty())
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        apply_diff(root.path(), &bytes[..], WhiteoutMode::Apply).unwrap();
        assert!(!root.path().join("etc/old").exists());
        assert!(root.path().join("etc").is_dir());
    }

    #[test]
    fn test_apply_opaque_keeps_same_layer_entries() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("d")).unwrap();
        std::fs::write(root.path().join("d/lower"), b"x").unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder.append_data(&mut dir, "d/", io::empty()).unwrap();
        let mut file = Header::new_gnu();
        file.set_size(1);
        file.set_mode(0o644);
        builder.append_data(&mut file, "d/new", &b"n"[..]).unwrap();
        let mut opq = Header::new_gnu();
        opq.set_size(0);
        opq.set_mode(0o644);
        builder
            .append_data(&mut opq, "d/.wh..wh..opq", io::empty())
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        apply_diff(root.path(), &bytes[..], WhiteoutMode::Apply).unwrap();
        assert!(!root.path().join("d/lower").exists());
        assert!(root.path().join("d/new").exists());
    }

    #[test]
    fn test_apply_rejects_parent_escape() {
        let root = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        // set_path refuses "..", so write the name bytes directly.
        let name = b"../evil";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();
        assert!(apply_diff(root.path(), &bytes[..], WhiteoutMode::Apply).is_err());
    }

    #[test]
    fn test_apply_ignore_mode_keeps_whiteout_names() {
        let root = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        builder.append_data(&mut header, ".wh.keep", io::empty()).unwrap();
        let bytes = builder.into_inner().unwrap();
        apply_diff(root.path(), &bytes[..], WhiteoutMode::Ignore).unwrap();
        assert!(root.path().join(".wh.keep").exists());
    }
}
