//! Filesystem helpers shared by the storage, copy and volume code.

use std::io;
use std::path::{Component, Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;

/// Symlinks followed before giving up, as in the kernel's ELOOP limit.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolve `in_path` (a path as seen inside the container) to a host path
/// under `root`.
///
/// Every symlink component is interpreted relative to `root`: absolute
/// targets restart at `root`, and `..` never climbs above it. Components
/// that do not exist are appended lexically, so the result may name a path
/// that is yet to be created.
pub fn resolve_in_root(root: &Path, in_path: &str) -> Result<PathBuf> {
    let mut resolved: Vec<std::ffi::OsString> = Vec::new();
    let mut pending: Vec<std::ffi::OsString> = components_of(Path::new(in_path));
    pending.reverse();
    let mut hops = 0;

    while let Some(component) = pending.pop() {
        if component == ".." {
            resolved.pop();
            continue;
        }
        let mut candidate = root.to_path_buf();
        candidate.extend(resolved.iter());
        candidate.push(&component);

        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(BuildError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("too many levels of symbolic links resolving {}", in_path),
                    )));
                }
                let target = std::fs::read_link(&candidate)?;
                if target.is_absolute() {
                    resolved.clear();
                }
                let mut next = components_of(&target);
                next.reverse();
                pending.extend(next);
            }
            _ => resolved.push(component),
        }
    }

    let mut out = root.to_path_buf();
    out.extend(resolved.iter());
    Ok(out)
}

/// Resolve the parent of `in_path` inside `root` and append the final
/// component without following it. Used when the final entry is about to be
/// replaced.
pub fn resolve_parent_in_root(root: &Path, in_path: &str) -> Result<PathBuf> {
    let clean = clean_path(in_path);
    let path = Path::new(&clean);
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            Ok(resolve_in_root(root, &parent.to_string_lossy())?.join(name))
        }
        _ => Ok(root.to_path_buf()),
    }
}

/// Normal components of `path`, with `.` dropped and `..` kept.
fn components_of(path: &Path) -> Vec<std::ffi::OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_os_string()),
            Component::ParentDir => Some("..".into()),
            _ => None,
        })
        .collect()
}

/// Lexically normalise an in-container path to absolute form without
/// trailing slash: `a/./b/../c/` becomes `/a/c`.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Whether `path` equals `base` or lies beneath it (both clean, absolute).
pub fn is_within(path: &str, base: &str) -> bool {
    base == "/"
        || path == base
        || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
}

pub fn is_root_user() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Change owner without following symlinks. Without privileges the call is
/// skipped, since unprivileged builds cannot own files as other users.
pub fn lchown_if_privileged(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if !is_root_user() {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Set access and modification time (nanosecond precision) without
/// following symlinks.
pub fn set_mtime(path: &Path, secs: i64, nanos: i64) -> Result<()> {
    let time = TimeSpec::new(secs as _, nanos as _);
    utimensat(None, path, &time, &time, UtimensatFlags::NoFollowSymlink)
        .map_err(io::Error::from)?;
    Ok(())
}

/// Remove whatever is at `path` (file, symlink or directory tree).
pub fn remove_any(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove the contents of a directory, keeping the directory itself.
pub fn clear_dir(path: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(path)? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_plain() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "/usr/bin/env").unwrap(),
            root.path().join("usr/bin/env")
        );
    }

    #[test]
    fn test_resolve_absolute_symlink_stays_in_root() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("usr/lib")).unwrap();
        symlink("/usr/lib", root.path().join("lib")).unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "/lib/libc.so").unwrap(),
            root.path().join("usr/lib/libc.so")
        );
    }

    #[test]
    fn test_resolve_relative_symlink() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("usr/lib")).unwrap();
        symlink("usr/lib", root.path().join("lib64")).unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "lib64/x").unwrap(),
            root.path().join("usr/lib/x")
        );
    }

    #[test]
    fn test_resolve_dotdot_clamped_at_root() {
        let root = TempDir::new().unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "/../../etc/passwd").unwrap(),
            root.path().join("etc/passwd")
        );
        symlink("../../../../etc", root.path().join("escape")).unwrap();
        assert_eq!(
            resolve_in_root(root.path(), "/escape/shadow").unwrap(),
            root.path().join("etc/shadow")
        );
    }

    #[test]
    fn test_resolve_symlink_loop() {
        let root = TempDir::new().unwrap();
        symlink("/b", root.path().join("a")).unwrap();
        symlink("/a", root.path().join("b")).unwrap();
        assert!(resolve_in_root(root.path(), "/a/x").is_err());
    }

    #[test]
    fn test_resolve_parent_keeps_final_symlink() {
        let root = TempDir::new().unwrap();
        symlink("/target", root.path().join("link")).unwrap();
        assert_eq!(
            resolve_parent_in_root(root.path(), "/link").unwrap(),
            root.path().join("link")
        );
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a/./b/../c/"), "/a/c");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/../x"), "/x");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/data", "/data"));
        assert!(is_within("/data/x", "/data"));
        assert!(!is_within("/database", "/data"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_set_mtime_nanos() {
        use std::os::unix::fs::MetadataExt;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        set_mtime(&file, 1_700_000_000, 123_456_789).unwrap();
        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.mtime(), 1_700_000_000);
        assert_eq!(meta.mtime_nsec(), 123_456_789);
    }

    #[test]
    fn test_set_mtime_leaves_symlink_target() {
        use std::os::unix::fs::MetadataExt;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("target");
        std::fs::write(&file, b"x").unwrap();
        set_mtime(&file, 1_600_000_000, 0).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();

        set_mtime(&link, 1_700_000_000, 5).unwrap();
        let link_meta = std::fs::symlink_metadata(&link).unwrap();
        assert_eq!(link_meta.mtime(), 1_700_000_000);
        assert_eq!(link_meta.mtime_nsec(), 5);
        assert_eq!(std::fs::metadata(&file).unwrap().mtime(), 1_600_000_000);

        let err = set_mtime(&dir.path().join("missing"), 0, 0).unwrap_err();
        assert!(matches!(err, BuildError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_remove_any_and_clear_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("d/sub")).unwrap();
        std::fs::write(dir.path().join("d/f"), b"x").unwrap();
        clear_dir(&dir.path().join("d")).unwrap();
        assert!(dir.path().join("d").is_dir());
        assert_eq!(std::fs::read_dir(dir.path().join("d")).unwrap().count(), 0);
        remove_any(&dir.path().join("d")).unwrap();
        remove_any(&dir.path().join("d")).unwrap();
        assert!(!dir.path().join("d").exists());
    }
}
