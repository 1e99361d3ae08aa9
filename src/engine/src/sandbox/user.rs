//! USER resolution against the image's own `/etc/passwd` and `/etc/group`.

use std::path::Path;

use kiln_core::error::{BuildError, Result};

use crate::fsutil;

/// Numeric identity a command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub home: Option<String>,
}

impl ResolvedUser {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            additional_gids: Vec::new(),
            home: Some("/root".to_string()),
        }
    }
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

/// Resolve `user` (`name`, `uid`, `name:group`, `uid:gid`, or empty for
/// root) inside `root`.
pub fn resolve(root: &Path, user: &str) -> Result<ResolvedUser> {
    if user.is_empty() {
        return Ok(ResolvedUser::root());
    }
    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let passwd = read_passwd(root)?;
    let groups = read_groups(root)?;

    let entry = match user_part.parse::<u32>() {
        Ok(uid) => passwd.iter().find(|e| e.uid == uid),
        Err(_) => passwd.iter().find(|e| e.name == user_part),
    };
    let (uid, primary_gid, name, home) = match (entry, user_part.parse::<u32>()) {
        (Some(e), _) => (e.uid, e.gid, Some(e.name.clone()), Some(e.home.clone())),
        (None, Ok(uid)) => (uid, 0, None, None),
        (None, Err(_)) => {
            return Err(BuildError::RuntimeUnavailable(format!(
                "unable to find user {}: no matching entries in passwd file",
                user_part
            )))
        }
    };

    let gid = match group_part {
        None | Some("") => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => groups
                .iter()
                .find(|g| g.name == group)
                .map(|g| g.gid)
                .ok_or_else(|| {
                    BuildError::RuntimeUnavailable(format!(
                        "unable to find group {}: no matching entries in group file",
                        group
                    ))
                })?,
        },
    };

    // Supplementary groups apply only when the group was not forced.
    let additional_gids = match (&name, group_part) {
        (Some(name), None) => groups
            .iter()
            .filter(|g| g.gid != gid && g.members.iter().any(|m| m == name))
            .map(|g| g.gid)
            .collect(),
        _ => Vec::new(),
    };

    Ok(ResolvedUser {
        uid,
        gid,
        additional_gids,
        home,
    })
}

fn read_in_root(root: &Path, path: &str) -> Result<Option<String>> {
    let host = fsutil::resolve_in_root(root, path)?;
    match std::fs::read_to_string(&host) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_passwd(root: &Path) -> Result<Vec<PasswdEntry>> {
    let Some(content) = read_in_root(root, "/etc/passwd")? else {
        return Ok(Vec::new());
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect())
}

fn read_groups(root: &Path) -> Result<Vec<GroupEntry>> {
    let Some(content) = read_in_root(root, "/etc/group")? else {
        return Ok(Vec::new());
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members: fields
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect())
}
