//! Journal of mountpoints created inside root filesystems.
//!
//! Mountpoints that the sandbox creates for a command are written here
//! before they exist and dropped once they are removed again. Entries left
//! by a process that died are swept when the next sandbox starts.
//!
//! ```text
//! <root>/run/mounts.json    [{"id": "...", "pid": 123, "created": [...]}]
//! <root>/run/bundles/<id>/  OCI runtime bundles
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use kiln_core::error::Result;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "mounts.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    id: String,
    pid: u32,
    /// Host paths in creation order
    created: Vec<PathBuf>,
}

pub struct MountJournal {
    run_dir: PathBuf,
    lock: Mutex<()>,
}

impl MountJournal {
    pub fn open(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir.join("bundles"))?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.run_dir.join("bundles")
    }

    fn path(&self) -> PathBuf {
        self.run_dir.join(JOURNAL_FILE)
    }

    fn load(&self) -> Vec<JournalEntry> {
        match fs::read(self.path()) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable mount journal");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    fn save(&self, entries: &[JournalEntry]) -> Result<()> {
        let tmp = self.path().with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, self.path())?;
        Ok(())
    }

    /// Note paths about to be created for command `id`.
    pub fn record(&self, id: &str, created: &[PathBuf]) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load();
        entries.retain(|e| e.id != id);
        entries.push(JournalEntry {
            id: id.to_string(),
            pid: std::process::id(),
            created: created.to_vec(),
        });
        self.save(&entries)
    }

    /// Forget command `id` once its mountpoints are gone.
    pub fn complete(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.load();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() != before {
            self.save(&entries)?;
        }
        Ok(())
    }

    /// Remove mountpoints and bundles left behind by dead processes.
    pub fn sweep(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        let entries = self.load();
        let mut kept = Vec::new();
        let mut swept = 0;
        for entry in entries {
            if entry.pid != std::process::id() && process_alive(entry.pid) {
                kept.push(entry);
                continue;
            }
            remove_created(&entry.created);
            swept += 1;
        }
        self.save(&kept)?;

        let live: Vec<&str> = kept.iter().map(|e| e.id.as_str()).collect();
        if let Ok(bundles) = fs::read_dir(self.bundles_dir()) {
            for bundle in bundles.flatten() {
                let name = bundle.file_name().to_string_lossy().into_owned();
                if !live.contains(&name.as_str()) {
                    if let Err(e) = fs::remove_dir_all(bundle.path()) {
                        warn!(bundle = %name, error = %e, "Failed to remove stale bundle");
                    }
                }
            }
        }
        if swept > 0 {
            info!(count = swept, "Swept mountpoints from interrupted commands");
        }
        Ok(swept)
    }
}

/// Remove paths in reverse creation order. Only empty directories and
/// empty files are removed, so nothing written by a command is lost.
pub(crate) fn remove_created(created: &[PathBuf]) {
    for path in created.iter().rev() {
        let Ok(meta) = fs::symlink_metadata(path) else {
            continue;
        };
        let result = if meta.is_dir() {
            fs::remove_dir(path)
        } else if meta.len() == 0 {
            fs::remove_file(path)
        } else {
            Ok(())
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "Removed mountpoint"),
            Err(e) => warn!(path = %path.display(), error = %e, "Mountpoint not removed"),
        }
    }
}

fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
