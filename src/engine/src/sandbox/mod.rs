//! Sandboxed execution of RUN commands.
//!
//! [`Sandbox`] owns the chosen [`ExecRuntime`]. Before a command starts it
//! creates whatever mountpoints the root lacks (`/proc`, `/dev`, `/sys` and
//! transient mount destinations) and removes them again afterwards, so the
//! layer store never sees them in a diff.

pub mod chroot;
pub mod journal;
pub mod oci;
pub mod process;
pub mod runtime;
pub mod user;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::config::{EngineConfig, RuntimeConfig};
use kiln_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use chroot::ChrootRuntime;
pub use journal::MountJournal;
pub use oci::OciRuntime;
pub use runtime::{ExecResult, ExecRuntime, ExecSpec, NetworkMode, TransientMount};
pub use user::ResolvedUser;

use crate::fsutil;

/// Mountpoints every runtime mounts over.
const SYSTEM_MOUNTPOINTS: &[&str] = &["/proc", "/dev", "/sys"];

pub struct Sandbox {
    runtime: Arc<dyn ExecRuntime>,
    journal: MountJournal,
}

impl Sandbox {
    /// Open the sandbox state under `root` and sweep mountpoints left by an
    /// interrupted process.
    pub fn init(root: &Path, runtime: Arc<dyn ExecRuntime>) -> Result<Self> {
        let journal = MountJournal::open(&root.join("run"))?;
        journal.sweep()?;
        Ok(Self { runtime, journal })
    }

    /// Sandbox with the runtime named by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let journal = MountJournal::open(&config.root.join("run"))?;
        let runtime: Arc<dyn ExecRuntime> = match &config.runtime {
            RuntimeConfig::Chroot => Arc::new(ChrootRuntime::new()),
            RuntimeConfig::Oci { binary } => {
                Arc::new(OciRuntime::new(binary.clone(), &journal.bundles_dir()))
            }
        };
        journal.sweep()?;
        Ok(Self { runtime, journal })
    }

    pub fn runtime(&self) -> &Arc<dyn ExecRuntime> {
        &self.runtime
    }

    /// Run one command with `rootfs` as its root.
    pub async fn run(
        &self,
        rootfs: &Path,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let scaffold = self.prepare(rootfs, spec)?;
        let result = self.runtime.exec(rootfs, spec, cancel).await;
        scaffold.release()?;
        result
    }

    /// Create missing mountpoints, journaled before they exist.
    fn prepare(&self, rootfs: &Path, spec: &ExecSpec) -> Result<Scaffold<'_>> {
        let mut wanted: Vec<(PathBuf, bool)> = Vec::new();
        for dir in SYSTEM_MOUNTPOINTS {
            wanted.push((fsutil::resolve_in_root(rootfs, dir)?, true));
        }
        for mount in &spec.mounts {
            let meta = std::fs::metadata(&mount.source).map_err(|e| {
                BuildError::MountFailed(format!("{}: {}", mount.source.display(), e))
            })?;
            wanted.push((
                fsutil::resolve_in_root(rootfs, &mount.destination)?,
                meta.is_dir(),
            ));
        }
        let workdir = fsutil::resolve_in_root(rootfs, &spec.working_dir)?;
        wanted.push((workdir, true));

        let mut created: Vec<PathBuf> = Vec::new();
        let mut plan: Vec<(PathBuf, bool)> = Vec::new();
        for (path, is_dir) in wanted {
            let mut missing: Vec<PathBuf> = path
                .ancestors()
                .take_while(|p| *p != rootfs && !p.exists())
                .map(Path::to_path_buf)
                .filter(|p| !created.contains(p))
                .collect();
            missing.reverse();
            for p in missing {
                let dir = is_dir || p != path;
                created.push(p.clone());
                plan.push((p, dir));
            }
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        self.journal.record(&id, &created)?;
        let scaffold = Scaffold {
            journal: &self.journal,
            id,
            created,
            released: false,
        };
        for (path, is_dir) in &plan {
            let result = if *is_dir {
                std::fs::create_dir(path)
            } else {
                std::fs::File::create(path).map(|_| ())
            };
            result.map_err(|e| {
                BuildError::MountFailed(format!("mountpoint {}: {}", path.display(), e))
            })?;
        }
        if !plan.is_empty() {
            debug!(count = plan.len(), "Created mountpoints");
        }
        Ok(scaffold)
    }
}

/// Mountpoints created for one command; removed on release or drop.
struct Scaffold<'a> {
    journal: &'a MountJournal,
    id: String,
    created: Vec<PathBuf>,
    released: bool,
}

impl Scaffold<'_> {
    fn release(mut self) -> Result<()> {
        self.released = true;
        journal::remove_created(&self.created);
        self.journal.complete(&self.id)
    }
}

impl Drop for Scaffold<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        journal::remove_created(&self.created);
        if let Err(e) = self.journal.complete(&self.id) {
            warn!(error = %e, "Failed to update mount journal");
        }
    }
}
