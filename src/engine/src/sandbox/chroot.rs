//! In-process runtime: private mount namespace plus chroot.
//!
//! The child unshares its mount namespace (and network/UTS namespaces when
//! asked), bind-mounts the transient mounts, mounts `/proc`, a tmpfs `/dev`
//! populated with the usual device nodes and a read-only `/sys`, chroots
//! into the root and drops to the requested user. Everything it mounts
//! disappears with the namespace when the command exits.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, close, mkdir, setgid, setgroups, sethostname, setuid, Gid, Uid};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::process::{spawn_failure, supervise};
use super::runtime::{ExecResult, ExecRuntime, ExecSpec, NetworkMode};
use crate::fsutil;

const DEV_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

const DEV_LINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "fd"),
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
];

#[derive(Debug, Default)]
pub struct ChrootRuntime;

impl ChrootRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecRuntime for ChrootRuntime {
    fn name(&self) -> &str {
        "chroot"
    }

    async fn check(&self) -> Result<()> {
        if !fsutil::is_root_user() {
            return Err(BuildError::RuntimeUnavailable(
                "the chroot runtime needs root privileges".to_string(),
            ));
        }
        Ok(())
    }

    async fn exec(
        &self,
        root: &Path,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        self.check().await?;
        let argv = spec.command_line();
        let Some(program) = argv.first().cloned() else {
            return Err(BuildError::ScriptInvalid("empty command".to_string()));
        };
        let setup = ChildSetup::prepare(root, spec)?;
        debug!(root = %root.display(), argv = ?argv, uid = spec.user.uid, "Starting command in chroot");

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&argv[1..])
            .env_clear()
            .envs(spec.env.iter().filter_map(|e| e.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: the hook only issues syscalls on data prepared before the
        // fork and does not allocate.
        unsafe {
            command.pre_exec(move || setup.enter());
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failure(&program, e),
        };
        supervise(child, spec.timeout, spec.kill_grace, cancel).await
    }
}

struct Bind {
    source: PathBuf,
    target: PathBuf,
    read_only: bool,
}

/// Everything the child needs, resolved in the parent.
struct ChildSetup {
    root: PathBuf,
    flags: CloneFlags,
    binds: Vec<Bind>,
    proc_dir: PathBuf,
    dev_dir: PathBuf,
    sys_dir: PathBuf,
    dev_nodes: Vec<(PathBuf, PathBuf)>,
    dev_links: Vec<(CString, CString)>,
    shm_dir: PathBuf,
    hostname: Option<String>,
    workdir: PathBuf,
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

impl ChildSetup {
    fn prepare(root: &Path, spec: &ExecSpec) -> Result<Self> {
        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC;
        if spec.network == NetworkMode::Disabled {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if spec.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        let mut binds = Vec::new();
        for m in &spec.mounts {
            binds.push(Bind {
                source: std::fs::canonicalize(&m.source).map_err(|e| {
                    BuildError::MountFailed(format!("{}: {}", m.source.display(), e))
                })?,
                target: fsutil::resolve_in_root(root, &m.destination)?,
                read_only: m.read_only(),
            });
        }
        // Name resolution for commands with network access; only mounted
        // over a file the image already has.
        let resolv = fsutil::resolve_in_root(root, "/etc/resolv.conf")?;
        if spec.network == NetworkMode::Enabled && resolv.is_file() {
            binds.push(Bind {
                source: PathBuf::from("/etc/resolv.conf"),
                target: resolv,
                read_only: true,
            });
        }

        let dev_dir = fsutil::resolve_in_root(root, "/dev")?;
        let dev_nodes = DEV_NODES
            .iter()
            .map(|n| (Path::new("/dev").join(n), dev_dir.join(n)))
            .filter(|(host, _)| host.exists())
            .collect();
        let mut dev_links = Vec::new();
        for (target, name) in DEV_LINKS {
            dev_links.push((c_path(Path::new(target))?, c_path(&dev_dir.join(name))?));
        }

        let mut groups: Vec<Gid> = vec![Gid::from_raw(spec.user.gid)];
        groups.extend(spec.user.additional_gids.iter().map(|g| Gid::from_raw(*g)));

        Ok(Self {
            root: root.to_path_buf(),
            flags,
            binds,
            proc_dir: fsutil::resolve_in_root(root, "/proc")?,
            sys_dir: fsutil::resolve_in_root(root, "/sys")?,
            shm_dir: dev_dir.join("shm"),
            dev_dir,
            dev_nodes,
            dev_links,
            hostname: spec.hostname.clone(),
            workdir: PathBuf::from(&spec.working_dir),
            uid: Uid::from_raw(spec.user.uid),
            gid: Gid::from_raw(spec.user.gid),
            groups,
        })
    }

    /// Runs in the forked child before exec.
    fn enter(&self) -> std::io::Result<()> {
        unshare(self.flags)?;
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;

        for bind in &self.binds {
            mount(
                Some(&bind.source),
                &bind.target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )?;
            if bind.read_only {
                mount(
                    None::<&str>,
                    &bind.target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )?;
            }
        }

        mount(
            Some("proc"),
            &self.proc_dir,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        )?;
        mount(
            Some("tmpfs"),
            &self.dev_dir,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
        )?;
        for (host, target) in &self.dev_nodes {
            let fd = open(
                target,
                OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                Mode::from_bits_truncate(0o666),
            )?;
            close(fd)?;
            mount(
                Some(host),
                target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
        }
        for (target, link) in &self.dev_links {
            // SAFETY: both pointers come from live CStrings.
            if unsafe { libc::symlink(target.as_ptr(), link.as_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        mkdir(&self.shm_dir, Mode::from_bits_truncate(0o1777))?;
        // sysfs is optional; a private network namespace may refuse it.
        let _ = mount(
            Some("sysfs"),
            &self.sys_dir,
            Some("sysfs"),
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        );

        if let Some(hostname) = &self.hostname {
            sethostname(hostname)?;
        }

        chroot(&self.root)?;
        chdir(&self.workdir)?;
        setgroups(&self.groups)?;
        setgid(self.gid)?;
        setuid(self.uid)?;
        Ok(())
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        BuildError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    })
}
