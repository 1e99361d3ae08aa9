//! External OCI runtime (runc, crun) driven through a generated bundle.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};
use oci_spec::runtime::{
    LinuxNamespaceType, Mount, MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder,
    UserBuilder,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::process::{spawn_failure, supervise};
use super::runtime::{ExecResult, ExecRuntime, ExecSpec, NetworkMode};

pub struct OciRuntime {
    binary: String,
    bundles_dir: PathBuf,
}

impl OciRuntime {
    pub fn new(binary: impl Into<String>, bundles_dir: &Path) -> Self {
        Self {
            binary: binary.into(),
            bundles_dir: bundles_dir.to_path_buf(),
        }
    }

    fn find_binary(&self) -> Option<PathBuf> {
        let candidate = Path::new(&self.binary);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.binary))
            .find(|p| p.is_file())
    }
}

#[async_trait]
impl ExecRuntime for OciRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn check(&self) -> Result<()> {
        match self.find_binary() {
            Some(_) => Ok(()),
            None => Err(BuildError::RuntimeUnavailable(format!(
                "OCI runtime '{}' not found in PATH",
                self.binary
            ))),
        }
    }

    async fn exec(
        &self,
        root: &Path,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        self.check().await?;
        if spec.command_line().is_empty() {
            return Err(BuildError::ScriptInvalid("empty command".to_string()));
        }
        let id = format!("kiln-{}", uuid::Uuid::new_v4().simple());
        let bundle = self.bundles_dir.join(&id);
        std::fs::create_dir_all(&bundle)?;
        let _cleanup = BundleGuard {
            binary: self.binary.clone(),
            id: id.clone(),
            dir: bundle.clone(),
        };

        let config = bundle_spec(root, spec)?;
        config
            .save(bundle.join("config.json"))
            .map_err(|e| BuildError::Serialization(format!("runtime config: {}", e)))?;
        debug!(runtime = %self.binary, bundle = %bundle.display(), "Starting command in OCI runtime");

        let child = Command::new(&self.binary)
            .arg("run")
            .arg("--bundle")
            .arg(&bundle)
            .arg(&id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return spawn_failure(&self.binary, e),
        };
        supervise(child, spec.timeout, spec.kill_grace, cancel).await
    }
}

/// Deletes the container and its bundle directory.
struct BundleGuard {
    binary: String,
    id: String,
    dir: PathBuf,
}

impl Drop for BundleGuard {
    fn drop(&mut self) {
        let status = std::process::Command::new(&self.binary)
            .args(["delete", "--force", &self.id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            debug!(container = %self.id, error = %e, "Runtime delete failed");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(bundle = %self.dir.display(), error = %e, "Failed to remove bundle");
        }
    }
}

/// Runtime configuration for `spec` with `root` as the root filesystem.
/// Starts from the runtime-spec defaults (namespaces, capabilities, masked
/// paths) and fills in the command.
pub fn bundle_spec(root: &Path, spec: &ExecSpec) -> Result<Spec> {
    let defaults = Spec::default();

    let user = UserBuilder::default()
        .uid(spec.user.uid)
        .gid(spec.user.gid)
        .additional_gids(spec.user.additional_gids.clone())
        .build()
        .map_err(spec_error)?;
    let mut process = ProcessBuilder::default()
        .terminal(false)
        .user(user)
        .args(spec.command_line())
        .env(spec.env.clone())
        .cwd(spec.working_dir.clone())
        .no_new_privileges(true);
    if let Some(caps) = defaults.process().as_ref().and_then(|p| p.capabilities().clone()) {
        process = process.capabilities(caps);
    }
    let process = process.build().map_err(spec_error)?;

    let root = RootBuilder::default()
        .path(root.to_path_buf())
        .readonly(false)
        .build()
        .map_err(spec_error)?;

    let mut mounts: Vec<Mount> = defaults.mounts().clone().unwrap_or_default();
    for m in &spec.mounts {
        let mode = if m.read_only() { "ro" } else { "rw" };
        mounts.push(
            MountBuilder::default()
                .destination(PathBuf::from(&m.destination))
                .typ("bind")
                .source(m.source.clone())
                .options(vec!["rbind".to_string(), mode.to_string()])
                .build()
                .map_err(spec_error)?,
        );
    }

    let mut linux = defaults.linux().clone().unwrap_or_default();
    if let Some(namespaces) = linux.namespaces().clone() {
        let keep = namespaces
            .into_iter()
            .filter(|ns| match ns.typ() {
                LinuxNamespaceType::Network => spec.network == NetworkMode::Disabled,
                LinuxNamespaceType::Uts => spec.hostname.is_some(),
                _ => true,
            })
            .collect();
        linux.set_namespaces(Some(keep));
    }

    let mut builder = SpecBuilder::default()
        .version(defaults.version().clone())
        .root(root)
        .process(process)
        .mounts(mounts)
        .linux(linux);
    if let Some(hostname) = &spec.hostname {
        builder = builder.hostname(hostname.clone());
    }
    builder.build().map_err(spec_error)
}

fn spec_error(e: impl std::fmt::Display) -> BuildError {
    BuildError::RuntimeUnavailable(format!("invalid runtime config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::runtime::TransientMount;
    use crate::sandbox::user::ResolvedUser;

    fn exec_spec() -> ExecSpec {
        let mut spec = ExecSpec::new(vec!["/bin/sh".into(), "-c".into(), "make".into()]);
        spec.env = vec!["PATH=/usr/bin:/bin".into()];
        spec.working_dir = "/src".into();
        spec.user = ResolvedUser {
            uid: 1000,
            gid: 1000,
            additional_gids: vec![10],
            home: None,
        };
        spec
    }

    #[test]
    fn test_bundle_spec_process() {
        let spec = bundle_spec(Path::new("/var/lib/kiln/mounts/x"), &exec_spec()).unwrap();
        let process = spec.process().as_ref().unwrap();
        assert_eq!(
            process.args().as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "make".to_string()]
        );
        assert_eq!(process.cwd(), &PathBuf::from("/src"));
        assert_eq!(process.user().uid(), 1000);
        assert_eq!(
            spec.root().as_ref().unwrap().path(),
            &PathBuf::from("/var/lib/kiln/mounts/x")
        );
    }

    #[test]
    fn test_bundle_spec_network_namespace() {
        let has_netns = |spec: &Spec| {
            spec.linux()
                .as_ref()
                .and_then(|l| l.namespaces().clone())
                .unwrap_or_default()
                .iter()
                .any(|ns| ns.typ() == LinuxNamespaceType::Network)
        };
        let mut exec = exec_spec();
        assert!(!has_netns(&bundle_spec(Path::new("/r"), &exec).unwrap()));
        exec.network = NetworkMode::Disabled;
        assert!(has_netns(&bundle_spec(Path::new("/r"), &exec).unwrap()));
    }

    #[test]
    fn test_bundle_spec_transient_mounts() {
        let mut exec = exec_spec();
        exec.mounts.push(TransientMount {
            source: PathBuf::from("/srv/cache"),
            destination: "/cache".into(),
            options: vec!["ro".into()],
        });
        let spec = bundle_spec(Path::new("/r"), &exec).unwrap();
        let mount = spec
            .mounts()
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.destination() == &PathBuf::from("/cache"))
            .unwrap();
        assert!(mount.options().as_ref().unwrap().contains(&"ro".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = OciRuntime::new("kiln-no-such-runtime", dir.path());
        assert!(matches!(
            runtime.check().await,
            Err(BuildError::RuntimeUnavailable(_))
        ));
    }
}
