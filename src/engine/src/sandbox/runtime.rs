//! Runtime abstraction for RUN commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use super::user::ResolvedUser;

/// Whether the command gets network access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Share the host network
    #[default]
    Enabled,
    /// Private, empty network namespace
    Disabled,
}

/// A bind mount present only while a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientMount {
    pub source: PathBuf,
    /// Absolute path inside the container
    pub destination: String,
    pub options: Vec<String>,
}

impl TransientMount {
    /// Parse `host:container[:opt,opt]`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let destination = parts.next().unwrap_or_default();
        if source.is_empty() || destination.is_empty() {
            return Err(BuildError::Usage(format!(
                "invalid volume '{}': expected host:container[:options]",
                s
            )));
        }
        if !destination.starts_with('/') {
            return Err(BuildError::Usage(format!(
                "invalid volume '{}': container path must be absolute",
                s
            )));
        }
        let options: Vec<String> = parts
            .next()
            .map(|o| {
                o.split(',')
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for option in &options {
            if !matches!(option.as_str(), "ro" | "rw" | "z" | "Z") {
                return Err(BuildError::Usage(format!(
                    "invalid volume '{}': unknown option '{}'",
                    s, option
                )));
            }
        }
        Ok(Self {
            source: PathBuf::from(source),
            destination: destination.to_string(),
            options,
        })
    }

    pub fn read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Everything a runtime needs to start one command.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    /// Prepended to `argv` when set
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    pub user: ResolvedUser,
    pub working_dir: String,
    pub mounts: Vec<TransientMount>,
    pub network: NetworkMode,
    pub hostname: Option<String>,
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL when the deadline passes
    pub kill_grace: Duration,
}

impl ExecSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            entrypoint: None,
            env: Vec::new(),
            user: ResolvedUser::root(),
            working_dir: "/".to_string(),
            mounts: Vec::new(),
            network: NetworkMode::Enabled,
            hostname: None,
            timeout: None,
            kill_grace: Duration::from_secs(10),
        }
    }

    /// The full command line, entrypoint first.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = self.entrypoint.clone().unwrap_or_default();
        argv.extend(self.argv.iter().cloned());
        argv
    }
}

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs a command with a prepared root filesystem.
///
/// The root is writable and its changes are kept; mounts the runtime adds
/// must not leave anything behind in it.
#[async_trait]
pub trait ExecRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with [`BuildError::RuntimeUnavailable`] when the runtime cannot
    /// be used on this host.
    async fn check(&self) -> Result<()>;

    /// Run `spec` with `root` as `/`. A nonzero exit is an `Ok` result;
    /// death by signal is [`BuildError::Killed`].
    async fn exec(
        &self,
        root: &Path,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecResult>;
}
