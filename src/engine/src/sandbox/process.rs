//! Child process supervision shared by the runtimes: output capture,
//! deadline with escalating signals, cancellation.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use kiln_core::error::{BuildError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::runtime::ExecResult;

/// Bytes of stdout and stderr kept per command (the tail).
pub const OUTPUT_LIMIT: usize = 1 << 20;

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Wait for `child`, killing it when `timeout` passes or `cancel` fires.
pub async fn supervise(
    mut child: Child,
    timeout: Option<Duration>,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<ExecResult> {
    let stdout = tokio::spawn(read_tail(child.stdout.take()));
    let stderr = tokio::spawn(read_tail(child.stderr.take()));

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status?),
        _ = &mut deadline => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    let status = match outcome {
        Outcome::Exited(status) => status,
        Outcome::TimedOut => {
            warn!(timeout = ?timeout, "Command exceeded its deadline, terminating");
            let status = terminate(&mut child, grace).await?;
            return Err(BuildError::Killed {
                signal: status.signal().unwrap_or(libc::SIGKILL),
            });
        }
        Outcome::Cancelled => {
            debug!("Cancellation requested, terminating command");
            terminate(&mut child, grace).await?;
            return Err(BuildError::Cancelled);
        }
    };

    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();

    if let Some(signal) = status.signal() {
        return Err(BuildError::Killed { signal });
    }
    Ok(ExecResult {
        exit_status: status.code().unwrap_or(1),
        stdout,
        stderr,
    })
}

/// SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!(grace = ?grace, "Command ignored SIGTERM, sending SIGKILL");
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}

async fn read_tail<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                if out.len() > OUTPUT_LIMIT {
                    let excess = out.len() - OUTPUT_LIMIT;
                    out.drain(..excess);
                }
            }
        }
    }
    out
}

/// A spawn failure reported the way a shell would: 127 when the program
/// does not exist, 126 when it cannot be executed.
pub fn spawn_failure(program: &str, err: std::io::Error) -> Result<ExecResult> {
    let exit_status = match err.kind() {
        std::io::ErrorKind::NotFound => 127,
        std::io::ErrorKind::PermissionDenied => 126,
        _ => {
            return Err(BuildError::RuntimeUnavailable(format!(
                "failed to start {}: {}",
                program, err
            )))
        }
    };
    Ok(ExecResult {
        exit_status,
        stdout: Vec::new(),
        stderr: format!("{}: {}\n", program, err).into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_status_and_output() {
        let token = CancellationToken::new();
        let result = supervise(sh("echo out; echo err >&2; exit 3"), None, Duration::from_secs(1), &token)
            .await
            .unwrap();
        assert_eq!(result.exit_status, 3);
        assert_eq!(result.stdout, b"out\n");
        assert_eq!(result.stderr, b"err\n");
    }

    #[tokio::test]
    async fn test_deadline_kills() {
        let token = CancellationToken::new();
        let err = supervise(
            sh("sleep 30"),
            Some(Duration::from_millis(100)),
            Duration::from_millis(100),
            &token,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::Killed { .. }));
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates() {
        let token = CancellationToken::new();
        let err = supervise(
            sh("trap '' TERM; sleep 30"),
            Some(Duration::from_millis(100)),
            Duration::from_millis(200),
            &token,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::Killed { signal } if signal == libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_cancel() {
        let token = CancellationToken::new();
        let child = sh("sleep 30");
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = supervise(child, None, Duration::from_secs(1), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
    }

    #[test]
    fn test_spawn_failure_codes() {
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(spawn_failure("x", not_found).unwrap().exit_status, 127);
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(spawn_failure("x", denied).unwrap().exit_status, 126);
        let other = std::io::Error::from(std::io::ErrorKind::Other);
        assert!(spawn_failure("x", other).is_err());
    }
}
