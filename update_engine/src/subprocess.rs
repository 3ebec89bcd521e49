//! Scoped supervision of helper tools: spawn, capture output, and enforce a
//! hard deadline with a SIGTERM-then-SIGKILL escalation.

use crate::error::{self, Result};
use log::warn;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// How long a child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs a command to completion with a hard timeout, capturing its output.
/// On timeout the child receives SIGTERM, then SIGKILL after a grace
/// period, and an error is returned; the child never outlives this call.
pub async fn run<P, I, S>(program: P, args: I, limit: Duration) -> Result<Output>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let program = program.as_ref().to_path_buf();
    let mut child = Command::new(&program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context(error::SubprocessSpawnSnafu { command: &program })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let capture = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let out = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            stdout
        };
        let err = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            stderr
        };
        tokio::join!(out, err)
    };

    let run = async {
        let ((stdout, stderr), status) = tokio::join!(capture, child.wait());
        (stdout, stderr, status)
    };

    match timeout(limit, run).await {
        Ok((stdout, stderr, status)) => {
            let status = status.context(error::SubprocessWaitSnafu { command: &program })?;
            Ok(Output {
                status,
                stdout,
                stderr,
            })
        }
        Err(_) => {
            shut_down(&mut child, &program).await;
            error::SubprocessTimeoutSnafu {
                command: program,
                seconds: limit.as_secs(),
            }
            .fail()
        }
    }
}

/// Like [`run`], but a non-zero exit becomes an error carrying the child's
/// stderr.
pub async fn run_checked<P, I, S>(program: P, args: I, limit: Duration) -> Result<Output>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let program_path: PathBuf = program.as_ref().to_path_buf();
    let output = run(&program_path, args, limit).await?;
    snafu::ensure!(
        output.status.success(),
        error::SubprocessFailedSnafu {
            command: program_path,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    );
    Ok(output)
}

async fn shut_down(child: &mut Child, program: &Path) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(
            "{} ignored SIGTERM for {}s, killing",
            program.display(),
            KILL_GRACE.as_secs()
        );
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_status() {
        let output = run(
            "/bin/sh",
            ["-c", "echo out; echo err >&2; exit 3"],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
    }

    #[tokio::test]
    async fn run_checked_reports_stderr() {
        let err = run_checked(
            "/bin/sh",
            ["-c", "echo boom >&2; exit 1"],
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boom"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let started = std::time::Instant::now();
        let err = run("/bin/sleep", ["30"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::SubprocessTimeout { .. }
        ));
        // SIGTERM is enough for sleep; the grace period must not elapse.
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run(
            "/does/not/exist",
            Vec::<&str>::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::SubprocessSpawn { .. }));
    }
}
