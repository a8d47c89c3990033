//! Bounded-timeout subprocess runner.
//!
//! All external commands (networksetup, scutil, launchctl, ...) go through
//! [`run`]: explicit argv, never a shell, mandatory deadline, captured
//! stdout/stderr decoded with lossy UTF-8 so invalid bytes can never panic a
//! caller. A timed-out child is killed; the result carries exit code 124 and
//! whatever output was captured before the deadline.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{MacblockError, Result};

/// Exit code reported for a timed-out child, matching timeout(1).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs `program` with `args`, waiting at most `timeout`.
///
/// # Errors
///
/// Only spawn failures (missing binary, EPERM) error; a nonzero exit or a
/// timeout is a normal [`RunResult`].
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<RunResult> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| MacblockError::transient(format!("failed to spawn {program}: {e}")))?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    let wait = async {
        let _ = tokio::join!(
            stdout_pipe.read_to_end(&mut out_buf),
            stderr_pipe.read_to_end(&mut err_buf),
        );
        child.wait().await
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(status) => {
            let status = status
                .map_err(|e| MacblockError::transient(format!("waiting on {program}: {e}")))?;
            Ok(RunResult {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out_buf).into_owned(),
                stderr: String::from_utf8_lossy(&err_buf).into_owned(),
                timed_out: false,
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let mut stderr = String::from_utf8_lossy(&err_buf).into_owned();
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("({program} timed out after {}s)", timeout.as_secs()));
            Ok(RunResult {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::from_utf8_lossy(&out_buf).into_owned(),
                stderr,
                timed_out: true,
            })
        }
    }
}

/// Default deadline for quick system tools.
pub fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let r = run("/bin/echo", &["hello"], default_timeout()).await.unwrap();
        assert!(r.success());
        assert_eq!(r.stdout, "hello\n");
        assert_eq!(r.stderr, "");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let r = run("/bin/sh", &["-c", "exit 3"], default_timeout()).await.unwrap();
        assert!(!r.success());
        assert_eq!(r.exit_code, 3);
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_124() {
        let r = run("/bin/sleep", &["30"], Duration::from_millis(100)).await.unwrap();
        assert!(r.timed_out);
        assert_eq!(r.exit_code, TIMEOUT_EXIT_CODE);
        assert!(r.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_lossy_decoding_never_fails() {
        let r = run("/usr/bin/printf", &["ab\\xff\\xfecd"], default_timeout())
            .await
            .unwrap();
        assert!(r.success());
        assert!(r.stdout.starts_with("ab"));
        assert!(r.stdout.ends_with("cd"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let err = run("/nonexistent/bin/x", &[], default_timeout()).await;
        assert!(err.is_err());
    }
}
