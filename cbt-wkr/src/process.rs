//! Bounded child processes.

use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// How a bounded child process ended.
#[derive(Debug)]
pub enum Finished {
    Exited(Output),
    TimedOut,
}

/// Run `command` to completion with captured output, killing it once
/// `limit` has elapsed. Errors only when the process cannot be launched.
pub async fn run_captured(mut command: Command, limit: Duration) -> std::io::Result<Finished> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command.spawn()?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => Ok(Finished::Exited(output?)),
        Err(_) => Ok(Finished::TimedOut),
    }
}

/// Like [`run_captured`] but the child writes to the runner's own
/// stdout/stderr. Used for long builds whose output is not kept.
pub async fn run_inherited(
    mut command: Command,
    limit: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    let mut child = command.spawn()?;

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => Ok(Some(status?)),
        Err(_) => Ok(None),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn test_captures_output() {
        match run_captured(sh("echo out; echo err >&2; exit 3"), Duration::from_secs(10))
            .await
            .unwrap()
        {
            Finished::Exited(output) => {
                assert_eq!(output.status.code(), Some(3));
                assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
                assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
            }
            Finished::TimedOut => panic!("should not time out"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let started = std::time::Instant::now();
        let finished = run_captured(sh("sleep 30"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(finished, Finished::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let command = Command::new("/nonexistent/cbt-test-binary");
        assert!(run_captured(command, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_inherited_status() {
        let status = run_inherited(sh("exit 0"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(status.unwrap().success());
        let status = run_inherited(sh("sleep 30"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(status.is_none());
    }
}
