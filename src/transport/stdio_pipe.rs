//! Process launch with piped stdio.
//!
//! Stdin is fed and stdout/stderr are drained concurrently, and all three
//! finish before the process is waited on. Waiting first would deadlock as
//! soon as the child fills an OS pipe buffer.

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ExecutorError, Result};

/// Everything a finished process produced.
#[derive(Debug)]
pub struct PipedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl PipedOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, as text.
    pub fn combined_lossy(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        out
    }
}

/// Run `program` with `args`, optionally feeding `stdin`, bounded by
/// `timeout` and `cancel`.
///
/// A non-zero exit is not an error here; callers inspect `status`. Timeout
/// and cancellation kill the child and return `Timeout` / `Cancelled`.
#[instrument(skip_all, fields(program = %program, timeout = ?timeout))]
pub async fn run_piped(
    program: &str,
    args: &[String],
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<PipedOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecutorError::io(format!("spawn {program}"), e))?;

    let child_stdin = child.stdin.take();
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::io("open stdout", std::io::Error::other("not piped")))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecutorError::io("open stderr", std::io::Error::other("not piped")))?;

    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (child_stdin, stdin) {
            // A child may exit without consuming its input.
            if let Err(e) = pipe.write_all(&bytes).await {
                if e.kind() != ErrorKind::BrokenPipe {
                    return Err(e);
                }
                debug!("Child closed stdin before reading the full request");
            }
            drop(pipe);
        }
        Ok(())
    };

    let run = async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let (fed, r1, r2) = tokio::join!(
            feed,
            child_stdout.read_to_end(&mut stdout_buf),
            child_stderr.read_to_end(&mut stderr_buf),
        );
        fed.map_err(|e| ExecutorError::io("write stdin", e))?;
        if let Err(e) = r1 {
            warn!(error = %e, "Error reading stdout");
        }
        if let Err(e) = r2 {
            warn!(error = %e, "Error reading stderr");
        }

        // Both pipes are at EOF; only now is it safe to wait.
        let status = child
            .wait()
            .await
            .map_err(|e| ExecutorError::io("wait for process", e))?;
        Ok::<_, ExecutorError>(PipedOutput {
            status,
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    };

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        output = run => {
            let output = output?;
            debug!(
                status = %output.status,
                stdout_size = output.stdout.len(),
                stderr_size = output.stderr.len(),
                "Process finished"
            );
            Ok(output)
        }
        () = deadline => {
            let _ = child.kill().await;
            Err(ExecutorError::Timeout(timeout.unwrap_or_default()))
        }
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            Err(ExecutorError::Cancelled)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn feeds_stdin_and_captures_both_streams() {
        let out = run_piped(
            "/bin/sh",
            &sh("cat; echo oops >&2"),
            Some(b"hello".to_vec()),
            Some(Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr_lossy(), "oops\n");
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        // Well past any pipe buffer on both streams.
        let script = "head -c 1048576 /dev/zero; head -c 1048576 /dev/zero >&2";
        let out = run_piped(
            "/bin/sh",
            &sh(script),
            None,
            Some(Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), 1_048_576);
        assert_eq!(out.stderr.len(), 1_048_576);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_in_status() {
        let out = run_piped(
            "/bin/sh",
            &sh("echo failing >&2; exit 3"),
            None,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.combined_lossy(), "failing\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let start = Instant::now();
        let err = run_piped(
            "/bin/sh",
            &sh("exec sleep 5"),
            None,
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = run_piped("/bin/sh", &sh("exec sleep 5"), None, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let err = run_piped(
            "/definitely/not/a/runtime",
            &[],
            None,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("spawn /definitely/not/a/runtime"));
    }
}
