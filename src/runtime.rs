//! External process execution.
//!
//! Training and scoring both run as short-lived child processes of an
//! interpreter. This module resolves which interpreter to use and runs a
//! child to completion while draining stdout and stderr concurrently, so a
//! chatty job can never deadlock on a full pipe.
//!
//! Children are spawned with `kill_on_drop`, so a timeout (or a dropped
//! request future) terminates the process instead of leaking it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;

/// How long to keep draining pipes after the child has exited or been killed.
/// A grandchild that inherited the pipes can otherwise hold them open forever.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Picks the interpreter that runs external jobs.
///
/// A bundled interpreter (relative paths resolve against `base`) is used when
/// it exists on disk; otherwise the fallback name is handed to the OS for
/// `PATH` lookup.
pub fn resolve_interpreter(runtime: &RuntimeConfig, base: &Path) -> PathBuf {
    let bundled = if runtime.bundled_interpreter.is_absolute() {
        runtime.bundled_interpreter.clone()
    } else {
        base.join(&runtime.bundled_interpreter)
    };

    if bundled.is_file() {
        bundled
    } else {
        PathBuf::from(&runtime.fallback_interpreter)
    }
}

/// Everything a finished child wrote, plus how it ended.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        join_streams(&self.stdout, &self.stderr)
    }
}

#[derive(Debug)]
pub enum RunError {
    /// The process could not be started at all.
    Launch(std::io::Error),
    /// Waiting on the child failed after it started.
    Wait(std::io::Error),
    /// The child outlived its deadline and was killed.
    TimedOut {
        after: Duration,
        stdout: String,
        stderr: String,
    },
}

#[derive(Clone, Copy)]
enum Channel {
    Stdout,
    Stderr,
}

/// Runs `cmd` to completion, feeding it `stdin` and capturing both streams.
///
/// `job` names the process in log lines.
pub async fn run_captured(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    job: &'static str,
) -> Result<CapturedOutput, RunError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(RunError::Launch)?;
    tracing::debug!(job, pid = ?child.id(), "spawned child process");

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            // The child may exit without reading its input; a broken pipe is
            // then expected and its output will say what went wrong.
            if let Err(e) = pipe.write_all(&bytes).await {
                tracing::debug!(job, error = %e, "child closed stdin early");
            }
        });
    }

    let stdout_buf = Arc::new(Mutex::new(String::new()));
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(drain(s, stdout_buf.clone(), job, Channel::Stdout)));
    let stderr_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(drain(s, stderr_buf.clone(), job, Channel::Stderr)));

    let waited = tokio::time::timeout(timeout, child.wait()).await;

    let status = match waited {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(RunError::Wait(e)),
        Err(_) => {
            tracing::warn!(job, timeout_secs = timeout.as_secs(), "child timed out, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(job, error = %e, "failed to kill timed out child");
            }
            settle(stdout_task).await;
            settle(stderr_task).await;
            return Err(RunError::TimedOut {
                after: timeout,
                stdout: take(&stdout_buf),
                stderr: take(&stderr_buf),
            });
        }
    };

    settle(stdout_task).await;
    settle(stderr_task).await;

    let output = CapturedOutput {
        exit_code: status.code(),
        success: status.success(),
        stdout: take(&stdout_buf),
        stderr: take(&stderr_buf),
    };
    tracing::debug!(job, exit_code = ?output.exit_code, "child exited");
    Ok(output)
}

async fn drain<R>(stream: R, sink: Arc<Mutex<String>>, job: &'static str, channel: Channel)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if let Channel::Stderr = channel {
                    tracing::debug!(job, line = %line.trim_end(), "stderr");
                }
                if let Ok(mut sink) = sink.lock() {
                    sink.push_str(&line);
                }
            }
            Err(e) => {
                tracing::warn!(job, error = %e, "failed reading child output");
                break;
            }
        }
    }
}

async fn settle(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn take(buf: &Arc<Mutex<String>>) -> String {
    buf.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default()
}

pub(crate) fn join_streams(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) if stdout.ends_with('\n') => format!("{}{}", stdout, stderr),
        (false, false) => format!("{}\n{}", stdout, stderr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_bundled_interpreter_preferred_when_present() {
        let tmp = TempDir::new().unwrap();
        let runtime = RuntimeConfig {
            bundled_interpreter: PathBuf::from("venv/bin/python"),
            fallback_interpreter: "python3".to_string(),
        };
        assert_eq!(
            resolve_interpreter(&runtime, tmp.path()),
            PathBuf::from("python3")
        );

        std::fs::create_dir_all(tmp.path().join("venv/bin")).unwrap();
        std::fs::write(tmp.path().join("venv/bin/python"), "").unwrap();
        assert_eq!(
            resolve_interpreter(&runtime, tmp.path()),
            tmp.path().join("venv/bin/python")
        );
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let out = run_captured(
            sh("echo out-1; echo err-1 >&2; echo out-2; exit 3"),
            None,
            Duration::from_secs(10),
            "test",
        )
        .await
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "out-1\nout-2\n");
        assert_eq!(out.stderr, "err-1\n");
        assert_eq!(out.combined(), "out-1\nout-2\nerr-1\n");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let out = run_captured(
            sh("cat"),
            Some(b"{\"a\": 1}".to_vec()),
            Duration::from_secs(10),
            "test",
        )
        .await
        .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "{\"a\": 1}");
    }

    #[tokio::test]
    async fn test_launch_failure_is_distinct() {
        let cmd = Command::new("/definitely/not/an/interpreter");
        let err = run_captured(cmd, None, Duration::from_secs(1), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Launch(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_child_and_keeps_partial_output() {
        let err = run_captured(
            sh("echo started; exec sleep 30"),
            None,
            Duration::from_millis(500),
            "test",
        )
        .await
        .unwrap_err();
        match err {
            RunError::TimedOut { stdout, .. } => assert_eq!(stdout, "started\n"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_join_streams() {
        assert_eq!(join_streams("a", ""), "a");
        assert_eq!(join_streams("", "b"), "b");
        assert_eq!(join_streams("a", "b"), "a\nb");
        assert_eq!(join_streams("a\n", "b"), "a\nb");
    }
}
