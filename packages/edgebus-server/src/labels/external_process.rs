//! External-process execution protocol for label handlers.
//!
//! One process is spawned per invocation. The message body is written to its
//! stdin (which is then closed), stdout is collected in full, and the exit
//! status decides the outcome:
//!
//! - exit code 0: stdout must be a JSON array of strings
//! - non-zero exit code: [`ExternalProcessError::UnexpectedExitCode`]
//! - terminated by a signal: [`ExternalProcessError::Killed`]
//!
//! Two independent deadlines apply. The spawn timeout bounds process startup
//! ([`ExternalProcessError::CannotSpawn`]). The execution timeout starts when
//! the body is written; on expiry the process is killed and the invocation
//! fails with [`ExternalProcessError::Timeout`] regardless of how the process
//! exits afterwards.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::ExternalProcessError;

/// Timeouts and path resolution for external label handlers.
#[derive(Debug, Clone)]
pub struct ExternalProcessConfig {
    /// Maximum time for the process to confirm startup.
    pub spawn_timeout: Duration,
    /// Maximum time from writing stdin until the process exits.
    pub execution_timeout: Duration,
    /// Directory relative handler paths are resolved against.
    pub handlers_dir: PathBuf,
}

impl Default for ExternalProcessConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(10),
            handlers_dir: PathBuf::from("label_handlers"),
        }
    }
}

impl ExternalProcessConfig {
    /// Resolves a handler path. Absolute paths are returned unchanged.
    #[must_use]
    pub fn resolve(&self, handler_path: &str) -> PathBuf {
        self.handlers_dir.join(handler_path)
    }
}

/// A configured external executable that computes labels.
#[derive(Debug, Clone)]
pub struct ExternalProcess {
    executable: PathBuf,
    args: Vec<String>,
    spawn_timeout: Duration,
    execution_timeout: Duration,
}

impl ExternalProcess {
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>, spawn_timeout: Duration, execution_timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            spawn_timeout,
            execution_timeout,
        }
    }

    /// Adds fixed arguments. Label handlers registered in storage run without
    /// arguments; this exists for interpreters such as `/bin/sh -c`.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn path_display(&self) -> String {
        self.executable.display().to_string()
    }

    /// Runs the process once, feeding `body` on stdin.
    ///
    /// # Errors
    ///
    /// Returns the [`ExternalProcessError`] variant classifying the failure.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        body: &[u8],
    ) -> Result<Vec<String>, ExternalProcessError> {
        let path = self.path_display();
        let mut child = self.spawn().await?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = drive(&mut child, stdin, stdout, stderr, body, &path);
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.execution_timeout, run) => result,
            () = ctx.cancelled() => {
                let _ = child.kill().await;
                info!(path = %path, "external process cancelled");
                return Err(ExternalProcessError::Cancelled { path });
            }
        };

        let Ok(result) = outcome else {
            // The exit status after this kill is irrelevant: timeout wins.
            let _ = child.kill().await;
            let timeout_ms = u64::try_from(self.execution_timeout.as_millis()).unwrap_or(u64::MAX);
            info!(path = %path, timeout_ms, "external process timeout");
            return Err(ExternalProcessError::Timeout { path, timeout_ms });
        };

        let (status, stdout, stderr) = result?;
        classify(&path, status, &stdout, &stderr)
    }

    async fn spawn(&self) -> Result<Child, ExternalProcessError> {
        let path = self.path_display();
        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // `spawn` blocks on fork/exec; run it off the async workers so the
        // spawn deadline can actually fire. A child that appears after the
        // deadline is dropped and therefore killed.
        let spawning = tokio::task::spawn_blocking(move || command.spawn());
        await_spawn(path, self.spawn_timeout, spawning).await
    }
}

/// Waits up to `deadline` for a blocking spawn to hand back the child.
async fn await_spawn(
    path: String,
    deadline: Duration,
    spawning: JoinHandle<std::io::Result<Child>>,
) -> Result<Child, ExternalProcessError> {
    match tokio::time::timeout(deadline, spawning).await {
        Ok(Ok(Ok(child))) => {
            debug!(path = %path, pid = ?child.id(), "external process spawned");
            Ok(child)
        }
        Ok(Ok(Err(e))) => {
            info!(path = %path, error = %e, "failed to spawn external process");
            Err(ExternalProcessError::CannotSpawn {
                path,
                reason: e.to_string(),
            })
        }
        Ok(Err(join_err)) => Err(ExternalProcessError::CannotSpawn {
            path,
            reason: join_err.to_string(),
        }),
        Err(_elapsed) => {
            info!(path = %path, "external process spawn timeout");
            Err(ExternalProcessError::CannotSpawn {
                path,
                reason: "spawn timeout".to_string(),
            })
        }
    }
}

/// Writes stdin, drains stdout/stderr concurrently, and waits for exit.
async fn drive(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    stdout: Option<impl AsyncRead + Unpin>,
    stderr: Option<impl AsyncRead + Unpin>,
    body: &[u8],
    path: &str,
) -> Result<(ExitStatus, Vec<u8>, Vec<u8>), ExternalProcessError> {
    let io_err = |source: std::io::Error| ExternalProcessError::Io {
        path: path.to_string(),
        source,
    };

    let write = async {
        if let Some(mut stdin) = stdin {
            match stdin.write_all(body).await {
                // A handler may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
            drop(stdin);
        }
        Ok::<(), std::io::Error>(())
    };
    let (written, out, err) = tokio::join!(write, read_all(stdout), read_all(stderr));
    written.map_err(io_err)?;
    let out = out.map_err(io_err)?;
    let err = err.map_err(io_err)?;

    let status = child.wait().await.map_err(io_err)?;
    Ok((status, out, err))
}

async fn read_all(stream: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn classify(
    path: &str,
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<Vec<String>, ExternalProcessError> {
    match status.code() {
        Some(0) => serde_json::from_slice::<Vec<String>>(stdout).map_err(|source| {
            info!(path = %path, "parse error, expected JSON array of strings from external label handler");
            ExternalProcessError::Parse {
                path: path.to_string(),
                source,
            }
        }),
        Some(code) => {
            info!(path = %path, code, "external process exited with unexpected code");
            Err(ExternalProcessError::UnexpectedExitCode {
                path: path.to_string(),
                code,
                stderr: String::from_utf8_lossy(stderr).into_owned(),
            })
        }
        None => {
            info!(path = %path, "external process killed");
            Err(ExternalProcessError::Killed {
                path: path.to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ExternalProcess {
        ExternalProcess::new("/bin/sh", Duration::from_secs(5), Duration::from_secs(5))
            .with_args(["-c", script])
    }

    #[tokio::test]
    async fn exit_zero_with_string_array_resolves_labels() {
        let process = sh(r#"cat > /dev/null; printf '["a","b"]'"#);
        let labels = process
            .execute(&ExecutionContext::new(), b"{}")
            .await
            .unwrap();
        assert_eq!(labels, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn body_is_written_to_stdin() {
        // Echo stdin back inside a JSON array.
        let process = sh(r#"printf '["%s"]' "$(cat)""#);
        let labels = process
            .execute(&ExecutionContext::new(), b"push-event")
            .await
            .unwrap();
        assert_eq!(labels, vec!["push-event".to_string()]);
    }

    #[tokio::test]
    async fn non_array_output_is_parse_failure() {
        let process = sh(r#"printf '{"a":1}'"#);
        let err = process
            .execute(&ExecutionContext::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalProcessError::Parse { .. }));
    }

    #[tokio::test]
    async fn array_of_numbers_is_parse_failure() {
        let process = sh("printf '[1,2]'");
        let err = process
            .execute(&ExecutionContext::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalProcessError::Parse { .. }));
    }

    #[tokio::test]
    async fn non_zero_exit_is_unexpected_exit_code() {
        let process = sh("echo boom >&2; exit 3");
        let err = process
            .execute(&ExecutionContext::new(), b"")
            .await
            .unwrap_err();
        match err {
            ExternalProcessError::UnexpectedExitCode { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signal_termination_is_killed() {
        let process = sh("kill -9 $$");
        let err = process
            .execute(&ExecutionContext::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalProcessError::Killed { .. }));
    }

    #[tokio::test]
    async fn missing_executable_cannot_spawn() {
        let process = ExternalProcess::new(
            "/nonexistent/edgebus-label-handler",
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let err = process
            .execute(&ExecutionContext::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalProcessError::CannotSpawn { .. }));
    }

    #[tokio::test]
    async fn spawn_past_its_deadline_cannot_spawn() {
        let slow_spawn = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(300));
            Command::new("/bin/true").kill_on_drop(true).spawn()
        });
        let err = await_spawn("/bin/true".to_string(), Duration::from_millis(20), slow_spawn)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExternalProcessError::CannotSpawn { ref reason, .. } if reason == "spawn timeout"
        ));
    }

    #[tokio::test]
    async fn slow_process_times_out_even_if_it_would_exit_later() {
        // Exits with a non-zero code shortly after the deadline.
        let process = ExternalProcess::new(
            "/bin/sh",
            Duration::from_secs(5),
            Duration::from_millis(200),
        )
        .with_args(["-c", "sleep 1; exit 7"]);
        let err = process
            .execute(&ExecutionContext::new(), b"")
            .await
            .unwrap_err();
        assert!(
            matches!(err, ExternalProcessError::Timeout { timeout_ms: 200, .. }),
            "expected timeout, got {err:?}"
        );
    }

    #[tokio::test]
    async fn cancellation_kills_process() {
        let process = sh("sleep 5");
        let ctx = ExecutionContext::new();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = process.execute(&ctx, b"").await.unwrap_err();
        assert!(matches!(err, ExternalProcessError::Cancelled { .. }));
    }

    #[test]
    fn relative_paths_resolve_under_handlers_dir() {
        let config = ExternalProcessConfig::default();
        assert_eq!(
            config.resolve("gitlab.sh"),
            PathBuf::from("label_handlers/gitlab.sh")
        );
        assert_eq!(config.resolve("/opt/h.sh"), PathBuf::from("/opt/h.sh"));
    }
}
