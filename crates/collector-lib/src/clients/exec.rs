//! Subprocess execution for modules that wrap command line tools

use crate::error::CollectorError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Bytes of stderr kept for error messages
const STDERR_TAIL_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied executing {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("command cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for CollectorError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::NotFound(_) | ExecError::PermissionDenied(_) => {
                CollectorError::Config(err.to_string())
            }
            ExecError::Timeout(after) => CollectorError::Timeout(after),
            ExecError::Cancelled => CollectorError::Cancelled,
            ExecError::NonZeroExit { .. } | ExecError::Io(_) => {
                CollectorError::Unavailable(err.to_string())
            }
        }
    }
}

/// Command to run: an absolute path plus a fixed argument prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ExecConfig {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if !self.path.is_absolute() {
            return Err(CollectorError::config(format!(
                "command path must be absolute: {}",
                self.path.display()
            )));
        }
        if self.timeout.is_zero() {
            return Err(CollectorError::config("command timeout must be positive"));
        }
        Ok(())
    }
}

/// Result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> Vec<u8> {
        let mut out = self.stdout.clone();
        out.extend_from_slice(&self.stderr);
        out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run to completion and buffer the output
    async fn run(&self, cancel: &CancellationToken, args: &[&str]) -> Result<ExecOutput, ExecError>;

    /// Run and hand each stdout line to `on_line` as it arrives
    async fn run_lines(
        &self,
        cancel: &CancellationToken,
        args: &[&str],
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<(), ExecError>;
}

/// [`Executor`] spawning real processes
pub struct CommandExecutor {
    config: ExecConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecConfig) -> Result<Self, CollectorError> {
        config.validate()?;
        Ok(Self { config })
    }

    fn spawn(&self, args: &[&str]) -> Result<Child, ExecError> {
        Command::new(&self.config.path)
            .args(&self.config.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ExecError::NotFound(self.config.path.clone()),
                std::io::ErrorKind::PermissionDenied => {
                    ExecError::PermissionDenied(self.config.path.clone())
                }
                _ => ExecError::Io(e),
            })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn check_status(status: ExitStatus, stderr: &[u8]) -> Result<i32, ExecError> {
    let code = status.code().unwrap_or(-1);
    if status.success() {
        Ok(code)
    } else {
        Err(ExecError::NonZeroExit {
            code,
            stderr: stderr_tail(stderr),
        })
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run(&self, cancel: &CancellationToken, args: &[&str]) -> Result<ExecOutput, ExecError> {
        let child = self.spawn(args)?;
        let timeout = self.config.timeout;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            output = tokio::time::timeout(timeout, child.wait_with_output()) => {
                output.map_err(|_| ExecError::Timeout(timeout))??
            }
        };

        let exit_code = check_status(output.status, &output.stderr)?;
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code,
        })
    }

    async fn run_lines(
        &self,
        cancel: &CancellationToken,
        args: &[&str],
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
    ) -> Result<(), ExecError> {
        let mut child = self.spawn(args)?;
        let timeout = self.config.timeout;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Io(std::io::Error::other("stdout not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Io(std::io::Error::other("stderr not captured")))?;

        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let stream = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                on_line(&line);
            }
            child.wait().await
        };

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stderr_reader.abort();
                return Err(ExecError::Cancelled);
            }
            status = tokio::time::timeout(timeout, stream) => match status {
                Ok(status) => status?,
                Err(_) => {
                    stderr_reader.abort();
                    return Err(ExecError::Timeout(timeout));
                }
            },
        };

        let stderr = stderr_reader.await.unwrap_or_default();
        check_status(status, &stderr).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(timeout: Duration) -> CommandExecutor {
        CommandExecutor::new(ExecConfig::new("/bin/sh", timeout).arg("-c")).unwrap()
    }

    #[test]
    fn test_relative_path_is_config_error() {
        let err = CommandExecutor::new(ExecConfig::new("arcconf", Duration::from_secs(1)))
            .err()
            .unwrap();
        assert!(matches!(err, CollectorError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let exec = shell(Duration::from_secs(5));
        let output = exec
            .run(&CancellationToken::new(), &["echo hello; echo oops >&2"])
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.combined(), b"hello\noops\n".to_vec());
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr_tail() {
        let exec = shell(Duration::from_secs(5));
        let err = exec
            .run(&CancellationToken::new(), &["echo broken >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let exec = CommandExecutor::new(ExecConfig::new(
            "/nonexistent/bin/arcconf",
            Duration::from_secs(1),
        ))
        .unwrap();
        let err = exec.run(&CancellationToken::new(), &[]).await.unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
        assert!(matches!(CollectorError::from(err), CollectorError::Config(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let exec = shell(Duration::from_millis(100));
        let err = exec
            .run(&CancellationToken::new(), &["sleep 5"])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let exec = shell(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = exec.run(&cancel, &["sleep 5"]).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_lines_streams_stdout() {
        let exec = shell(Duration::from_secs(5));
        let mut lines = Vec::new();
        exec.run_lines(
            &CancellationToken::new(),
            &["printf 'a\\nb\\nc\\n'"],
            &mut |line: &str| lines.push(line.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_run_lines_reports_exit_code() {
        let exec = shell(Duration::from_secs(5));
        let mut count = 0;
        let err = exec
            .run_lines(
                &CancellationToken::new(),
                &["echo one; echo bad >&2; exit 2"],
                &mut |_: &str| count += 1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { code: 2, .. }));
        assert_eq!(count, 1);
    }
}
