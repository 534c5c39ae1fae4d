//! Error taxonomy shared by modules, clients and the job runner
//!
//! Errors never leave a job: the runner turns them into strikes or check
//! retries, and the job manager only ever observes alive/dead transitions.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the runtime
pub type Result<T, E = CollectorError> = std::result::Result<T, E>;

/// Errors raised by modules and shared clients
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Malformed or missing options. Not retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Target unreachable or refusing. Retried during check.
    #[error("target unavailable: {0}")]
    Unavailable(String),

    /// Credentials rejected by the target
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Target answered with something we cannot interpret
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Deadline exceeded
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A bug in a module, including caught panics
    #[error("internal error: {0}")]
    Internal(String),

    /// The process cannot continue (stdout closed)
    #[error("fatal: {0}")]
    Fatal(String),

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

/// Discriminant of [`CollectorError`], used for metrics labels and policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Unavailable,
    Auth,
    Protocol,
    Timeout,
    Internal,
    Fatal,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Auth => "auth",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl CollectorError {
    pub fn config(msg: impl Into<String>) -> Self {
        CollectorError::Config(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        CollectorError::Unavailable(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CollectorError::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CollectorError::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CollectorError::Config(_) => ErrorKind::Config,
            CollectorError::Unavailable(_) => ErrorKind::Unavailable,
            CollectorError::Auth(_) => ErrorKind::Auth,
            CollectorError::Protocol(_) => ErrorKind::Protocol,
            CollectorError::Timeout(_) => ErrorKind::Timeout,
            CollectorError::Internal(_) => ErrorKind::Internal,
            CollectorError::Fatal(_) => ErrorKind::Fatal,
            CollectorError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a failed check may be retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::Unavailable(_) | CollectorError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::TimedOut | Io::WouldBlock => CollectorError::Timeout(Duration::ZERO),
            Io::InvalidData | Io::UnexpectedEof => CollectorError::Protocol(err.to_string()),
            Io::PermissionDenied => CollectorError::Auth(err.to_string()),
            _ => CollectorError::Unavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::Protocol(format!("invalid JSON: {err}"))
    }
}
