//! Line-oriented request/response over TCP or unix sockets
//!
//! One connection per query: connect, write the command plus `\n`, read lines
//! until the terminator, close. Used by text protocols such as zookeeper's
//! four-letter words.

use crate::config::decode;
use crate::error::{CollectorError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(1);

const UNIX_SCHEME: &str = "unix://";

/// When a response is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminator {
    /// First empty line (not included in the result)
    BlankLine,
    /// Peer closes the connection
    #[default]
    Eof,
    /// Exactly this many lines
    Lines(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl SocketAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if let Some(path) = address.strip_prefix(UNIX_SCHEME) {
            if !path.starts_with('/') {
                return Err(CollectorError::config(format!(
                    "unix socket path must be absolute: {address}"
                )));
            }
            return Ok(SocketAddress::Unix(PathBuf::from(path)));
        }
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(SocketAddress::Tcp(address.to_string()))
            }
            _ => Err(CollectorError::config(format!(
                "socket address must be host:port or unix:///path, got '{address}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SocketConfig {
    pub address: String,

    #[serde(default = "default_timeout", with = "decode::duration")]
    pub connect_timeout: Duration,

    #[serde(default = "default_timeout", with = "decode::duration")]
    pub read_timeout: Duration,

    #[serde(default = "default_timeout", with = "decode::duration")]
    pub write_timeout: Duration,

    #[serde(default)]
    pub terminator: Terminator,
}

fn default_timeout() -> Duration {
    DEFAULT_SOCKET_TIMEOUT
}

impl SocketConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_SOCKET_TIMEOUT,
            read_timeout: DEFAULT_SOCKET_TIMEOUT,
            write_timeout: DEFAULT_SOCKET_TIMEOUT,
            terminator: Terminator::default(),
        }
    }

    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<SocketAddress> {
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
        ] {
            if value.is_zero() {
                return Err(CollectorError::config(format!("{name} must be positive")));
            }
        }
        if self.terminator == Terminator::Lines(0) {
            return Err(CollectorError::config("line terminator count must be positive"));
        }
        SocketAddress::parse(&self.address)
    }
}

#[async_trait]
pub trait LineClient: Send + Sync {
    /// Send `command` and return the response lines, right-trimmed
    async fn query(&self, cancel: &CancellationToken, command: &str) -> Result<Vec<String>>;
}

/// [`LineClient`] opening a fresh stream per query
pub struct StreamLineClient {
    config: SocketConfig,
    address: SocketAddress,
}

impl StreamLineClient {
    pub fn new(config: SocketConfig) -> Result<Self> {
        let address = config.validate()?;
        Ok(Self { config, address })
    }

    async fn connect_and_query(&self, command: &str) -> Result<Vec<String>> {
        let connect_timeout = self.config.connect_timeout;
        match &self.address {
            SocketAddress::Tcp(addr) => {
                let stream = timeout(connect_timeout, TcpStream::connect(addr.as_str()))
                    .await
                    .map_err(|_| CollectorError::Timeout(connect_timeout))?
                    .map_err(|e| connect_error(addr, e))?;
                self.exchange(stream, command).await
            }
            #[cfg(unix)]
            SocketAddress::Unix(path) => {
                let stream = timeout(connect_timeout, tokio::net::UnixStream::connect(path))
                    .await
                    .map_err(|_| CollectorError::Timeout(connect_timeout))?
                    .map_err(|e| connect_error(&path.display().to_string(), e))?;
                self.exchange(stream, command).await
            }
            #[cfg(not(unix))]
            SocketAddress::Unix(path) => Err(CollectorError::config(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }

    async fn exchange<S>(&self, stream: S, command: &str) -> Result<Vec<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);

        let write_timeout = self.config.write_timeout;
        let request = format!("{command}\n");
        timeout(write_timeout, async {
            writer.write_all(request.as_bytes()).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| CollectorError::Timeout(write_timeout))??;

        let read_timeout = self.config.read_timeout;
        let terminator = self.config.terminator;
        let mut lines = BufReader::new(reader).lines();
        let mut out = Vec::new();

        loop {
            let next = timeout(read_timeout, lines.next_line())
                .await
                .map_err(|_| CollectorError::Timeout(read_timeout))??;

            let Some(line) = next else {
                if let Terminator::Lines(expected) = terminator {
                    return Err(CollectorError::protocol(format!(
                        "connection closed after {} of {expected} lines",
                        out.len()
                    )));
                }
                break;
            };

            let line = line.trim_end().to_string();
            if terminator == Terminator::BlankLine && line.is_empty() {
                break;
            }
            out.push(line);
            if let Terminator::Lines(expected) = terminator {
                if out.len() >= expected {
                    break;
                }
            }
        }

        Ok(out)
    }
}

fn connect_error(addr: &str, err: std::io::Error) -> CollectorError {
    CollectorError::unavailable(format!("connect to {addr}: {err}"))
}

#[async_trait]
impl LineClient for StreamLineClient {
    async fn query(&self, cancel: &CancellationToken, command: &str) -> Result<Vec<String>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
            result = self.connect_and_query(command) => result,
        }
    }
}
