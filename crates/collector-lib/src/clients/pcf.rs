//! PCF (Programmable Command Format) client for message queue managers
//!
//! Each message is an MQCFH header followed by typed parameters, all
//! big-endian, framed on the wire by a 4-byte length prefix. A request gets
//! one or more responses; the last carries `MQCFC_LAST` in its control field.

use crate::config::decode;
use crate::error::{CollectorError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MQCFT_COMMAND: i32 = 1;
const MQCFT_RESPONSE: i32 = 2;
const MQCFT_INTEGER: i32 = 3;
const MQCFT_STRING: i32 = 4;
const MQCFT_INTEGER64: i32 = 23;

const MQCFH_LEN: usize = 36;
const MQCFIN_LEN: usize = 16;
const MQCFIN64_LEN: usize = 24;
const MQCFST_HEADER_LEN: usize = 20;

const MQCFC_LAST: i32 = 1;
const MQCFC_NOT_LAST: i32 = 0;

const MQCC_OK: i32 = 0;
const MQCC_FAILED: i32 = 2;

const CCSID_UTF8: i32 = 1208;
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
const DEFAULT_PORT: u16 = 1414;

pub const MQCMD_INQUIRE_Q_MGR: i32 = 2;
pub const MQCMD_INQUIRE_Q: i32 = 13;
pub const MQCMD_RESET_Q_STATS: i32 = 17;
pub const MQCMD_INQUIRE_CHANNEL: i32 = 25;
pub const MQCMD_INQUIRE_Q_STATUS: i32 = 41;

pub const MQIA_CURRENT_Q_DEPTH: i32 = 3;
pub const MQIA_MAX_Q_DEPTH: i32 = 15;
pub const MQIA_Q_TYPE: i32 = 20;
pub const MQIA_TIME_SINCE_RESET: i32 = 35;
pub const MQIA_HIGH_Q_DEPTH: i32 = 36;
pub const MQIA_MSG_ENQ_COUNT: i32 = 37;
pub const MQIA_MSG_DEQ_COUNT: i32 = 38;
pub const MQCA_Q_MGR_NAME: i32 = 2015;
pub const MQCA_Q_NAME: i32 = 2016;
pub const MQCACF_USER_IDENTIFIER: i32 = 3025;
pub const MQCACH_CHANNEL_NAME: i32 = 3501;
/// Password attribute of the connect handshake
pub const PARAM_PASSWORD: i32 = 3026;

pub const MQRC_CONNECTION_BROKEN: i32 = 2009;
pub const MQRC_NOT_AUTHORIZED: i32 = 2035;
pub const MQRC_Q_MGR_NOT_AVAILABLE: i32 = 2059;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcfValue {
    Int(i32),
    Int64(i64),
    Str(String),
}

impl PcfValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PcfValue::Int(v) => Some(i64::from(*v)),
            PcfValue::Int64(v) => Some(*v),
            PcfValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PcfValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Parameters of one response, keyed by parameter id
pub type Attributes = BTreeMap<i32, PcfValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcfMessage {
    pub msg_type: i32,
    pub command: i32,
    pub msg_seq: i32,
    pub control: i32,
    pub comp_code: i32,
    pub reason: i32,
    pub params: Vec<(i32, PcfValue)>,
}

impl PcfMessage {
    pub fn command(command: i32) -> Self {
        Self {
            msg_type: MQCFT_COMMAND,
            command,
            msg_seq: 1,
            control: MQCFC_LAST,
            comp_code: MQCC_OK,
            reason: 0,
            params: Vec::new(),
        }
    }

    pub fn response(command: i32, last: bool) -> Self {
        Self {
            msg_type: MQCFT_RESPONSE,
            control: if last { MQCFC_LAST } else { MQCFC_NOT_LAST },
            ..Self::command(command)
        }
    }

    pub fn failed(command: i32, reason: i32) -> Self {
        Self {
            comp_code: MQCC_FAILED,
            reason,
            ..Self::response(command, true)
        }
    }

    pub fn with_param(mut self, param: i32, value: PcfValue) -> Self {
        self.params.push((param, value));
        self
    }

    pub fn is_last(&self) -> bool {
        self.control == MQCFC_LAST
    }

    pub fn attributes(&self) -> Attributes {
        self.params.iter().cloned().collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MQCFH_LEN + self.params.len() * MQCFIN_LEN);
        for field in [
            self.msg_type,
            MQCFH_LEN as i32,
            1,
            self.command,
            self.msg_seq,
            self.control,
            self.comp_code,
            self.reason,
            self.params.len() as i32,
        ] {
            buf.extend_from_slice(&field.to_be_bytes());
        }

        for (param, value) in &self.params {
            match value {
                PcfValue::Int(v) => {
                    put_i32s(&mut buf, &[MQCFT_INTEGER, MQCFIN_LEN as i32, *param]);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                PcfValue::Int64(v) => {
                    put_i32s(&mut buf, &[MQCFT_INTEGER64, MQCFIN64_LEN as i32, *param, 0]);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                PcfValue::Str(s) => {
                    let bytes = s.as_bytes();
                    let padded = bytes.len().div_ceil(4) * 4;
                    put_i32s(
                        &mut buf,
                        &[
                            MQCFT_STRING,
                            (MQCFST_HEADER_LEN + padded) as i32,
                            *param,
                            CCSID_UTF8,
                            bytes.len() as i32,
                        ],
                    );
                    buf.extend_from_slice(bytes);
                    buf.resize(buf.len() + padded - bytes.len(), 0);
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { buf, pos: 0 };
        let msg_type = cursor.i32()?;
        let struc_len = cursor.i32()?;
        if struc_len as usize != MQCFH_LEN {
            return Err(CollectorError::protocol(format!(
                "unexpected MQCFH length {struc_len}"
            )));
        }
        let _version = cursor.i32()?;
        let command = cursor.i32()?;
        let msg_seq = cursor.i32()?;
        let control = cursor.i32()?;
        let comp_code = cursor.i32()?;
        let reason = cursor.i32()?;
        let count = cursor.i32()?;

        let mut params = Vec::with_capacity(count.clamp(0, 256) as usize);
        for _ in 0..count {
            let start = cursor.pos;
            let ty = cursor.i32()?;
            let len = cursor.i32()? as usize;
            let param = cursor.i32()?;
            let value = match ty {
                MQCFT_INTEGER => PcfValue::Int(cursor.i32()?),
                MQCFT_INTEGER64 => {
                    let _reserved = cursor.i32()?;
                    PcfValue::Int64(cursor.i64()?)
                }
                MQCFT_STRING => {
                    let _ccsid = cursor.i32()?;
                    let str_len = cursor.i32()?.max(0) as usize;
                    let raw = cursor.take(str_len)?;
                    let text = String::from_utf8_lossy(raw)
                        .trim_end_matches(['\0', ' '])
                        .to_string();
                    PcfValue::Str(text)
                }
                other => {
                    return Err(CollectorError::protocol(format!(
                        "unsupported PCF parameter type {other}"
                    )))
                }
            };
            // Skip padding and any trailing fields of newer structure versions.
            let consumed = cursor.pos - start;
            if len < consumed {
                return Err(CollectorError::protocol(format!(
                    "PCF parameter {param} has invalid length {len}"
                )));
            }
            cursor.take(len - consumed)?;
            params.push((param, value));
        }

        Ok(Self {
            msg_type,
            command,
            msg_seq,
            control,
            comp_code,
            reason,
            params,
        })
    }

    /// Map a failed completion code to an error
    pub fn check(&self) -> Result<()> {
        if self.comp_code != MQCC_FAILED {
            return Ok(());
        }
        Err(match self.reason {
            MQRC_NOT_AUTHORIZED => {
                CollectorError::Auth(format!("PCF command {} not authorized", self.command))
            }
            MQRC_CONNECTION_BROKEN | MQRC_Q_MGR_NOT_AVAILABLE => CollectorError::unavailable(
                format!("queue manager unavailable (reason {})", self.reason),
            ),
            reason => CollectorError::protocol(format!(
                "PCF command {} failed with reason {reason}",
                self.command
            )),
        })
    }
}

fn put_i32s(buf: &mut Vec<u8>, values: &[i32]) {
    for v in values {
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(CollectorError::protocol("truncated PCF message"));
        };
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, message: &PcfMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.encode();
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<PcfMessage>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(CollectorError::protocol(format!("PCF frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    PcfMessage::decode(&payload)
}

/// Object class addressed by an inquiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcfObject {
    QueueManager,
    Queue,
    QueueStatus,
    Channel,
}

impl PcfObject {
    fn command(self) -> i32 {
        match self {
            PcfObject::QueueManager => MQCMD_INQUIRE_Q_MGR,
            PcfObject::Queue => MQCMD_INQUIRE_Q,
            PcfObject::QueueStatus => MQCMD_INQUIRE_Q_STATUS,
            PcfObject::Channel => MQCMD_INQUIRE_CHANNEL,
        }
    }

    fn name_param(self) -> Option<i32> {
        match self {
            PcfObject::QueueManager => None,
            PcfObject::Queue | PcfObject::QueueStatus => Some(MQCA_Q_NAME),
            PcfObject::Channel => Some(MQCACH_CHANNEL_NAME),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PcfConfig {
    pub queue_manager: String,

    #[serde(default = "default_channel")]
    pub channel: String,

    /// `host(port)` or `host:port`
    pub connection_name: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_timeout", with = "decode::duration")]
    pub timeout: Duration,
}

fn default_channel() -> String {
    "SYSTEM.DEF.SVRCONN".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl PcfConfig {
    pub fn new(queue_manager: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            queue_manager: queue_manager.into(),
            channel: default_channel(),
            connection_name: connection_name.into(),
            user: None,
            password: None,
            timeout: default_timeout(),
        }
    }

    /// Resolve the connection name to `host:port`
    pub fn address(&self) -> Result<String> {
        let name = self.connection_name.trim();
        let (host, port) = if let Some(open) = name.find('(') {
            let port = name[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| CollectorError::config(format!("invalid connection name '{name}'")))?;
            (&name[..open], port)
        } else if let Some((host, port)) = name.rsplit_once(':') {
            (host, port)
        } else {
            (name, "")
        };

        if host.is_empty() {
            return Err(CollectorError::config(format!("invalid connection name '{name}'")));
        }
        let port = if port.is_empty() {
            DEFAULT_PORT
        } else {
            port.trim()
                .parse::<u16>()
                .map_err(|_| CollectorError::config(format!("invalid port in '{name}'")))?
        };
        Ok(format!("{host}:{port}"))
    }

    pub fn validate(&self) -> Result<String> {
        if self.queue_manager.trim().is_empty() {
            return Err(CollectorError::config("queue_manager is required"));
        }
        if self.timeout.is_zero() {
            return Err(CollectorError::config("timeout must be positive"));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(CollectorError::config("user and password must be set together"));
        }
        self.address()
    }
}

#[async_trait]
pub trait PcfClient: Send + Sync {
    /// Attribute maps of the objects matching `filter` (`*` for all)
    async fn inquire(
        &self,
        cancel: &CancellationToken,
        object: PcfObject,
        filter: &str,
    ) -> Result<Vec<Attributes>>;

    /// Counters accumulated since the previous reset; the server zeroes them
    async fn reset_queue_stats(&self, cancel: &CancellationToken, queue: &str) -> Result<Attributes>;

    async fn close(&self);
}

/// [`PcfClient`] over one TCP connection, re-established after failures
pub struct TcpPcfClient {
    config: PcfConfig,
    address: String,
    conn: Mutex<Option<TcpStream>>,
    seq: AtomicI32,
}

impl TcpPcfClient {
    pub fn new(config: PcfConfig) -> Result<Self> {
        let address = config.validate()?;
        Ok(Self {
            config,
            address,
            conn: Mutex::new(None),
            seq: AtomicI32::new(1),
        })
    }

    fn handshake(&self) -> PcfMessage {
        let mut hello = PcfMessage::command(MQCMD_INQUIRE_Q_MGR)
            .with_param(MQCA_Q_MGR_NAME, PcfValue::Str(self.config.queue_manager.clone()))
            .with_param(MQCACH_CHANNEL_NAME, PcfValue::Str(self.config.channel.clone()));
        if let (Some(user), Some(password)) = (&self.config.user, &self.config.password) {
            hello = hello
                .with_param(MQCACF_USER_IDENTIFIER, PcfValue::Str(user.clone()))
                .with_param(PARAM_PASSWORD, PcfValue::Str(password.clone()));
        }
        hello
    }

    async fn roundtrip(&self, stream: &mut TcpStream, mut request: PcfMessage) -> Result<Vec<PcfMessage>> {
        request.msg_seq = self.seq.fetch_add(1, Ordering::Relaxed);
        write_frame(stream, &request).await?;

        let mut responses = Vec::new();
        loop {
            let response = read_frame(stream).await?;
            if response.msg_type != MQCFT_RESPONSE {
                return Err(CollectorError::protocol(format!(
                    "expected PCF response, got type {}",
                    response.msg_type
                )));
            }
            let last = response.is_last();
            responses.push(response);
            if last {
                return Ok(responses);
            }
        }
    }

    async fn send(&self, slot: &mut Option<TcpStream>, request: PcfMessage) -> Result<Vec<PcfMessage>> {
        if slot.is_none() {
            let mut stream = TcpStream::connect(&self.address).await.map_err(|e| {
                CollectorError::unavailable(format!("connect to {}: {e}", self.address))
            })?;
            let replies = self.roundtrip(&mut stream, self.handshake()).await?;
            replies.iter().try_for_each(PcfMessage::check)?;
            debug!(address = %self.address, queue_manager = %self.config.queue_manager, "PCF connection established");
            *slot = Some(stream);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(CollectorError::internal("PCF connection missing"));
        };
        self.roundtrip(stream, request).await
    }

    async fn call(&self, cancel: &CancellationToken, request: PcfMessage) -> Result<Vec<PcfMessage>> {
        let mut slot = self.conn.lock().await;
        let timeout = self.config.timeout;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
            res = tokio::time::timeout(timeout, self.send(&mut *slot, request)) => {
                res.unwrap_or(Err(CollectorError::Timeout(timeout)))
            }
        };

        // A failed exchange leaves the stream in an unknown state.
        let responses = match result {
            Ok(responses) => responses,
            Err(err) => {
                if slot.take().is_some() {
                    warn!(address = %self.address, error = %err, "dropping PCF connection");
                }
                return Err(err);
            }
        };

        if let Err(err) = responses.iter().try_for_each(PcfMessage::check) {
            if err.is_retryable() && slot.take().is_some() {
                warn!(address = %self.address, error = %err, "dropping PCF connection");
            }
            return Err(err);
        }
        Ok(responses)
    }
}

#[async_trait]
impl PcfClient for TcpPcfClient {
    async fn inquire(
        &self,
        cancel: &CancellationToken,
        object: PcfObject,
        filter: &str,
    ) -> Result<Vec<Attributes>> {
        let mut request = PcfMessage::command(object.command());
        if let Some(param) = object.name_param() {
            request = request.with_param(param, PcfValue::Str(filter.to_string()));
        }
        let responses = self.call(cancel, request).await?;
        Ok(responses
            .iter()
            .map(PcfMessage::attributes)
            .filter(|attrs| !attrs.is_empty())
            .collect())
    }

    async fn reset_queue_stats(&self, cancel: &CancellationToken, queue: &str) -> Result<Attributes> {
        let request = PcfMessage::command(MQCMD_RESET_Q_STATS)
            .with_param(MQCA_Q_NAME, PcfValue::Str(queue.to_string()));
        let responses = self.call(cancel, request).await?;
        Ok(responses
            .iter()
            .flat_map(|r| r.params.iter().cloned())
            .collect())
    }

    async fn close(&self) {
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}
