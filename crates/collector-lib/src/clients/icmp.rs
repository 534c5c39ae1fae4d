//! ICMP echo prober
//!
//! Unprivileged probes use datagram ICMP sockets (Linux `ping_group_range`),
//! privileged probes use raw sockets. Socket work is blocking and runs on the
//! blocking pool; the async side only resolves the host and waits.

use crate::config::decode;
use crate::error::{CollectorError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const ICMP_HEADER_LEN: usize = 8;
const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;
const RECV_BUFFER_LEN: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_packets")]
    pub packets: u32,

    #[serde(default = "default_interval", with = "decode::duration")]
    pub interval: Duration,

    /// Wait for each reply
    #[serde(default = "default_timeout", with = "decode::duration")]
    pub timeout: Duration,

    #[serde(default)]
    pub privileged: bool,
}

fn default_packets() -> u32 {
    5
}

fn default_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            packets: default_packets(),
            interval: default_interval(),
            timeout: default_timeout(),
            privileged: false,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.packets == 0 {
            return Err(CollectorError::config("packets must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(CollectorError::config("probe timeout must be positive"));
        }
        Ok(())
    }

    /// Upper bound for one probe run
    pub fn max_duration(&self) -> Duration {
        (self.interval + self.timeout) * self.packets
    }
}

/// Outcome of one probe run against one host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeStats {
    pub sent: u32,
    pub received: u32,
    /// Percent in [0, 100]
    pub loss: f64,
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
    pub stddev: Duration,
}

impl ProbeStats {
    pub fn from_rtts(sent: u32, rtts: &[Duration]) -> Self {
        let received = rtts.len() as u32;
        let loss = if sent == 0 {
            0.0
        } else {
            f64::from(sent.saturating_sub(received)) * 100.0 / f64::from(sent)
        };

        if rtts.is_empty() {
            return Self {
                sent,
                received,
                loss,
                ..Default::default()
            };
        }

        let secs: Vec<f64> = rtts.iter().map(Duration::as_secs_f64).collect();
        let mean = secs.iter().sum::<f64>() / secs.len() as f64;
        let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / secs.len() as f64;

        Self {
            sent,
            received,
            loss,
            min: rtts.iter().copied().min().unwrap_or_default(),
            avg: Duration::from_secs_f64(mean),
            max: rtts.iter().copied().max().unwrap_or_default(),
            stddev: Duration::from_secs_f64(variance.sqrt()),
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, cancel: &CancellationToken, host: &str) -> Result<ProbeStats>;
}

pub struct IcmpProber {
    config: ProbeConfig,
}

impl IcmpProber {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, cancel: &CancellationToken, host: &str) -> Result<ProbeStats> {
        let ip = resolve(host).await?;
        let config = self.config.clone();
        let stop = cancel.clone();
        let task = tokio::task::spawn_blocking(move || probe_blocking(ip, &config, &stop));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
            joined = task => joined
                .map_err(|e| CollectorError::internal(format!("probe task failed: {e}")))?,
        }
    }
}

async fn resolve(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| CollectorError::unavailable(format!("resolve {host}: {e}")))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| CollectorError::unavailable(format!("resolve {host}: no addresses")))
}

fn open_socket(ip: IpAddr, privileged: bool) -> Result<Socket> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let ty = if privileged { Type::RAW } else { Type::DGRAM };
    Socket::new(domain, ty, Some(protocol)).map_err(|e| {
        CollectorError::config(format!(
            "open ICMP socket (privileged={privileged}): {e}"
        ))
    })
}

fn probe_blocking(ip: IpAddr, config: &ProbeConfig, stop: &CancellationToken) -> Result<ProbeStats> {
    let socket = open_socket(ip, config.privileged)?;
    let target = SockAddr::from(SocketAddr::new(ip, 0));
    let v6 = ip.is_ipv6();
    // Raw IPv4 sockets deliver the IP header too.
    let skip_ip_header = config.privileged && !v6;

    let identifier: u16 = rand::random();
    let token: u64 = rand::random();
    let mut rtts = Vec::with_capacity(config.packets as usize);
    let mut sent = 0;
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    for seq in 0..config.packets as u16 {
        if stop.is_cancelled() {
            return Err(CollectorError::Cancelled);
        }
        if seq > 0 && !config.interval.is_zero() {
            std::thread::sleep(config.interval);
        }

        let packet = build_echo_request(v6, identifier, seq, token);
        let started = Instant::now();
        sent += 1;
        if let Err(e) = socket.send_to(&packet, &target) {
            // Unreachable networks count as loss.
            debug!(%ip, seq, error = %e, "ICMP send failed");
            continue;
        }

        let deadline = started + config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket.set_read_timeout(Some(remaining))?;
            let n = match (&socket).read(&mut buf) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    break
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(%ip, seq, error = %e, "ICMP receive failed");
                    break;
                }
            };

            let Some(reply) = parse_echo_reply(&buf[..n], v6, skip_ip_header) else {
                continue;
            };
            // Datagram sockets rewrite the identifier, so only raw sockets check it.
            let ours = reply.sequence == seq
                && reply.token == Some(token)
                && (!config.privileged || reply.identifier == identifier);
            if ours {
                rtts.push(started.elapsed());
                break;
            }
        }
    }

    Ok(ProbeStats::from_rtts(sent, &rtts))
}

/// RFC 1071 internet checksum
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub(crate) fn build_echo_request(v6: bool, identifier: u16, sequence: u16, token: u64) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ICMP_HEADER_LEN + 8);
    packet.push(if v6 { ECHO_REQUEST_V6 } else { ECHO_REQUEST_V4 });
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(&token.to_be_bytes());
    // The kernel fills in ICMPv6 checksums.
    if !v6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
    pub token: Option<u64>,
}

pub(crate) fn parse_echo_reply(data: &[u8], v6: bool, skip_ip_header: bool) -> Option<EchoReply> {
    let data = if skip_ip_header {
        let ihl = usize::from(*data.first()? & 0x0f) * 4;
        data.get(ihl..)?
    } else {
        data
    };
    if data.len() < ICMP_HEADER_LEN {
        return None;
    }
    let expected = if v6 { ECHO_REPLY_V6 } else { ECHO_REPLY_V4 };
    if data[0] != expected {
        return None;
    }
    let token = data
        .get(ICMP_HEADER_LEN..ICMP_HEADER_LEN + 8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_be_bytes);
    Some(EchoReply {
        identifier: u16::from_be_bytes([data[4], data[5]]),
        sequence: u16::from_be_bytes([data[6], data[7]]),
        token,
    })
}
