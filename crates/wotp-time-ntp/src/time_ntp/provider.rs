//! Reference time providers.
//!
//! `ReferenceTimeProvider` is the seam the time source measures against.
//! `SntpProvider` implements it with a minimal RFC 4330 client: one
//! 48-byte request per server, reading the server's receive and transmit
//! timestamps from the reply. Servers are tried in order starting from the
//! last one that answered.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::time_ntp::clock::{Clock, SystemClock};
use crate::time_ntp::types::*;

const NTP_PACKET_LEN: usize = 48;
/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;
/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x1B;
const MODE_SERVER: u8 = 4;
const LEAP_ALARM: u8 = 3;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Something that can be asked for the current reference time.
#[async_trait]
pub trait ReferenceTimeProvider: Send + Sync {
    /// Perform one round-trip measurement.
    async fn query(&self) -> Result<ReferenceSample, SyncError>;
}

#[async_trait]
impl<P: ReferenceTimeProvider + ?Sized> ReferenceTimeProvider for Arc<P> {
    async fn query(&self) -> Result<ReferenceSample, SyncError> {
        (**self).query().await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SNTP client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SNTP client over a rotating list of servers.
///
/// Server entries are `host` or `host:port`; bare hosts use `port`.
#[derive(Debug)]
pub struct SntpProvider {
    servers: Vec<String>,
    port: u16,
    per_server_timeout: Duration,
    clock: Arc<dyn Clock>,
    preferred: AtomicUsize,
}

impl Default for SntpProvider {
    fn default() -> Self {
        Self::new(DEFAULT_NTP_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

impl SntpProvider {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            port: NTP_PORT,
            per_server_timeout: Duration::from_secs(1),
            clock: Arc::new(SystemClock),
            preferred: AtomicUsize::new(0),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// How long to wait for a single server before moving to the next one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_server_timeout = timeout;
        self
    }

    /// Local clock used to timestamp requests and replies.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    fn endpoint(&self, server: &str) -> (String, u16) {
        match server.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(p) => (host.to_string(), p),
                Err(_) => (server.to_string(), self.port),
            },
            None => (server.to_string(), self.port),
        }
    }

    async fn query_server(&self, server: &str) -> Result<ReferenceSample, SyncError> {
        let io_err = |source: std::io::Error| SyncError::Io {
            server: server.to_string(),
            source,
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io_err)?;
        let (host, port) = self.endpoint(server);
        socket.connect((host.as_str(), port)).await.map_err(io_err)?;

        let mut request = [0u8; NTP_PACKET_LEN];
        request[0] = CLIENT_HEADER;

        let sent_at = self.clock.now();
        socket.send(&request).await.map_err(io_err)?;

        let mut reply = [0u8; 512];
        let len = tokio::time::timeout(self.per_server_timeout, socket.recv(&mut reply))
            .await
            .map_err(|_| SyncError::Timeout(self.per_server_timeout))?
            .map_err(io_err)?;
        let received_at = self.clock.now();

        let (server_receive, server_transmit) =
            parse_reply(&reply[..len]).map_err(|reason| SyncError::InvalidReply {
                server: server.to_string(),
                reason,
            })?;

        let processing = (server_transmit - server_receive).max(0.0);
        let round_trip = ((received_at - sent_at) - processing).max(0.0);

        Ok(ReferenceSample {
            reference_time: server_transmit,
            round_trip,
            received_at,
            server: Some(server.to_string()),
        })
    }
}

#[async_trait]
impl ReferenceTimeProvider for SntpProvider {
    async fn query(&self) -> Result<ReferenceSample, SyncError> {
        if self.servers.is_empty() {
            return Err(SyncError::NoServers);
        }

        let count = self.servers.len();
        let start = self.preferred.load(Ordering::Relaxed) % count;
        let mut last_err = None;

        for step in 0..count {
            let idx = (start + step) % count;
            let server = &self.servers[idx];
            match self.query_server(server).await {
                Ok(sample) => {
                    self.preferred.store(idx, Ordering::Relaxed);
                    debug!(
                        "NTP reply from {}: rtt {:.1} ms, offset {:.1} ms",
                        server,
                        sample.round_trip * 1000.0,
                        sample.offset() * 1000.0
                    );
                    return Ok(sample);
                }
                Err(e) => {
                    warn!("NTP query to {} failed: {}", server, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(SyncError::NoServers))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Wire format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract `(receive, transmit)` unix timestamps from a server reply.
fn parse_reply(buf: &[u8]) -> Result<(f64, f64), String> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(format!("short packet ({} bytes)", buf.len()));
    }

    let leap = buf[0] >> 6;
    let mode = buf[0] & 0x07;
    let stratum = buf[1];

    if mode != MODE_SERVER {
        return Err(format!("unexpected mode {}", mode));
    }
    if leap == LEAP_ALARM {
        return Err("server clock not synchronised".into());
    }
    if stratum == 0 {
        return Err("kiss-o'-death reply".into());
    }

    let receive = read_timestamp(&buf[32..40]);
    let transmit = read_timestamp(&buf[40..48]);
    match (receive, transmit) {
        (Some(r), Some(t)) => Ok((r, t)),
        (None, Some(t)) => Ok((t, t)),
        (_, None) => Err("zero transmit timestamp".into()),
    }
}

/// 64-bit NTP timestamp (32.32 fixed point, era 0) as unix seconds.
fn read_timestamp(b: &[u8]) -> Option<f64> {
    let secs = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    let frac = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
    if secs == 0 && frac == 0 {
        return None;
    }
    Some(secs as f64 - NTP_UNIX_OFFSET + frac as f64 / 4_294_967_296.0)
}

#[cfg(test)]
pub(crate) fn encode_timestamp(unix_seconds: f64) -> [u8; 8] {
    let ntp = unix_seconds + NTP_UNIX_OFFSET;
    let secs = ntp.floor() as u32;
    let frac = ((ntp - ntp.floor()) * 4_294_967_296.0) as u32;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&frac.to_be_bytes());
    out
}
