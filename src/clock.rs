//! Server clock-drift compensation for live playback.
//!
//! Live manifests describe segment availability in the *server's* wall-clock
//! time; a client whose clock is skewed will either request segments that do
//! not exist yet or lag behind the live edge. The [`ClockDrift`] service
//! periodically samples one of the manifest's `UTCTiming` sources and
//! publishes the signed offset `server_now - client_now` in microseconds as
//! a single atomic value. Readers tolerate a stale but monotonic value.
//!
//! Sampling succeeds rarely changes the offset by much, so a successful poll
//! reschedules itself slowly; a failure is retried quickly.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, TimeZone, Utc};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::fetch::{fetch_bytes, DownloadRequest, UriDownloader};
use crate::{StreamError, UtcTimingMethod, UtcTimingSource};

/// Interval between samples while the clock estimate is healthy.
pub const SLOW_CLOCK_UPDATE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Retry interval after a failed sample.
pub const FAST_CLOCK_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Difference in seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_TO_UNIX_EPOCH: u64 = 2_208_988_800;

const SNTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-global (per session) clock drift estimate with a single writer
/// task and any number of readers.
pub struct ClockDrift {
    sources: Vec<UtcTimingSource>,
    next_source: AtomicUsize,
    compensation_us: AtomicI64,
}

impl ClockDrift {
    /// Returns None when the playlist declares no timing source, in which
    /// case the client clock is trusted as-is.
    pub fn new(sources: Vec<UtcTimingSource>) -> Option<ClockDrift> {
        if sources.is_empty() {
            return None;
        }
        Some(ClockDrift {
            sources,
            next_source: AtomicUsize::new(0),
            compensation_us: AtomicI64::new(0),
        })
    }

    /// Signed `server_now - client_now` in microseconds.
    pub fn compensation_us(&self) -> i64 {
        self.compensation_us.load(Ordering::Relaxed)
    }

    /// The client's best estimate of the server's current wall-clock time.
    pub fn server_now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::microseconds(self.compensation_us())
    }

    /// Take one clock sample from the next source in round-robin order and
    /// publish the updated compensation. The caller schedules the next poll
    /// at [`SLOW_CLOCK_UPDATE_INTERVAL`] on success and
    /// [`FAST_CLOCK_UPDATE_INTERVAL`] on failure.
    pub async fn poll(&self, downloader: &dyn UriDownloader) -> Result<(), StreamError> {
        let index = self.next_source.fetch_add(1, Ordering::Relaxed) % self.sources.len();
        let source = &self.sources[index];
        let before = Utc::now();
        let server_time = sample_source(source, downloader).await?;
        let after = Utc::now();
        let compensation = compute_compensation(server_time, before, after);
        self.compensation_us.store(compensation, Ordering::Relaxed);
        debug!(
            method = ?source.method,
            compensation_us = compensation,
            "updated clock compensation"
        );
        Ok(())
    }
}

/// The server stamped its reply roughly mid-transfer, so correct the raw
/// offset by half the measured round trip.
pub fn compute_compensation(
    server_time: DateTime<Utc>,
    client_before: DateTime<Utc>,
    client_after: DateTime<Utc>,
) -> i64 {
    let rtt = client_after - client_before;
    let raw = server_time - client_after;
    (raw + rtt / 2).num_microseconds().unwrap_or(0)
}

async fn sample_source(
    source: &UtcTimingSource,
    downloader: &dyn UriDownloader,
) -> Result<DateTime<Utc>, StreamError> {
    let url = source
        .urls
        .first()
        .ok_or_else(|| StreamError::Other(String::from("UTCTiming source without URL")))?;
    match source.method {
        UtcTimingMethod::Ntp => sntp_query(url).await,
        UtcTimingMethod::HttpHead => http_head_date(url, downloader).await,
        UtcTimingMethod::HttpXsdate | UtcTimingMethod::HttpIso => {
            let body = http_body(url, downloader).await?;
            let text = std::str::from_utf8(&body)
                .map_err(|e| StreamError::Parsing(format!("clock body not UTF-8: {e}")))?;
            parse_iso_datetime(text.trim())
        }
        UtcTimingMethod::HttpNtp => {
            let body = http_body(url, downloader).await?;
            parse_ntp_timestamp(&body)
        }
    }
}

async fn http_body(
    url: &str,
    downloader: &dyn UriDownloader,
) -> Result<bytes::Bytes, StreamError> {
    let uri = url::Url::parse(url)
        .map_err(|e| StreamError::Parsing(format!("UTCTiming URL {url}: {e}")))?;
    let (_, body) =
        fetch_bytes(downloader, DownloadRequest::new(uri).with_refresh(true)).await?;
    Ok(body)
}

async fn http_head_date(
    url: &str,
    downloader: &dyn UriDownloader,
) -> Result<DateTime<Utc>, StreamError> {
    let uri = url::Url::parse(url)
        .map_err(|e| StreamError::Parsing(format!("UTCTiming URL {url}: {e}")))?;
    let (meta, _) =
        fetch_bytes(downloader, DownloadRequest::new(uri).with_refresh(true)).await?;
    let date = meta
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("date"))
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| StreamError::Parsing(format!("{url}: response without Date header")))?;
    DateTime::parse_from_rfc2822(date)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StreamError::Parsing(format!("Date header {date}: {e}")))
}

fn parse_iso_datetime(s: &str) -> Result<DateTime<Utc>, StreamError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Some servers omit the timezone designator; treat as UTC.
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| StreamError::Parsing(format!("ISO 8601 timestamp {s}: {e}")))
}

/// An 8-byte NTP timestamp (RFC 5905): 32-bit seconds since 1900 and 32-bit
/// binary fraction.
fn parse_ntp_timestamp(body: &[u8]) -> Result<DateTime<Utc>, StreamError> {
    if body.len() != 8 {
        return Err(StreamError::Parsing(format!(
            "http-ntp body is {} bytes, expected 8",
            body.len()
        )));
    }
    let seconds = BigEndian::read_u32(body) as u64;
    let fraction = BigEndian::read_u32(&body[4..]) as u64;
    ntp_to_datetime(seconds, fraction)
}

fn ntp_to_datetime(seconds: u64, fraction: u64) -> Result<DateTime<Utc>, StreamError> {
    let unix_secs = seconds
        .checked_sub(NTP_TO_UNIX_EPOCH)
        .ok_or_else(|| StreamError::Parsing(String::from("NTP timestamp before Unix epoch")))?;
    let micros = fraction * 1_000_000 >> 32;
    Utc.timestamp_opt(unix_secs as i64, (micros * 1000) as u32)
        .single()
        .ok_or_else(|| StreamError::Parsing(String::from("NTP timestamp out of range")))
}

/// Minimal SNTP client query against the first resolved address of the
/// server (RFC 5905 client mode, one exchange).
async fn sntp_query(server: &str) -> Result<DateTime<Utc>, StreamError> {
    let mut addrs = tokio::net::lookup_host((server, 123))
        .await
        .map_err(|e| StreamError::Network(format!("resolving NTP server {server}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| StreamError::Network(format!("NTP server {server} did not resolve")))?;
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| StreamError::Io(e, String::from("binding NTP socket")))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| StreamError::Io(e, String::from("connecting NTP socket")))?;

    let mut packet = [0u8; 48];
    packet[0] = 0x1b; // LI = 0, VN = 3, mode = 3 (client)
    socket
        .send(&packet)
        .await
        .map_err(|e| StreamError::Io(e, String::from("sending NTP request")))?;
    let received = tokio::time::timeout(SNTP_TIMEOUT, socket.recv(&mut packet))
        .await
        .map_err(|_| StreamError::Network(format!("NTP server {server} timed out")))?
        .map_err(|e| StreamError::Io(e, String::from("receiving NTP response")))?;
    if received < 48 {
        return Err(StreamError::Network(format!(
            "short NTP response ({received} bytes) from {server}"
        )));
    }
    // Transmit timestamp field.
    let seconds = BigEndian::read_u32(&packet[40..44]) as u64;
    let fraction = BigEndian::read_u32(&packet[44..48]) as u64;
    let when = ntp_to_datetime(seconds, fraction)?;
    warn_if_unsynchronised(&packet, server);
    Ok(when)
}

fn warn_if_unsynchronised(packet: &[u8], server: &str) {
    // Stratum 0 marks a "kiss-o'-death" or unsynchronised server.
    if packet[1] == 0 {
        warn!("NTP server {server} reports stratum 0; clock sample may be wrong");
    }
}
