//! Downstream sender protocol
//!
//! Every exchange opens a fresh TCP connection, writes one request frame and
//! reads one response frame:
//!
//! ```text
//! "ZBXD\x01" | u64 little-endian payload length | JSON payload
//! ```
//!
//! The request payload is `{"request":"sender data","data":[...],"clock":N,"ns":N}`
//! with the fields in exactly that order. The response payload is
//! `{"response":"success","info":"processed: N; failed: N; total: N; seconds spent: F"}`.

use crate::error::WireError;
use crate::stats::TrapStats;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const HEADER: &[u8; 5] = b"ZBXD\x01";

/// Upper bound on an accepted response payload
pub const MAX_RESPONSE_LEN: u64 = 16 * 1024 * 1024;

/// One downstream data item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub host: String,
    pub key: String,
    pub clock: i64,
    pub ns: u32,
    /// JSON-encoded variable map
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SenderRequest<T> {
    pub request: String,
    pub data: T,
    pub clock: i64,
    pub ns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderResponse {
    pub response: String,
    #[serde(default)]
    pub info: String,
}

/// Counters parsed out of the response `info` string
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryReport {
    pub processed: u64,
    pub failed: u64,
    pub seconds_spent: f64,
}

fn info_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"processed: (\d+); failed: (\d+); total: .*; seconds spent: (\d+\.\d+)")
            .expect("static pattern is valid")
    })
}

/// Parse the response `info` string; `None` when it does not match.
pub fn parse_info(info: &str) -> Option<DeliveryReport> {
    let captures = info_pattern().captures(info)?;
    Some(DeliveryReport {
        processed: captures[1].parse().ok()?,
        failed: captures[2].parse().ok()?,
        seconds_spent: captures[3].parse().ok()?,
    })
}

/// Wrap a JSON payload in a frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER.len() + 8 + payload.len());
    buf.extend_from_slice(HEADER);
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_request(items: &[DataItem], now: DateTime<Utc>) -> Result<Vec<u8>, WireError> {
    let request = SenderRequest {
        request: "sender data".to_string(),
        data: items,
        clock: now.timestamp(),
        ns: now.timestamp_subsec_nanos(),
    };
    Ok(frame(&serde_json::to_vec(&request)?))
}

/// Split a complete frame into its payload.
pub fn decode_frame(bytes: &[u8]) -> Result<&[u8], WireError> {
    if bytes.len() < HEADER.len() + 8 || &bytes[..HEADER.len()] != HEADER {
        return Err(WireError::BadHeader);
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[HEADER.len()..HEADER.len() + 8]);
    let len = u64::from_le_bytes(len);
    let body = &bytes[HEADER.len() + 8..];
    if (body.len() as u64) < len {
        return Err(WireError::BadHeader);
    }
    Ok(&body[..len as usize])
}

/// Read one frame from a stream and return its payload.
pub async fn read_frame<R>(reader: &mut R, max_len: u64) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    if &header != HEADER {
        return Err(WireError::BadHeader);
    }

    let mut len = [0u8; 8];
    reader.read_exact(&mut len).await?;
    let len = u64::from_le_bytes(len);
    if len > max_len {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> Result<SenderResponse, WireError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request).await?;
    stream.flush().await?;

    let payload = read_frame(&mut stream, MAX_RESPONSE_LEN).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Deliver one batch over a fresh connection.
///
/// Succeeds once a well-formed response frame arrives. Counters are updated
/// from the `info` string when it matches; a non-matching string is logged
/// and otherwise ignored.
pub async fn send_batch(
    addr: SocketAddr,
    items: &[DataItem],
    timeout: Duration,
    stats: &TrapStats,
) -> Result<Option<DeliveryReport>, WireError> {
    let request = encode_request(items, Utc::now())?;

    let response = tokio::time::timeout(timeout, exchange(addr, &request))
        .await
        .map_err(|_| WireError::Timeout(timeout))??;

    match parse_info(&response.info) {
        Some(report) => {
            debug!(
                %addr,
                processed = report.processed,
                failed = report.failed,
                "Batch of {} items acknowledged in {}s",
                items.len(),
                report.seconds_spent
            );
            stats.record_delivered(report.processed);
            stats.record_undelivered(report.failed);
            Ok(Some(report))
        }
        None => {
            warn!(%addr, response = %response.response, "Unrecognised info in sender response: {}", response.info);
            Ok(None)
        }
    }
}
