//! Error types for TrapRelay
//!
//! Each component boundary gets its own error enum. Errors never cross a
//! pipeline stage: the stage that hits one logs it, updates counters and
//! carries on with the next item.

use std::path::PathBuf;
use thiserror::Error;

/// Rule table file errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rule file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("line {line}: expected at least {expected} ';'-separated fields")]
    MissingFields { line: usize, expected: usize },

    #[error("line {line}: empty OID")]
    EmptyOid { line: usize },
}

/// Host/proxy registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("host {host} on instance {instance} not found")]
    HostNotFound { host: String, instance: String },

    #[error("proxy {0} is not registered")]
    UnknownProxy(String),

    #[error("outbound queue of proxy {0} is closed")]
    QueueClosed(String),
}

/// Downstream protocol errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad header")]
    BadHeader,

    #[error("frame of {0} bytes exceeds the allowed maximum")]
    FrameTooLarge(u64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Cluster peer transport errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("HTTP error talking to peer: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer {peer} answered with status {status}")]
    Status { peer: String, status: u16 },

    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("invalid peer URL: {0}")]
    Url(String),
}

/// SNMP packet decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),

    #[error("unexpected tag 0x{found:02x} at offset {offset}, expected 0x{expected:02x}")]
    UnexpectedTag { offset: usize, expected: u8, found: u8 },

    #[error("unsupported length encoding at offset {0}")]
    BadLength(usize),

    #[error("unsupported SNMP version {0}")]
    UnsupportedVersion(i64),

    #[error("unsupported PDU type 0x{0:02x}")]
    UnsupportedPdu(u8),

    #[error("malformed OID")]
    BadOid,

    #[error("generic trap type {0} out of range")]
    BadGenericTrap(i64),

    #[error("unsupported security model {0}")]
    UnsupportedSecurityModel(i64),

    #[error("SNMPv3 message received but no USM user is configured")]
    NoUsmUser,

    #[error("unknown USM user {0:?}")]
    UnknownUser(String),

    #[error("unauthenticated message for a user that requires authentication")]
    Unauthenticated,

    #[error("message authentication failed")]
    AuthenticationFailed,

    #[error("encrypted scoped PDUs are not supported")]
    EncryptedPdu,
}

/// Directory source errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("instance {0} is not configured")]
    UnknownInstance(String),

    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// TLS material errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client verifier error: {0}")]
    Verifier(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}
