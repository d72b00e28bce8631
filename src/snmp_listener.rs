//! SNMP Trap Listener for TrapRelay
//!
//! Receives traps on a UDP socket, decodes SNMPv1 Trap-PDUs, SNMPv2c
//! SNMPv2-Trap/InformRequest PDUs and SNMPv3 messages from the configured USM
//! user, and queues them for the filter as [`RawTrap`]s. v1 traps are
//! rewritten into the v2 layout (sysUpTime.0 first, snmpTrapOID.0 second) so
//! the rest of the pipeline sees a single shape.
//!
//! SNMPv3 messages must carry the configured user name. Authenticated
//! messages are checked with HMAC-SHA-96; unauthenticated ones are only
//! accepted when the user's level is `NoAuthNoPriv`. Encrypted scoped PDUs
//! are rejected.
//!
//! The receive loop never blocks on the pipeline: when the filter's queue is
//! full the packet is dropped with a warning.

use crate::config::ListenerConfig;
use crate::credentials::CredentialStore;
use crate::error::DecodeError;
use crate::stats::TrapStats;
use crate::trap::{RawTrap, SnmpVersion, VarBind, SNMP_TRAP_OID, SYS_UPTIME_OID};
use crate::usm::UsmUser;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const SEQUENCE: u8 = 0x30;
    pub const IP_ADDRESS: u8 = 0x40;
    pub const COUNTER32: u8 = 0x41;
    pub const GAUGE32: u8 = 0x42;
    pub const TIMETICKS: u8 = 0x43;
    pub const OPAQUE: u8 = 0x44;
    pub const COUNTER64: u8 = 0x46;
    pub const NO_SUCH_OBJECT: u8 = 0x80;
    pub const NO_SUCH_INSTANCE: u8 = 0x81;
    pub const END_OF_MIB_VIEW: u8 = 0x82;
    pub const TRAP_V1: u8 = 0xa4;
    pub const INFORM: u8 = 0xa6;
    pub const TRAP_V2: u8 = 0xa7;
}

/// Generic v1 traps map onto snmpTraps.(generic + 1)
const SNMP_TRAPS_PREFIX: &str = ".1.3.6.1.6.3.1.1.5";
const ENTERPRISE_SPECIFIC: i64 = 6;

const USM_SECURITY_MODEL: i64 = 3;
const FLAG_AUTH: u8 = 0x01;
const FLAG_PRIV: u8 = 0x02;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, base: 0 }
    }

    fn nested(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(DecodeError::Truncated(self.offset()))?;
        self.pos += 1;
        Ok(b)
    }

    fn length(&mut self) -> Result<usize, DecodeError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 4 {
            return Err(DecodeError::BadLength(self.offset() - 1));
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | self.byte()? as usize;
        }
        Ok(len)
    }

    /// Read one TLV; returns its tag, contents and the contents' absolute offset.
    fn tlv(&mut self) -> Result<(u8, &'a [u8], usize), DecodeError> {
        let tag = self.byte()?;
        let len = self.length()?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated(self.offset()))?;
        self.pos = end;
        Ok((tag, &self.data[start..end], self.base + start))
    }

    fn expect(&mut self, expected: u8) -> Result<(&'a [u8], usize), DecodeError> {
        let offset = self.offset();
        let (found, contents, at) = self.tlv()?;
        if found != expected {
            return Err(DecodeError::UnexpectedTag { offset, expected, found });
        }
        Ok((contents, at))
    }

    fn sequence(&mut self, expected: u8) -> Result<Reader<'a>, DecodeError> {
        let (contents, at) = self.expect(expected)?;
        Ok(Reader::nested(contents, at))
    }

    fn integer(&mut self) -> Result<i64, DecodeError> {
        let (contents, at) = self.expect(tag::INTEGER)?;
        decode_signed(contents).ok_or(DecodeError::BadLength(at))
    }
}

fn decode_signed(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for b in bytes {
        value = (value << 8) | *b as i64;
    }
    Some(value)
}

fn decode_unsigned(bytes: &[u8]) -> Option<u64> {
    let bytes = match bytes {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => bytes,
    };
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

/// Render BER OID contents as a dotted string with a leading `.`.
fn decode_oid(bytes: &[u8]) -> Result<String, DecodeError> {
    let mut arcs: Vec<u64> = Vec::new();
    let mut current = 0u64;
    let mut pending = false;

    for b in bytes {
        if current > (u64::MAX >> 7) {
            return Err(DecodeError::BadOid);
        }
        current = (current << 7) | (b & 0x7f) as u64;
        pending = true;
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let (first, second) = match current {
                    0..=39 => (0, current),
                    40..=79 => (1, current - 40),
                    _ => (2, current - 80),
                };
                arcs.push(first);
                arcs.push(second);
            } else {
                arcs.push(current);
            }
            current = 0;
            pending = false;
        }
    }

    if arcs.is_empty() || pending {
        return Err(DecodeError::BadOid);
    }
    Ok(arcs.iter().map(|arc| format!(".{}", arc)).collect())
}

fn render_octets(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|c| !c.is_control() || c.is_whitespace()) => text.to_string(),
        _ => bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn render_ip(bytes: &[u8], at: usize) -> Result<String, DecodeError> {
    let octets: [u8; 4] = bytes.try_into().map_err(|_| DecodeError::BadLength(at))?;
    Ok(IpAddr::from(octets).to_string())
}

/// Decode one binding value into its type name and rendered text.
fn decode_value(tag: u8, contents: &[u8], at: usize) -> Result<(&'static str, String), DecodeError> {
    let unsigned = |name: &'static str| {
        decode_unsigned(contents)
            .map(|v| (name, v.to_string()))
            .ok_or(DecodeError::BadLength(at))
    };

    match tag {
        tag::INTEGER => decode_signed(contents)
            .map(|v| ("Integer", v.to_string()))
            .ok_or(DecodeError::BadLength(at)),
        tag::OCTET_STRING => Ok(("OctetString", render_octets(contents))),
        tag::NULL => Ok(("Null", String::new())),
        tag::OID => Ok(("ObjectIdentifier", decode_oid(contents)?)),
        tag::IP_ADDRESS => Ok(("IpAddress", render_ip(contents, at)?)),
        tag::COUNTER32 => unsigned("Counter32"),
        tag::GAUGE32 => unsigned("Gauge32"),
        tag::TIMETICKS => unsigned("TimeTicks"),
        tag::COUNTER64 => unsigned("Counter64"),
        tag::OPAQUE => Ok(("Opaque", render_octets(contents))),
        tag::NO_SUCH_OBJECT => Ok(("NoSuchObject", String::new())),
        tag::NO_SUCH_INSTANCE => Ok(("NoSuchInstance", String::new())),
        tag::END_OF_MIB_VIEW => Ok(("EndOfMibView", String::new())),
        other => Ok(("Unknown", format!("tag 0x{:02x}: {}", other, render_octets(contents)))),
    }
}

fn decode_bindings(reader: &mut Reader<'_>) -> Result<Vec<VarBind>, DecodeError> {
    let mut list = reader.sequence(tag::SEQUENCE)?;
    let mut bindings = Vec::new();

    while !list.is_empty() {
        let mut binding = list.sequence(tag::SEQUENCE)?;
        let (oid, _) = binding.expect(tag::OID)?;
        let oid = decode_oid(oid)?;
        let (value_tag, contents, at) = binding.tlv()?;
        let (value_type, value) = decode_value(value_tag, contents, at)?;
        bindings.push(VarBind::new(oid, value_type, value));
    }
    Ok(bindings)
}

/// v1 Trap-PDU, rewritten into the v2 binding layout.
fn decode_v1_pdu(pdu: &mut Reader<'_>) -> Result<Vec<VarBind>, DecodeError> {
    let (enterprise, _) = pdu.expect(tag::OID)?;
    let enterprise = decode_oid(enterprise)?;
    let (agent, at) = pdu.expect(tag::IP_ADDRESS)?;
    render_ip(agent, at)?;
    let generic = pdu.integer()?;
    let specific = pdu.integer()?;
    let (ticks, at) = pdu.expect(tag::TIMETICKS)?;
    let ticks = decode_unsigned(ticks).ok_or(DecodeError::BadLength(at))?;

    let trap_oid = match generic {
        ENTERPRISE_SPECIFIC => format!("{}.0.{}", enterprise, specific),
        0..=5 => format!("{}.{}", SNMP_TRAPS_PREFIX, generic + 1),
        other => return Err(DecodeError::BadGenericTrap(other)),
    };

    let mut bindings = vec![
        VarBind::new(SYS_UPTIME_OID, "TimeTicks", ticks.to_string()),
        VarBind::new(SNMP_TRAP_OID, "ObjectIdentifier", trap_oid),
    ];
    bindings.extend(decode_bindings(pdu)?);
    Ok(bindings)
}

fn decode_v2_pdu(pdu: &mut Reader<'_>) -> Result<Vec<VarBind>, DecodeError> {
    let _request_id = pdu.integer()?;
    let _error_status = pdu.integer()?;
    let _error_index = pdu.integer()?;
    decode_bindings(pdu)
}

/// SNMPv3 message after the version field: header, USM parameters, scoped PDU.
fn decode_v3_message(
    message: &mut Reader<'_>,
    whole: &[u8],
    usm: Option<&UsmUser>,
) -> Result<Vec<VarBind>, DecodeError> {
    let mut global = message.sequence(tag::SEQUENCE)?;
    let _msg_id = global.integer()?;
    let _max_size = global.integer()?;
    let (flags, at) = global.expect(tag::OCTET_STRING)?;
    let flags = *flags.first().ok_or(DecodeError::BadLength(at))?;
    let model = global.integer()?;
    if model != USM_SECURITY_MODEL {
        return Err(DecodeError::UnsupportedSecurityModel(model));
    }

    let (params, at) = message.expect(tag::OCTET_STRING)?;
    let mut params = Reader::nested(params, at).sequence(tag::SEQUENCE)?;
    let (engine_id, _) = params.expect(tag::OCTET_STRING)?;
    let _engine_boots = params.integer()?;
    let _engine_time = params.integer()?;
    let (user, _) = params.expect(tag::OCTET_STRING)?;
    let (digest, digest_at) = params.expect(tag::OCTET_STRING)?;
    let _privacy = params.expect(tag::OCTET_STRING)?;

    let usm = usm.ok_or(DecodeError::NoUsmUser)?;
    if user != usm.name().as_bytes() {
        return Err(DecodeError::UnknownUser(String::from_utf8_lossy(user).into_owned()));
    }
    if flags & FLAG_PRIV != 0 {
        return Err(DecodeError::EncryptedPdu);
    }
    if flags & FLAG_AUTH != 0 {
        usm.verify(whole, digest_at, digest, engine_id)?;
    } else if usm.requires_auth() {
        return Err(DecodeError::Unauthenticated);
    }

    let mut scoped = message.sequence(tag::SEQUENCE)?;
    let _context_engine = scoped.expect(tag::OCTET_STRING)?;
    let _context_name = scoped.expect(tag::OCTET_STRING)?;
    let (pdu_tag, contents, at) = scoped.tlv()?;
    match pdu_tag {
        tag::TRAP_V2 | tag::INFORM => decode_v2_pdu(&mut Reader::nested(contents, at)),
        other => Err(DecodeError::UnsupportedPdu(other)),
    }
}

/// Decode one UDP payload into a raw trap. `usm` is the user SNMPv3 messages are checked against.
pub fn decode_packet(
    data: &[u8],
    source: IpAddr,
    received_at: DateTime<Utc>,
    usm: Option<&UsmUser>,
) -> Result<RawTrap, DecodeError> {
    let (body, at) = Reader::new(data).expect(tag::SEQUENCE)?;
    let whole = &data[..at + body.len()];
    let mut message = Reader::nested(body, at);

    let version = match message.integer()? {
        0 => SnmpVersion::V1,
        1 => SnmpVersion::V2c,
        3 => {
            let bindings = decode_v3_message(&mut message, whole, usm)?;
            return Ok(RawTrap {
                received_at,
                source,
                version: SnmpVersion::V3,
                community: None,
                bindings,
            });
        }
        other => return Err(DecodeError::UnsupportedVersion(other)),
    };
    let (community, _) = message.expect(tag::OCTET_STRING)?;
    let community = String::from_utf8_lossy(community).into_owned();

    let pdu_offset = message.offset();
    let (pdu_tag, contents, at) = message.tlv()?;
    let mut pdu = Reader::nested(contents, at);

    let bindings = match (version, pdu_tag) {
        (SnmpVersion::V1, tag::TRAP_V1) => decode_v1_pdu(&mut pdu)?,
        (SnmpVersion::V2c, tag::TRAP_V2 | tag::INFORM) => decode_v2_pdu(&mut pdu)?,
        (_, other) => {
            debug!(offset = pdu_offset, "Ignoring non-trap PDU");
            return Err(DecodeError::UnsupportedPdu(other));
        }
    };

    Ok(RawTrap {
        received_at,
        source,
        version,
        community: Some(community),
        bindings,
    })
}

pub struct SnmpListener {
    config: ListenerConfig,
    tx: mpsc::Sender<RawTrap>,
    stats: Arc<TrapStats>,
    credentials: Arc<CredentialStore>,
}

impl SnmpListener {
    pub fn new(
        config: ListenerConfig,
        tx: mpsc::Sender<RawTrap>,
        stats: Arc<TrapStats>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            config,
            tx,
            stats,
            credentials,
        }
    }

    /// Bind the trap socket. Failure here is fatal to the process.
    pub async fn bind(&self) -> Result<UdpSocket> {
        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind trap listener to {}", bind_addr))?;
        info!("SNMP listener bound to {}", bind_addr);
        Ok(socket)
    }

    pub async fn run(self, socket: UdpSocket) {
        let mut buffer = vec![0u8; self.config.max_packet_size];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, src_addr)) => self.handle_packet(&buffer[..len], src_addr),
                Err(e) => error!("Failed to receive UDP packet: {}", e),
            }
        }
    }

    fn handle_packet(&self, data: &[u8], src_addr: SocketAddr) {
        let usm = self.credentials.usm_user();
        let trap = match decode_packet(data, src_addr.ip(), Utc::now(), usm.as_deref()) {
            Ok(trap) => trap,
            Err(
                e @ (DecodeError::NoUsmUser
                | DecodeError::UnknownUser(_)
                | DecodeError::Unauthenticated
                | DecodeError::AuthenticationFailed
                | DecodeError::EncryptedPdu),
            ) => {
                warn!(source = %src_addr, "SNMPv3 message rejected: {}", e);
                return;
            }
            Err(e) => {
                debug!(source = %src_addr, len = data.len(), "Undecodable SNMP packet: {}", e);
                return;
            }
        };

        self.stats.record_received();
        match self.tx.try_send(trap) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(source = %src_addr, "Filter queue full, trap dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Filter queue closed, trap dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::usm::{AuthLevel, AUTH_DIGEST_LEN};

    fn tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if contents.len() < 0x80 {
            out.push(contents.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(contents.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(contents);
        out
    }

    fn int(value: i64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 7
            && ((bytes[start] == 0 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0))
        {
            start += 1;
        }
        tlv(tag::INTEGER, &bytes[start..])
    }

    fn oid(dotted: &str) -> Vec<u8> {
        let arcs: Vec<u64> = dotted.trim_start_matches('.').split('.').map(|a| a.parse().unwrap()).collect();
        let mut out = vec![(arcs[0] * 40 + arcs[1]) as u8];
        for arc in &arcs[2..] {
            let mut chunk = vec![(*arc & 0x7f) as u8];
            let mut rest = *arc >> 7;
            while rest > 0 {
                chunk.insert(0, (rest & 0x7f) as u8 | 0x80);
                rest >>= 7;
            }
            out.extend(chunk);
        }
        tlv(tag::OID, &out)
    }

    fn binding(name: &str, value: Vec<u8>) -> Vec<u8> {
        tlv(tag::SEQUENCE, &[oid(name), value].concat())
    }

    fn message(version: i64, community: &str, pdu: Vec<u8>) -> Vec<u8> {
        tlv(
            tag::SEQUENCE,
            &[int(version), tlv(tag::OCTET_STRING, community.as_bytes()), pdu].concat(),
        )
    }

    fn source() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    #[test]
    fn decodes_v2c_trap() {
        let bindings = [
            binding(SYS_UPTIME_OID, tlv(tag::TIMETICKS, &[0x01, 0x00])),
            binding(SNMP_TRAP_OID, oid(".1.3.6.1.6.3.1.1.5.3")),
            binding(".1.3.6.1.2.1.2.2.1.1.7", int(7)),
            binding(".1.3.6.1.2.1.2.2.1.2.7", tlv(tag::OCTET_STRING, b"ge-0/0/7")),
        ]
        .concat();
        let pdu = tlv(
            tag::TRAP_V2,
            &[int(4242), int(0), int(0), tlv(tag::SEQUENCE, &bindings)].concat(),
        );
        let packet = message(1, "public", pdu);

        let trap = decode_packet(&packet, source(), Utc::now(), None).unwrap();
        assert_eq!(trap.version, SnmpVersion::V2c);
        assert_eq!(trap.community.as_deref(), Some("public"));
        assert_eq!(trap.leading_oid(), Some(".1.3.6.1.6.3.1.1.5.3"));
        assert_eq!(trap.bindings[0], VarBind::new(SYS_UPTIME_OID, "TimeTicks", "256"));
        assert_eq!(trap.bindings[2], VarBind::new(".1.3.6.1.2.1.2.2.1.1.7", "Integer", "7"));
        assert_eq!(trap.bindings[3].value, "ge-0/0/7");
    }

    #[test]
    fn v1_enterprise_trap_is_rewritten() {
        let pdu = tlv(
            tag::TRAP_V1,
            &[
                oid(".1.3.6.1.4.1.9"),
                tlv(tag::IP_ADDRESS, &[192, 0, 2, 10]),
                int(6),
                int(17),
                tlv(tag::TIMETICKS, &[0x64]),
                tlv(tag::SEQUENCE, &binding(".1.3.6.1.4.1.9.9.1", int(-3))),
            ]
            .concat(),
        );
        let trap = decode_packet(&message(0, "private", pdu), source(), Utc::now(), None).unwrap();

        assert_eq!(trap.version, SnmpVersion::V1);
        assert_eq!(trap.bindings[0].oid, SYS_UPTIME_OID);
        assert_eq!(trap.bindings[0].value, "100");
        assert_eq!(trap.leading_oid(), Some(".1.3.6.1.4.1.9.0.17"));
        assert_eq!(trap.bindings[2].value, "-3");
    }

    #[test]
    fn v1_generic_trap_maps_to_snmp_traps() {
        let pdu = tlv(
            tag::TRAP_V1,
            &[
                oid(".1.3.6.1.4.1.9"),
                tlv(tag::IP_ADDRESS, &[192, 0, 2, 10]),
                int(2),
                int(0),
                tlv(tag::TIMETICKS, &[0x01]),
                tlv(tag::SEQUENCE, &[]),
            ]
            .concat(),
        );
        let trap = decode_packet(&message(0, "public", pdu), source(), Utc::now(), None).unwrap();
        assert_eq!(trap.leading_oid(), Some(".1.3.6.1.6.3.1.1.5.3"));
    }

    #[test]
    fn v1_generic_trap_out_of_range_is_rejected() {
        for generic in [i64::MAX, 7, -1] {
            let pdu = tlv(
                tag::TRAP_V1,
                &[
                    oid(".1.3.6.1.4.1.9"),
                    tlv(tag::IP_ADDRESS, &[192, 0, 2, 10]),
                    int(generic),
                    int(0),
                    tlv(tag::TIMETICKS, &[0x01]),
                    tlv(tag::SEQUENCE, &[]),
                ]
                .concat(),
            );
            assert_eq!(
                decode_packet(&message(0, "public", pdu), source(), Utc::now(), None).unwrap_err(),
                DecodeError::BadGenericTrap(generic)
            );
        }
    }

    #[test]
    fn rejects_other_pdus_and_versions() {
        let get = tlv(0xa0, &[int(1), int(0), int(0), tlv(tag::SEQUENCE, &[])].concat());
        assert_eq!(
            decode_packet(&message(1, "public", get), source(), Utc::now(), None).unwrap_err(),
            DecodeError::UnsupportedPdu(0xa0)
        );
        assert_eq!(
            decode_packet(&message(2, "public", vec![]), source(), Utc::now(), None).unwrap_err(),
            DecodeError::UnsupportedVersion(2)
        );
    }

    const ENGINE: &[u8] = &[0x80, 0x00, 0x1f, 0x88, 0x04, 0x72, 0x65, 0x6c, 0x61, 0x79];

    fn v3_trap_pdu() -> Vec<u8> {
        let bindings = [
            binding(SYS_UPTIME_OID, tlv(tag::TIMETICKS, &[0x02, 0x00])),
            binding(SNMP_TRAP_OID, oid(".1.3.6.1.6.3.1.1.5.3")),
            binding(".1.3.6.1.2.1.2.2.1.1.5", int(5)),
        ]
        .concat();
        tlv(tag::TRAP_V2, &[int(77), int(0), int(0), tlv(tag::SEQUENCE, &bindings)].concat())
    }

    /// Build a v3 message, signing it with `signer` when one is given.
    fn v3_message(user: &str, flags: u8, signer: Option<&UsmUser>) -> Vec<u8> {
        let global = tlv(
            tag::SEQUENCE,
            &[int(1), int(65507), tlv(tag::OCTET_STRING, &[flags]), int(3)].concat(),
        );
        let digest_placeholder = if signer.is_some() { vec![0u8; AUTH_DIGEST_LEN] } else { vec![] };
        let params = tlv(
            tag::SEQUENCE,
            &[
                tlv(tag::OCTET_STRING, ENGINE),
                int(1),
                int(3600),
                tlv(tag::OCTET_STRING, user.as_bytes()),
                tlv(tag::OCTET_STRING, &digest_placeholder),
                tlv(tag::OCTET_STRING, &[]),
            ]
            .concat(),
        );
        let scoped = tlv(
            tag::SEQUENCE,
            &[tlv(tag::OCTET_STRING, ENGINE), tlv(tag::OCTET_STRING, &[]), v3_trap_pdu()].concat(),
        );
        let mut packet = tlv(
            tag::SEQUENCE,
            &[int(3), global, tlv(tag::OCTET_STRING, &params), scoped].concat(),
        );

        if let Some(signer) = signer {
            let marker = [&[tag::OCTET_STRING, AUTH_DIGEST_LEN as u8][..], &[0u8; AUTH_DIGEST_LEN][..]].concat();
            let at = packet.windows(marker.len()).position(|w| w == marker.as_slice()).unwrap() + 2;
            let digest = signer.digest(&packet, ENGINE).unwrap();
            packet[at..at + AUTH_DIGEST_LEN].copy_from_slice(&digest);
        }
        packet
    }

    fn monitor(level: AuthLevel) -> UsmUser {
        UsmUser::new("monitor", "trap-secret-1", level)
    }

    #[test]
    fn decodes_authenticated_v3_trap() {
        let user = monitor(AuthLevel::AuthNoPriv);
        let packet = v3_message("monitor", FLAG_AUTH, Some(&user));

        let trap = decode_packet(&packet, source(), Utc::now(), Some(&user)).unwrap();
        assert_eq!(trap.version, SnmpVersion::V3);
        assert_eq!(trap.community, None);
        assert_eq!(trap.leading_oid(), Some(".1.3.6.1.6.3.1.1.5.3"));
        assert_eq!(trap.bindings[2], VarBind::new(".1.3.6.1.2.1.2.2.1.1.5", "Integer", "5"));
    }

    #[test]
    fn v3_with_wrong_user_is_rejected() {
        let user = monitor(AuthLevel::AuthNoPriv);
        let packet = v3_message("intruder", FLAG_AUTH, Some(&user));
        assert_eq!(
            decode_packet(&packet, source(), Utc::now(), Some(&user)).unwrap_err(),
            DecodeError::UnknownUser("intruder".into())
        );
        assert_eq!(
            decode_packet(&packet, source(), Utc::now(), None).unwrap_err(),
            DecodeError::NoUsmUser
        );
    }

    #[test]
    fn v3_with_bad_digest_is_rejected() {
        let user = monitor(AuthLevel::AuthNoPriv);
        let other_password = UsmUser::new("monitor", "another-secret", AuthLevel::AuthNoPriv);
        let packet = v3_message("monitor", FLAG_AUTH, Some(&other_password));
        assert_eq!(
            decode_packet(&packet, source(), Utc::now(), Some(&user)).unwrap_err(),
            DecodeError::AuthenticationFailed
        );

        let mut tampered = v3_message("monitor", FLAG_AUTH, Some(&user));
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(
            decode_packet(&tampered, source(), Utc::now(), Some(&user)).unwrap_err(),
            DecodeError::AuthenticationFailed
        );
    }

    #[test]
    fn v3_security_levels() {
        let plain = v3_message("monitor", 0, None);
        assert_eq!(
            decode_packet(&plain, source(), Utc::now(), Some(&monitor(AuthLevel::AuthNoPriv))).unwrap_err(),
            DecodeError::Unauthenticated
        );
        let trap = decode_packet(&plain, source(), Utc::now(), Some(&monitor(AuthLevel::NoAuthNoPriv))).unwrap();
        assert_eq!(trap.version, SnmpVersion::V3);

        let encrypted = v3_message("monitor", FLAG_AUTH | FLAG_PRIV, None);
        assert_eq!(
            decode_packet(&encrypted, source(), Utc::now(), Some(&monitor(AuthLevel::AuthNoPriv))).unwrap_err(),
            DecodeError::EncryptedPdu
        );
    }

    #[test]
    fn truncated_packet_is_an_error() {
        let bindings = binding(SNMP_TRAP_OID, oid(".1.3.6.1.6.3.1.1.5.3"));
        let pdu = tlv(tag::TRAP_V2, &[int(1), int(0), int(0), tlv(tag::SEQUENCE, &bindings)].concat());
        let packet = message(1, "public", pdu);

        let cut = &packet[..packet.len() - 4];
        assert!(matches!(
            decode_packet(cut, source(), Utc::now(), None),
            Err(DecodeError::Truncated(_))
        ));
    }

    #[test]
    fn oid_arcs_and_octet_rendering() {
        assert_eq!(decode_oid(&[0x2b, 0x06, 0x01, 0x82, 0x37]).unwrap(), ".1.3.6.1.311");
        assert_eq!(decode_oid(&[0x2b, 0x86]), Err(DecodeError::BadOid));
        assert_eq!(render_octets(&[0x00, 0x1b, 0xff]), "00 1B FF");
        assert_eq!(decode_unsigned(&[0x00, 0xff, 0xff, 0xff, 0xff]), Some(u32::MAX as u64));
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let stats = Arc::new(TrapStats::new());
        let listener = SnmpListener::new(ListenerConfig::default(), tx, stats.clone(), Arc::new(CredentialStore::new()));

        let bindings = [
            binding(SYS_UPTIME_OID, tlv(tag::TIMETICKS, &[0x01])),
            binding(SNMP_TRAP_OID, oid(".1.3.6.1.6.3.1.1.5.4")),
        ]
        .concat();
        let pdu = tlv(tag::TRAP_V2, &[int(1), int(0), int(0), tlv(tag::SEQUENCE, &bindings)].concat());
        let packet = message(1, "public", pdu);
        let from: SocketAddr = "192.0.2.10:40000".parse().unwrap();

        listener.handle_packet(&packet, from);
        listener.handle_packet(&packet, from);
        listener.handle_packet(b"\x01\x02garbage", from);

        assert_eq!(stats.received(), 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn v3_traps_use_the_installed_user() {
        let (tx, mut rx) = mpsc::channel(4);
        let stats = Arc::new(TrapStats::new());
        let credentials = Arc::new(CredentialStore::new());
        let listener = SnmpListener::new(ListenerConfig::default(), tx, stats.clone(), credentials.clone());
        let from: SocketAddr = "192.0.2.10:40000".parse().unwrap();

        let signer = monitor(AuthLevel::AuthNoPriv);
        let packet = v3_message("monitor", FLAG_AUTH, Some(&signer));

        listener.handle_packet(&packet, from);
        assert_eq!(stats.received(), 0);

        credentials.install(Credentials {
            snmpv3_user: "monitor".into(),
            snmpv3_password: "trap-secret-1".into(),
            ..Credentials::default()
        });
        listener.handle_packet(&packet, from);
        assert_eq!(stats.received(), 1);
        assert_eq!(rx.try_recv().unwrap().version, SnmpVersion::V3);
    }
}
