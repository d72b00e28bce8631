//! Trap data model for TrapRelay
//!
//! Values flowing between the pipeline stages. Every stage receives its input
//! by value through a bounded queue and never keeps references into another
//! stage's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Well-known snmpTrapOID.0 binding; its value carries the trap's own OID.
pub const SNMP_TRAP_OID: &str = ".1.3.6.1.6.3.1.1.4.1.0";

/// sysUpTime.0 binding, always first in a v2-style trap.
pub const SYS_UPTIME_OID: &str = ".1.3.6.1.2.1.1.3.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

impl SnmpVersion {
    /// SNMPv3 carries user-based authentication instead of a community string.
    pub fn is_authenticated(self) -> bool {
        matches!(self, SnmpVersion::V3)
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnmpVersion::V1 => f.write_str("v1"),
            SnmpVersion::V2c => f.write_str("v2c"),
            SnmpVersion::V3 => f.write_str("v3"),
        }
    }
}

/// One decoded variable binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarBind {
    pub oid: String,
    pub value_type: String,
    pub value: String,
}

impl VarBind {
    pub fn new(oid: impl Into<String>, value_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            value_type: value_type.into(),
            value: value.into(),
        }
    }
}

/// A trap exactly as the decoder delivered it
#[derive(Debug, Clone)]
pub struct RawTrap {
    pub received_at: DateTime<Utc>,
    pub source: IpAddr,
    pub version: SnmpVersion,
    pub community: Option<String>,
    pub bindings: Vec<VarBind>,
}

impl RawTrap {
    /// The trap's leading OID, found on the value side of binding 1.
    pub fn leading_oid(&self) -> Option<&str> {
        self.bindings.get(1).map(|b| b.value.as_str())
    }
}

/// An admitted trap.
///
/// `trap` is the second binding. When that is snmpTrapOID.0 its OID and
/// value are swapped, so `trap.oid` is the trap's own OID. `bindings` are the
/// variables that followed it.
#[derive(Debug, Clone)]
pub struct FilteredEvent {
    pub received_at: DateTime<Utc>,
    pub source: IpAddr,
    pub version: SnmpVersion,
    pub trap: VarBind,
    pub bindings: Vec<VarBind>,
}

/// Normalised trap event, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalEvent {
    pub received_at: DateTime<Utc>,
    pub source: IpAddr,
    pub name: String,
    pub oid: String,
    pub variant: String,
    pub if_index: Option<String>,
    pub variables: BTreeMap<String, String>,
}

impl CanonicalEvent {
    /// Downstream item key: `name[ifIndex]`, or bare `name`.
    pub fn item_key(&self) -> String {
        match &self.if_index {
            Some(index) => format!("{}[{}]", self.name, index),
            None => self.name.clone(),
        }
    }
}

/// A canonical event annotated with the proxy it is queued for
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub proxy: String,
    pub event: CanonicalEvent,
}

/// Last dot-separated component of an OID.
pub fn variant_digit(oid: &str) -> &str {
    oid.rsplit('.').next().unwrap_or(oid)
}
