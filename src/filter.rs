//! Trap admission filter
//!
//! First pipeline stage. Each raw trap runs through a short-circuit chain of
//! checks and is either dropped or emitted as a [`FilteredEvent`]:
//!
//! 1. loopback v3 self-test traps get a random registered host as their source
//! 2. this node must be cluster master
//! 3. the source address policy must allow the sender
//! 4. the trap's leading OID must have a rule
//! 5. the source must be a registered host
//! 6. v1/v2c traps must carry an allowed community

use crate::credentials::CredentialStore;
use crate::hosts::HostRegistry;
use crate::rules::RuleTables;
use crate::stats::TrapStats;
use crate::trap::{FilteredEvent, RawTrap, VarBind, SNMP_TRAP_OID};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Read side of the cluster election
pub trait MastershipGate: Send + Sync {
    fn is_master(&self) -> bool;
}

/// Source address allow-list; empty admits everyone
#[derive(Debug, Clone, Default)]
pub struct AddressPolicy {
    allowed: Vec<IpNet>,
}

impl AddressPolicy {
    pub fn new(allowed: Vec<IpNet>) -> Self {
        Self { allowed }
    }

    pub fn permits(&self, address: IpAddr) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|net| net.contains(&address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotMaster,
    AddressPolicy,
    TooFewBindings,
    UnknownOid,
    UnknownHost,
    Community,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::NotMaster => "not cluster master",
            Rejection::AddressPolicy => "source address not allowed",
            Rejection::TooFewBindings => "too few variable bindings",
            Rejection::UnknownOid => "no rule for trap OID",
            Rejection::UnknownHost => "source is not a known host",
            Rejection::Community => "community not allowed",
        };
        f.write_str(reason)
    }
}

pub struct TrapFilter {
    gate: Arc<dyn MastershipGate>,
    policy: AddressPolicy,
    rules: Arc<RuleTables>,
    hosts: Arc<HostRegistry>,
    credentials: Arc<CredentialStore>,
    stats: Arc<TrapStats>,
}

impl TrapFilter {
    pub fn new(
        gate: Arc<dyn MastershipGate>,
        policy: AddressPolicy,
        rules: Arc<RuleTables>,
        hosts: Arc<HostRegistry>,
        credentials: Arc<CredentialStore>,
        stats: Arc<TrapStats>,
    ) -> Self {
        Self {
            gate,
            policy,
            rules,
            hosts,
            credentials,
            stats,
        }
    }

    /// Run the admission chain over one trap.
    pub fn admit(&self, mut trap: RawTrap) -> Result<FilteredEvent, Rejection> {
        if trap.source.is_loopback() && trap.version.is_authenticated() {
            if let Some(address) = self.hosts.random_address() {
                trace!(%address, "Self-test trap re-addressed");
                trap.source = address;
                self.stats.record_test();
            }
        }

        if !self.gate.is_master() {
            return Err(Rejection::NotMaster);
        }
        if !self.policy.permits(trap.source) {
            return Err(Rejection::AddressPolicy);
        }

        let leading = trap.leading_oid().ok_or(Rejection::TooFewBindings)?;
        if !self.rules.knows_trap(leading) {
            return Err(Rejection::UnknownOid);
        }
        if !self.hosts.contains_address(trap.source) {
            return Err(Rejection::UnknownHost);
        }
        if !self
            .credentials
            .community_allows(trap.version, trap.community.as_deref())
        {
            return Err(Rejection::Community);
        }

        self.stats.record_passed(trap.version.is_authenticated());

        let mut bindings = trap.bindings.into_iter().skip(1);
        let second = bindings.next().ok_or(Rejection::TooFewBindings)?;
        // Only the snmpTrapOID.0 binding has its OID and value exchanged.
        let trap_binding = if second.oid == SNMP_TRAP_OID {
            VarBind {
                oid: second.value,
                value_type: second.value_type,
                value: second.oid,
            }
        } else {
            second
        };
        Ok(FilteredEvent {
            received_at: trap.received_at,
            source: trap.source,
            version: trap.version,
            trap: trap_binding,
            bindings: bindings.collect(),
        })
    }

    pub async fn run(self, mut rx: mpsc::Receiver<RawTrap>, tx: mpsc::Sender<FilteredEvent>) {
        info!("Trap filter started");
        while let Some(trap) = rx.recv().await {
            let source = trap.source;
            match self.admit(trap) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        warn!("Converter queue closed, filter stopping");
                        return;
                    }
                }
                Err(Rejection::NotMaster) => trace!(%source, "Trap dropped: not master"),
                Err(reason) => debug!(%source, "Trap rejected: {}", reason),
            }
        }
        info!("Trap filter stopped");
    }
}
