//! TrapRelay Library
//!
//! SNMP trap relay for clustered monitoring setups. Traps received by the
//! cluster master are filtered against rule tables, normalised, optionally
//! held for a correlated follow-up, then batched per downstream proxy and
//! delivered over the sender protocol. Nodes elect the master among
//! themselves over mutually authenticated HTTPS.

pub mod admin;
pub mod cluster;
pub mod config;
pub mod converter;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod filter;
pub mod hold;
pub mod hosts;
pub mod proxy;
pub mod reload;
pub mod router;
pub mod rules;
pub mod sender;
pub mod snmp_listener;
pub mod stats;
pub mod tls;
pub mod trap;
pub mod usm;
pub mod wire;

pub use cluster::{ClusterState, HttpsPeerClient, MemberRecord, PeerClient};
pub use config::Config;
pub use converter::Converter;
pub use filter::{AddressPolicy, MastershipGate, TrapFilter};
pub use hold::HoldQueue;
pub use hosts::HostRegistry;
pub use proxy::ProxyRegistry;
pub use router::Router;
pub use rules::RuleTables;
pub use snmp_listener::SnmpListener;
pub use stats::TrapStats;
