//! Cluster membership and master election
//!
//! Every node keeps a record for itself and one per peer. Peers exchange their
//! full view over mutually authenticated HTTPS every heartbeat round. A merge
//! accepts a remote record only when it is newer than the local copy for that
//! name and is not about ourselves, so views converge regardless of order.
//!
//! Election is bully style on declared start time: a node is master iff no
//! peer currently marked up started earlier than it did. The result is
//! recomputed after every heartbeat round and on every received heartbeat,
//! and the filter reads it on each trap through [`MastershipGate`].

use crate::error::PeerError;
use crate::filter::MastershipGate;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A peer down for longer than this many seconds is forgotten
pub const PEER_REAP_AFTER_SECS: i64 = 3600;

/// Placeholder time for peers never heard from
pub fn never() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

/// One member's entry in the cluster view, as exchanged on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    #[serde(rename = "host")]
    pub name: String,
    #[serde(rename = "lastcheck")]
    pub last_check: DateTime<Utc>,
    #[serde(rename = "uptime")]
    pub started: DateTime<Utc>,
    #[serde(rename = "status")]
    pub up: bool,
}

impl MemberRecord {
    fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_check: never(),
            started: never(),
            up: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterPhase {
    #[default]
    AwaitingCredentials,
    Initialized,
    Running,
}

#[derive(Debug)]
struct Members {
    me: MemberRecord,
    peers: HashMap<String, MemberRecord>,
    phase: ClusterPhase,
}

#[derive(Debug)]
pub struct ClusterState {
    members: RwLock<Members>,
    master: AtomicBool,
}

impl ClusterState {
    pub fn new(name: &str) -> Self {
        Self::with_start(name, Utc::now())
    }

    pub fn with_start(name: &str, started: DateTime<Utc>) -> Self {
        Self {
            members: RwLock::new(Members {
                me: MemberRecord {
                    name: name.to_string(),
                    last_check: started,
                    started,
                    up: true,
                },
                peers: HashMap::new(),
                phase: ClusterPhase::AwaitingCredentials,
            }),
            // No trap is processed until the first election has run.
            master: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> String {
        self.members.read().me.name.clone()
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.members.read().me.started
    }

    pub fn phase(&self) -> ClusterPhase {
        self.members.read().phase
    }

    pub fn set_phase(&self, phase: ClusterPhase) {
        let mut members = self.members.write();
        if members.phase != phase {
            debug!(?phase, "Cluster phase changed");
            members.phase = phase;
        }
    }

    /// Register peer names; existing entries are left alone.
    pub fn add_peers<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut members = self.members.write();
        let me = members.me.name.clone();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || name == me {
                continue;
            }
            members
                .peers
                .entry(name.to_string())
                .or_insert_with(|| MemberRecord::unknown(name));
        }
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.members.read().peers.keys().cloned().collect()
    }

    pub fn peer(&self, name: &str) -> Option<MemberRecord> {
        self.members.read().peers.get(name).cloned()
    }

    pub fn up_peers(&self) -> Vec<String> {
        self.members
            .read()
            .peers
            .values()
            .filter(|p| p.up)
            .map(|p| p.name.clone())
            .collect()
    }

    /// This node's view: a fresh self record followed by every known peer.
    pub fn view(&self) -> Vec<MemberRecord> {
        let members = self.members.read();
        let mut view = Vec::with_capacity(members.peers.len() + 1);
        view.push(MemberRecord {
            last_check: Utc::now(),
            up: true,
            ..members.me.clone()
        });
        view.extend(members.peers.values().cloned());
        view
    }

    /// Merge a remote view, keeping only newer records about other members.
    pub fn merge(&self, records: Vec<MemberRecord>) {
        let mut members = self.members.write();
        let me = members.me.name.clone();

        for record in records {
            if record.name == me || record.name.is_empty() {
                continue;
            }
            let (newer, was_up) = match members.peers.get(&record.name) {
                Some(current) => (record.last_check > current.last_check, current.up),
                None => (record.last_check > never(), false),
            };
            if !newer {
                continue;
            }
            if record.up != was_up {
                info!(peer = %record.name, up = record.up, "Cluster member status changed");
            }
            members.peers.insert(record.name.clone(), record);
        }
    }

    /// Mark a peer down after a failed exchange, forgetting it if it has been gone long enough.
    pub fn mark_down(&self, name: &str, now: DateTime<Utc>) {
        let mut members = self.members.write();
        let peer = members
            .peers
            .entry(name.to_string())
            .or_insert_with(|| MemberRecord::unknown(name));

        if peer.last_check > never() && (now - peer.last_check).num_seconds() > PEER_REAP_AFTER_SECS {
            members.peers.remove(name);
            info!(peer = name, "Cluster member removed after prolonged absence");
            return;
        }

        if peer.up {
            warn!(peer = name, "Cluster member is down");
            peer.up = false;
        }
    }

    /// Re-run the election; returns the new mastership.
    pub fn recompute_master(&self) -> bool {
        let master = {
            let members = self.members.read();
            !members
                .peers
                .values()
                .any(|p| p.up && p.started < members.me.started)
        };

        if self.master.swap(master, Ordering::SeqCst) != master {
            info!(master, "Cluster mastership changed");
        }
        master
    }

    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    /// Claim mastership by moving our start time before every known peer's.
    pub fn force_master(&self) -> bool {
        {
            let mut members = self.members.write();
            let earliest = members
                .peers
                .values()
                .map(|p| p.started)
                .filter(|started| *started > never())
                .min();

            if let Some(earliest) = earliest {
                if earliest <= members.me.started {
                    members.me.started = earliest - ChronoDuration::microseconds(1);
                    info!(started = %members.me.started, "Start time rewritten to force mastership");
                }
            }
        }
        self.recompute_master()
    }

    /// Passive side of the heartbeat exchange.
    pub fn handle_heartbeat(&self, records: Vec<MemberRecord>) -> Vec<MemberRecord> {
        self.merge(records);
        self.recompute_master();
        self.view()
    }
}

impl MastershipGate for ClusterState {
    fn is_master(&self) -> bool {
        ClusterState::is_master(self)
    }
}

/// Transport used to talk to other cluster members
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Push our view to a peer and return the peer's view.
    async fn exchange(&self, peer: &str, view: &[MemberRecord]) -> Result<Vec<MemberRecord>, PeerError>;

    /// Ask a peer to apply a host reassignment locally.
    async fn reassign(&self, peer: &str, instance: &str, host: &str, proxy: &str) -> Result<(), PeerError>;
}

/// mTLS HTTPS transport between nodes
pub struct HttpsPeerClient {
    client: Client,
    port: u16,
}

impl HttpsPeerClient {
    pub fn new(client: Client, port: u16) -> Self {
        Self { client, port }
    }

    fn url(&self, peer: &str, segments: &[&str]) -> Result<Url, PeerError> {
        let mut url = Url::parse(&format!("https://{}:{}/", peer, self.port))
            .map_err(|e| PeerError::Url(format!("{}: {}", peer, e)))?;
        url.path_segments_mut()
            .map_err(|_| PeerError::Url(peer.to_string()))?
            .clear()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl PeerClient for HttpsPeerClient {
    async fn exchange(&self, peer: &str, view: &[MemberRecord]) -> Result<Vec<MemberRecord>, PeerError> {
        let response = self
            .client
            .post(self.url(peer, &["healthcheck"])?)
            .json(view)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PeerError::Status {
                peer: peer.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    async fn reassign(&self, peer: &str, instance: &str, host: &str, proxy: &str) -> Result<(), PeerError> {
        let response = self
            .client
            .put(self.url(peer, &["proxyfromcluster", instance, host, proxy])?)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(PeerError::Status {
                peer: peer.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// One heartbeat round: exchange with every peer, then re-run the election.
pub async fn heartbeat_round(state: &ClusterState, client: &dyn PeerClient) -> bool {
    let view = state.view();
    let peers = state.peer_names();

    let results = join_all(peers.iter().map(|peer| {
        let view = &view;
        async move { (peer, client.exchange(peer, view).await) }
    }))
    .await;

    for (peer, result) in results {
        match result {
            Ok(records) => state.merge(records),
            Err(e) => {
                debug!(peer = %peer, "Heartbeat failed: {}", e);
                state.mark_down(peer, Utc::now());
            }
        }
    }

    state.recompute_master()
}

pub async fn run_heartbeat(state: Arc<ClusterState>, client: Arc<dyn PeerClient>, period: Duration) {
    state.set_phase(ClusterPhase::Running);
    info!(node = %state.name(), peers = state.peer_names().len(), "Cluster heartbeat started");

    loop {
        heartbeat_round(&state, client.as_ref()).await;
        tokio::time::sleep(period).await;
    }
}

/// Forward a host reassignment to every peer currently up.
pub async fn propagate_reassign(
    state: &ClusterState,
    client: &dyn PeerClient,
    instance: &str,
    host: &str,
    proxy: &str,
) -> usize {
    let peers = state.up_peers();
    let results = join_all(peers.iter().map(|peer| async move {
        (peer, client.reassign(peer, instance, host, proxy).await)
    }))
    .await;

    let mut applied = 0;
    for (peer, result) in results {
        match result {
            Ok(()) => applied += 1,
            Err(e) => warn!(peer = %peer, host, proxy, instance, "Failed to propagate reassignment: {}", e),
        }
    }
    applied
}
