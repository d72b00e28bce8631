use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use traprelay::cluster::heartbeat_round;
use traprelay::error::PeerError;
use traprelay::{ClusterState, MemberRecord, PeerClient};

/// Nodes talking to each other in memory; names in `down` do not answer.
#[derive(Default)]
struct Mesh {
    nodes: RwLock<HashMap<String, Arc<ClusterState>>>,
    down: RwLock<HashSet<String>>,
}

impl Mesh {
    fn join(&self, name: &str, started_secs: i64) -> Arc<ClusterState> {
        let node = Arc::new(ClusterState::with_start(
            name,
            Utc.timestamp_opt(started_secs, 0).unwrap(),
        ));
        self.nodes.write().insert(name.to_string(), node.clone());
        node
    }

    fn wire_peers(&self) {
        let nodes = self.nodes.read();
        let names: Vec<String> = nodes.keys().cloned().collect();
        for node in nodes.values() {
            node.add_peers(&names);
        }
    }

    fn set_down(&self, name: &str) {
        self.down.write().insert(name.to_string());
    }

    fn node(&self, name: &str) -> Option<Arc<ClusterState>> {
        if self.down.read().contains(name) {
            return None;
        }
        self.nodes.read().get(name).cloned()
    }

    /// One heartbeat round on every live node.
    async fn round(&self) {
        let live: Vec<Arc<ClusterState>> = {
            let nodes = self.nodes.read();
            let down = self.down.read();
            nodes
                .iter()
                .filter(|(name, _)| !down.contains(*name))
                .map(|(_, node)| node.clone())
                .collect()
        };
        for node in live {
            heartbeat_round(&node, self).await;
        }
    }

    fn masters(&self) -> Vec<String> {
        let down = self.down.read();
        let mut masters: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(name, node)| !down.contains(*name) && node.is_master())
            .map(|(name, _)| name.clone())
            .collect();
        masters.sort();
        masters
    }
}

#[async_trait]
impl PeerClient for Mesh {
    async fn exchange(&self, peer: &str, view: &[MemberRecord]) -> Result<Vec<MemberRecord>, PeerError> {
        let node = self
            .node(peer)
            .ok_or_else(|| PeerError::Unreachable(peer.to_string()))?;
        Ok(node.handle_heartbeat(view.to_vec()))
    }

    async fn reassign(&self, peer: &str, _instance: &str, _host: &str, _proxy: &str) -> Result<(), PeerError> {
        self.node(peer)
            .map(|_| ())
            .ok_or_else(|| PeerError::Unreachable(peer.to_string()))
    }
}

fn three_nodes() -> Mesh {
    let mesh = Mesh::default();
    mesh.join("relay-a", 1_700_000_100);
    mesh.join("relay-b", 1_700_000_050);
    mesh.join("relay-c", 1_700_000_200);
    mesh.wire_peers();
    mesh
}

#[tokio::test]
async fn earliest_started_node_wins() {
    let mesh = three_nodes();
    for _ in 0..2 {
        mesh.round().await;
    }
    assert_eq!(mesh.masters(), vec!["relay-b".to_string()]);
}

#[tokio::test]
async fn next_earliest_takes_over_when_master_goes_down() {
    let mesh = three_nodes();
    mesh.round().await;
    assert_eq!(mesh.masters(), vec!["relay-b".to_string()]);

    mesh.set_down("relay-b");
    for _ in 0..3 {
        mesh.round().await;
    }

    assert_eq!(mesh.masters(), vec!["relay-a".to_string()]);
    let a = mesh.nodes.read()["relay-a"].clone();
    assert!(!a.peer("relay-b").unwrap().up);
}

#[tokio::test]
async fn forced_master_is_accepted_by_the_cluster() {
    let mesh = three_nodes();
    mesh.round().await;

    let c = mesh.nodes.read()["relay-c"].clone();
    assert!(c.force_master());
    assert!(c.started() < Utc.timestamp_opt(1_700_000_050, 0).unwrap());

    for _ in 0..2 {
        mesh.round().await;
    }
    assert_eq!(mesh.masters(), vec!["relay-c".to_string()]);
}

#[tokio::test]
async fn lone_node_is_master() {
    let mesh = Mesh::default();
    let solo = mesh.join("relay-solo", 1_700_000_000);
    mesh.wire_peers();

    assert!(!solo.is_master());
    assert!(heartbeat_round(&solo, &mesh).await);
}
