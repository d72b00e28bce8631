//! Directory poller
//!
//! Keeps the host registry in step with the inventory of each monitoring
//! instance. A poll cycle fetches every instance concurrently, upserts each
//! active host row (creating its proxy on first sight), then evicts hosts not
//! refreshed since the cycle started and closes proxies no host references.
//!
//! Cycles run on a fixed period and on demand. On-demand requests queue on a
//! small channel; several requests waiting at once collapse into one cycle.

use crate::error::DirectoryError;
use crate::hosts::HostRegistry;
use crate::proxy::ProxyRegistry;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the reread request queue
pub const REREAD_QUEUE: usize = 10;

/// One active host as listed by an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRow {
    pub host: String,
    pub proxy: String,
    pub ip: String,
}

/// Source of host-to-proxy assignments, one inventory per instance
#[async_trait]
pub trait DirectorySource: Send + Sync {
    fn instances(&self) -> Vec<String>;

    async fn fetch(&self, instance: &str) -> Result<Vec<HostRow>, DirectoryError>;
}

/// Reads each instance's inventory from a JSON file of [`HostRow`]s
#[derive(Debug, Clone, Default)]
pub struct FileDirectory {
    files: BTreeMap<String, PathBuf>,
}

impl FileDirectory {
    pub fn new(files: BTreeMap<String, PathBuf>) -> Self {
        Self { files }
    }
}

#[async_trait]
impl DirectorySource for FileDirectory {
    fn instances(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    async fn fetch(&self, instance: &str) -> Result<Vec<HostRow>, DirectoryError> {
        let path = self
            .files
            .get(instance)
            .ok_or_else(|| DirectoryError::UnknownInstance(instance.to_string()))?;

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DirectoryError::Read {
                path: path.clone(),
                source,
            })?;

        serde_json::from_str(&content).map_err(|source| DirectoryError::Parse {
            path: path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub upserted: usize,
    pub failed_instances: Vec<String>,
    pub evicted: usize,
    pub closed_proxies: Vec<String>,
}

/// Cheap handle for requesting an immediate poll cycle
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<()>,
}

impl DirectoryHandle {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(REREAD_QUEUE);
        (Self { tx }, rx)
    }

    /// Queue a reread; a full queue already guarantees one.
    pub fn request_reread(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

pub struct DirectoryPoller {
    source: Arc<dyn DirectorySource>,
    hosts: Arc<HostRegistry>,
    proxies: Arc<ProxyRegistry>,
    period: Duration,
}

impl DirectoryPoller {
    pub fn new(
        source: Arc<dyn DirectorySource>,
        hosts: Arc<HostRegistry>,
        proxies: Arc<ProxyRegistry>,
        period: Duration,
    ) -> Self {
        Self {
            source,
            hosts,
            proxies,
            period,
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let started = Utc::now();
        let instances = self.source.instances();
        let source = self.source.as_ref();

        let results = join_all(instances.iter().map(|instance| async move {
            (instance, source.fetch(instance).await)
        }))
        .await;

        let mut report = CycleReport::default();
        for (instance, result) in results {
            match result {
                Ok(rows) => {
                    for row in rows {
                        let address: IpAddr = match row.ip.trim().parse() {
                            Ok(address) => address,
                            Err(_) => {
                                warn!(instance = %instance, host = %row.host, ip = %row.ip, "Skipping host with invalid address");
                                continue;
                            }
                        };
                        self.proxies.ensure(&row.proxy).await;
                        self.hosts.upsert(&row.host, address, &row.proxy, instance);
                        report.upserted += 1;
                    }
                }
                Err(e) => {
                    warn!(instance = %instance, "Directory poll failed, keeping known hosts: {}", e);
                    self.hosts.touch_instance(instance, Utc::now());
                    report.failed_instances.push(instance.clone());
                }
            }
        }

        report.evicted = self.hosts.evict_older_than(started);
        report.closed_proxies = self.proxies.sweep(&self.hosts);

        info!(
            upserted = report.upserted,
            evicted = report.evicted,
            failed = report.failed_instances.len(),
            hosts = self.hosts.len(),
            proxies = self.proxies.len(),
            "Directory poll cycle complete"
        );
        report
    }

    pub async fn run(self, mut reread: mpsc::Receiver<()>) {
        info!(period = ?self.period, "Directory poller started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = reread.recv() => {
                    if request.is_none() {
                        break;
                    }
                    let mut collapsed = 0;
                    while reread.try_recv().is_ok() {
                        collapsed += 1;
                    }
                    debug!(collapsed, "Reread requested");
                }
                _ = ticker.tick() => {}
            }
            self.run_cycle().await;
        }
        info!("Directory poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{SenderContext, SenderSettings};
    use crate::stats::TrapStats;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StaticDirectory {
        rows: Mutex<BTreeMap<String, Result<Vec<HostRow>, String>>>,
    }

    impl StaticDirectory {
        fn set(&self, instance: &str, rows: Result<Vec<HostRow>, String>) {
            self.rows.lock().insert(instance.to_string(), rows);
        }
    }

    #[async_trait]
    impl DirectorySource for StaticDirectory {
        fn instances(&self) -> Vec<String> {
            self.rows.lock().keys().cloned().collect()
        }

        async fn fetch(&self, instance: &str) -> Result<Vec<HostRow>, DirectoryError> {
            match self.rows.lock().get(instance).cloned() {
                Some(Ok(rows)) => Ok(rows),
                _ => Err(DirectoryError::UnknownInstance(instance.to_string())),
            }
        }
    }

    fn row(host: &str, proxy: &str, ip: &str) -> HostRow {
        HostRow {
            host: host.into(),
            proxy: proxy.into(),
            ip: ip.into(),
        }
    }

    fn poller(source: Arc<StaticDirectory>) -> (DirectoryPoller, Arc<HostRegistry>, Arc<ProxyRegistry>) {
        let hosts = Arc::new(HostRegistry::new());
        let ctx = SenderContext {
            hosts: hosts.clone(),
            stats: Arc::new(TrapStats::new()),
            settings: SenderSettings::default(),
        };
        let proxies = Arc::new(ProxyRegistry::new(ctx, 16, 10051));
        let poller = DirectoryPoller::new(source, hosts.clone(), proxies.clone(), Duration::from_secs(3600));
        (poller, hosts, proxies)
    }

    #[tokio::test]
    async fn stale_hosts_and_their_proxies_go_away() {
        let source = Arc::new(StaticDirectory::default());
        source.set(
            "east",
            Ok(vec![
                row("sw1", "127.0.0.1_10981", "10.0.0.1"),
                row("sw2", "127.0.0.1_10982", "10.0.0.2"),
            ]),
        );
        let (poller, hosts, proxies) = poller(source.clone());

        let first = poller.run_cycle().await;
        assert_eq!(first.upserted, 2);
        assert_eq!(proxies.len(), 2);

        source.set("east", Ok(vec![row("sw1", "127.0.0.1_10981", "10.0.0.1")]));
        let second = poller.run_cycle().await;

        assert_eq!(second.evicted, 1);
        assert_eq!(second.closed_proxies, vec!["127.0.0.1_10982".to_string()]);
        assert!(!hosts.contains_address("10.0.0.2".parse().unwrap()));
        assert!(!proxies.contains("127.0.0.1_10982"));
    }

    #[tokio::test]
    async fn failed_instance_keeps_its_hosts() {
        let source = Arc::new(StaticDirectory::default());
        source.set("east", Ok(vec![row("sw1", "127.0.0.1_10983", "10.0.0.1")]));
        source.set("west", Ok(vec![row("sw9", "127.0.0.1_10984", "10.0.9.9")]));
        let (poller, hosts, _) = poller(source.clone());
        poller.run_cycle().await;

        source.set("west", Err("database down".into()));
        let report = poller.run_cycle().await;

        assert_eq!(report.failed_instances, vec!["west".to_string()]);
        assert_eq!(report.evicted, 0);
        assert!(hosts.contains_address("10.0.9.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn invalid_rows_are_skipped() {
        let source = Arc::new(StaticDirectory::default());
        source.set("east", Ok(vec![row("bad", "p", "not-an-ip"), row("ok", "", "10.0.0.5")]));
        let (poller, hosts, proxies) = poller(source);

        assert_eq!(poller.run_cycle().await.upserted, 1);
        assert!(hosts.contains_address("10.0.0.5".parse().unwrap()));
        assert!(proxies.is_empty());
    }

    #[tokio::test]
    async fn file_directory_reads_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("east.json");
        tokio::fs::write(&path, r#"[{"host":"sw1","proxy":"zbx-proxy","ip":"10.0.0.1"}]"#)
            .await
            .unwrap();

        let source = FileDirectory::new([("east".to_string(), path)].into_iter().collect());
        assert_eq!(source.instances(), vec!["east".to_string()]);
        assert_eq!(source.fetch("east").await.unwrap(), vec![row("sw1", "zbx-proxy", "10.0.0.1")]);
        assert!(matches!(source.fetch("west").await, Err(DirectoryError::UnknownInstance(_))));
    }

    #[tokio::test]
    async fn reread_requests_are_debounced() {
        let (handle, mut rx) = DirectoryHandle::channel();
        for _ in 0..25 {
            assert!(handle.request_reread());
        }
        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, REREAD_QUEUE);
    }
}
