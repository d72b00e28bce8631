//! Hot reload of the rule, credential and peer files
//!
//! Each file is checked every reload interval and reloaded when its
//! modification time differs from the last successful load. A file that fails
//! to load keeps the previous state in place and is retried on the next check.

use crate::cluster::ClusterState;
use crate::credentials::{CredentialStore, Credentials};
use crate::directory::DirectoryHandle;
use crate::rules::RuleTables;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedFile {
    TrapRules,
    VariableRules,
    Credentials,
    Peers,
}

impl WatchedFile {
    const ALL: [WatchedFile; 4] = [
        WatchedFile::Credentials,
        WatchedFile::TrapRules,
        WatchedFile::VariableRules,
        WatchedFile::Peers,
    ];
}

#[derive(Debug, Clone, Default)]
pub struct ReloadPaths {
    pub trap_rules: PathBuf,
    pub variable_rules: PathBuf,
    pub credentials: PathBuf,
    pub peers: PathBuf,
}

impl ReloadPaths {
    fn get(&self, file: WatchedFile) -> &Path {
        match file {
            WatchedFile::TrapRules => &self.trap_rules,
            WatchedFile::VariableRules => &self.variable_rules,
            WatchedFile::Credentials => &self.credentials,
            WatchedFile::Peers => &self.peers,
        }
    }
}

/// Peer names, one per line; blank lines and `#` comments ignored.
pub fn parse_peers(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub struct FileReloader {
    paths: ReloadPaths,
    period: Duration,
    rules: Arc<RuleTables>,
    credentials: Arc<CredentialStore>,
    cluster: Arc<ClusterState>,
    directory: DirectoryHandle,
    loaded: HashMap<WatchedFile, SystemTime>,
}

impl FileReloader {
    pub fn new(
        paths: ReloadPaths,
        period: Duration,
        rules: Arc<RuleTables>,
        credentials: Arc<CredentialStore>,
        cluster: Arc<ClusterState>,
        directory: DirectoryHandle,
    ) -> Self {
        Self {
            paths,
            period,
            rules,
            credentials,
            cluster,
            directory,
            loaded: HashMap::new(),
        }
    }

    /// Check every file once; returns the ones that were reloaded.
    pub async fn check_all(&mut self) -> Vec<WatchedFile> {
        let mut reloaded = Vec::new();
        for file in WatchedFile::ALL {
            if self.check(file).await {
                reloaded.push(file);
            }
        }
        reloaded
    }

    async fn check(&mut self, file: WatchedFile) -> bool {
        let path = self.paths.get(file).to_path_buf();
        if path.as_os_str().is_empty() {
            return false;
        }

        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(file = ?file, path = %path.display(), "Cannot stat watched file: {}", e);
                return false;
            }
        };
        if self.loaded.get(&file) == Some(&modified) {
            return false;
        }

        match self.load(file, &path).await {
            Ok(()) => {
                self.loaded.insert(file, modified);
                true
            }
            Err(e) => {
                warn!(file = ?file, path = %path.display(), "Reload failed, keeping previous contents: {:#}", e);
                false
            }
        }
    }

    async fn load(&self, file: WatchedFile, path: &Path) -> Result<()> {
        match file {
            WatchedFile::TrapRules => {
                let count = self.rules.load_trap_file(path).await?;
                info!(path = %path.display(), count, "Trap rules loaded");
            }
            WatchedFile::VariableRules => {
                let count = self.rules.load_variable_file(path).await?;
                info!(path = %path.display(), count, "Variable rules loaded");
            }
            WatchedFile::Credentials => {
                let credentials = Credentials::load_from_file(path).await?;
                if !credentials.is_complete() {
                    warn!(path = %path.display(), "Credentials loaded without complete certificate paths");
                }
                self.credentials.install(credentials);
                info!(path = %path.display(), "Credentials loaded");
                self.directory.request_reread();
            }
            WatchedFile::Peers => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read peers file {}", path.display()))?;
                let peers = parse_peers(&content);
                info!(path = %path.display(), count = peers.len(), "Cluster peers loaded");
                self.cluster.add_peers(peers);
            }
        }
        Ok(())
    }

    pub async fn run(mut self) {
        info!(period = ?self.period, "File reloader started");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.check_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_at(path: &Path, content: &str, mtime_secs: u64) {
        let mut file = File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs))
            .unwrap();
    }

    struct Fixture {
        dir: TempDir,
        reloader: FileReloader,
        rules: Arc<RuleTables>,
        credentials: Arc<CredentialStore>,
        cluster: Arc<ClusterState>,
        reread: tokio::sync::mpsc::Receiver<()>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = ReloadPaths {
            trap_rules: dir.path().join("traps.conf"),
            variable_rules: dir.path().join("vars.conf"),
            credentials: dir.path().join("credentials.json"),
            peers: dir.path().join("peers.conf"),
        };
        let rules = Arc::new(RuleTables::new());
        let credentials = Arc::new(CredentialStore::new());
        let cluster = Arc::new(ClusterState::new("node1"));
        let (directory, reread) = DirectoryHandle::channel();

        let reloader = FileReloader::new(
            paths,
            Duration::from_secs(2),
            rules.clone(),
            credentials.clone(),
            cluster.clone(),
            directory,
        );
        Fixture {
            dir,
            reloader,
            rules,
            credentials,
            cluster,
            reread,
        }
    }

    #[test]
    fn peers_file_skips_comments_and_blanks() {
        let peers = parse_peers("# cluster\nnode2\n\n  node3  \n#node4\n");
        assert_eq!(peers, vec!["node2".to_string(), "node3".to_string()]);
    }

    #[tokio::test]
    async fn missing_files_are_not_fatal() {
        let mut fx = fixture();
        assert!(fx.reloader.check_all().await.is_empty());
        assert!(!fx.credentials.is_ready());
    }

    #[tokio::test]
    async fn files_reload_only_when_modified() {
        let mut fx = fixture();
        let traps = fx.dir.path().join("traps.conf");
        write_at(&traps, ".1.3.6.1.6.3.1.1.5.3;linkDown;4;5\n", 1_000);

        assert_eq!(fx.reloader.check_all().await, vec![WatchedFile::TrapRules]);
        assert_eq!(fx.rules.trap_rule_count(), 1);
        assert!(fx.reloader.check_all().await.is_empty());

        write_at(&traps, ".1.3.6.1.6.3.1.1.5.3;linkDown;4;5\n.1.3.6.1.6.3.1.1.5.4;linkUp\n", 2_000);
        assert_eq!(fx.reloader.check_all().await, vec![WatchedFile::TrapRules]);
        assert_eq!(fx.rules.trap_rule_count(), 2);
    }

    #[tokio::test]
    async fn malformed_file_keeps_previous_table_and_is_retried() {
        let mut fx = fixture();
        let vars = fx.dir.path().join("vars.conf");
        write_at(&vars, ".1.3.6.1.2.1.2.2.1.1;ifIndex\n", 1_000);
        fx.reloader.check_all().await;

        write_at(&vars, "no-separator-here\n", 2_000);
        assert!(fx.reloader.check_all().await.is_empty());
        assert_eq!(fx.rules.variable_name(".1.3.6.1.2.1.2.2.1.1.7").as_deref(), Some("ifIndex"));

        // Same mtime as the failed attempt: still retried.
        write_at(&vars, ".1.3.6.1.2.1.2.2.1.1;ifIndex\n.1.3.6.1.2.1.2.2.1.2;ifDescr\n", 2_000);
        assert_eq!(fx.reloader.check_all().await, vec![WatchedFile::VariableRules]);
        assert_eq!(fx.rules.variable_rule_count(), 2);
    }

    #[tokio::test]
    async fn credentials_open_gate_and_request_reread() {
        let mut fx = fixture();
        write_at(
            &fx.dir.path().join("credentials.json"),
            r#"{"cert_pem":"/etc/node.pem","cert_key":"/etc/node.key","cert_root":"/etc/root.pem","community":["public"]}"#,
            1_000,
        );
        write_at(&fx.dir.path().join("peers.conf"), "node2\nnode3\n", 1_000);

        let reloaded = fx.reloader.check_all().await;
        assert_eq!(reloaded, vec![WatchedFile::Credentials, WatchedFile::Peers]);

        assert!(fx.credentials.is_ready());
        assert_eq!(fx.credentials.service_port(), 8880);
        assert!(fx.reread.try_recv().is_ok());

        let mut peers = fx.cluster.peer_names();
        peers.sort();
        assert_eq!(peers, vec!["node2".to_string(), "node3".to_string()]);
    }
}
