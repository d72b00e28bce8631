//! Configuration management for TrapRelay
//!
//! A single JSON document. Every section has defaults, so a partial file only
//! needs to name what differs. Rule, credential and peer files referenced here
//! are hot-reloaded; this document itself is read once at startup.

use crate::reload::ReloadPaths;
use crate::sender::SenderSettings;
use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub files: FilesConfig,
    pub cluster: ClusterConfig,
    pub directory: DirectoryConfig,
    pub sender: SenderConfig,
    pub pipeline: PipelineConfig,
    /// Networks allowed to send traps; empty admits every source
    pub allowed_sources: Vec<IpNet>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub trap_rules: PathBuf,
    pub variable_rules: PathBuf,
    pub credentials: PathBuf,
    pub peers: PathBuf,
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Name this node is known by to its peers
    pub node_name: String,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub poll_interval_secs: u64,
    /// Monitoring instance name to inventory file
    pub instances: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub batch_limit: usize,
    pub flush_interval_ms: u64,
    pub buffer_cap: usize,
    pub io_timeout_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub default_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    pub file_output: Option<String>,
    /// `daily` or `hourly`
    pub rotation: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 162,
            max_packet_size: 8192,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            trap_rules: PathBuf::from("/etc/traprelay/traps.conf"),
            variable_rules: PathBuf::from("/etc/traprelay/variables.conf"),
            credentials: PathBuf::from("/etc/traprelay/credentials.json"),
            peers: PathBuf::from("/etc/traprelay/peers.conf"),
            reload_interval_secs: 2,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            heartbeat_interval_ms: 500,
            request_timeout_ms: 400,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3600,
            instances: BTreeMap::new(),
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        let settings = SenderSettings::default();
        Self {
            batch_limit: settings.batch_limit,
            flush_interval_ms: settings.flush_interval.as_millis() as u64,
            buffer_cap: settings.buffer_cap,
            io_timeout_secs: settings.io_timeout.as_secs(),
            initial_backoff_ms: settings.initial_backoff.as_millis() as u64,
            max_backoff_secs: settings.max_backoff.as_secs(),
            default_port: crate::proxy::DEFAULT_PROXY_PORT,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 2048 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: Some("./traprelay.log".to_string()),
            rotation: "daily".to_string(),
        }
    }
}

impl SenderConfig {
    pub fn settings(&self) -> SenderSettings {
        SenderSettings {
            batch_limit: self.batch_limit,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            buffer_cap: self.buffer_cap,
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

impl FilesConfig {
    pub fn reload_paths(&self) -> ReloadPaths {
        ReloadPaths {
            trap_rules: self.trap_rules.clone(),
            variable_rules: self.variable_rules.clone(),
            credentials: self.credentials.clone(),
            peers: self.peers.clone(),
        }
    }
}

impl Config {
    /// Single-node setup with files next to the binary and no directory instances
    pub fn simple() -> Self {
        Self {
            files: FilesConfig {
                trap_rules: PathBuf::from("./traps.conf"),
                variable_rules: PathBuf::from("./variables.conf"),
                credentials: PathBuf::from("./credentials.json"),
                peers: PathBuf::from("./peers.conf"),
                ..FilesConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .context("Failed to read configuration file")?;

        let config: Config = serde_json::from_str(&content)
            .context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialise configuration")?;

        tokio::fs::write(path.as_ref(), content)
            .await
            .context("Failed to write configuration file")?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.port == 0 {
            anyhow::bail!("Invalid trap listener port: {}", self.listener.port);
        }
        self.listener
            .bind_address
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid bind address: {}", self.listener.bind_address))?;
        if self.listener.max_packet_size < 484 {
            anyhow::bail!("max_packet_size must be at least 484 bytes");
        }

        if self.files.reload_interval_secs == 0 {
            anyhow::bail!("files.reload_interval_secs must be greater than zero");
        }

        if self.cluster.node_name.trim().is_empty() {
            anyhow::bail!("cluster.node_name cannot be empty");
        }
        if self.cluster.heartbeat_interval_ms == 0 || self.cluster.request_timeout_ms == 0 {
            anyhow::bail!("Cluster heartbeat interval and request timeout must be greater than zero");
        }

        if self.directory.poll_interval_secs == 0 {
            anyhow::bail!("directory.poll_interval_secs must be greater than zero");
        }
        for (instance, path) in &self.directory.instances {
            if instance.is_empty() || path.as_os_str().is_empty() {
                anyhow::bail!("Directory instance entries need a name and an inventory path");
            }
        }

        self.validate_sender()?;

        if self.pipeline.queue_capacity == 0 {
            anyhow::bail!("pipeline.queue_capacity must be greater than zero");
        }

        let mut seen = HashSet::new();
        for net in &self.allowed_sources {
            if !seen.insert(net.trunc()) {
                anyhow::bail!("Duplicate allowed source network: {}", net);
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Unknown log level: {}", other),
        }
        match self.logging.rotation.as_str() {
            "daily" | "hourly" => {}
            other => anyhow::bail!("Unknown log rotation: {} (expected daily or hourly)", other),
        }

        Ok(())
    }

    fn validate_sender(&self) -> Result<()> {
        let sender = &self.sender;
        if sender.batch_limit == 0 {
            anyhow::bail!("sender.batch_limit must be greater than zero");
        }
        if sender.buffer_cap < sender.batch_limit {
            anyhow::bail!(
                "sender.buffer_cap ({}) must be at least sender.batch_limit ({})",
                sender.buffer_cap,
                sender.batch_limit
            );
        }
        if sender.flush_interval_ms == 0 || sender.io_timeout_secs == 0 {
            anyhow::bail!("Sender flush interval and I/O timeout must be greater than zero");
        }
        if sender.initial_backoff_ms == 0 || Duration::from_millis(sender.initial_backoff_ms) > Duration::from_secs(sender.max_backoff_secs) {
            anyhow::bail!("sender backoff must satisfy 0 < initial_backoff <= max_backoff");
        }
        if sender.default_port == 0 {
            anyhow::bail!("sender.default_port must be greater than zero");
        }
        Ok(())
    }
}
