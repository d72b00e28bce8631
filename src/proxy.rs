//! Proxy Registry
//!
//! One entry per downstream proxy, created on first reference. Each entry owns
//! a bounded outbound queue and the sender worker draining it. Removing an
//! entry closes the queue; the worker makes a last flush and exits.
//!
//! Proxy names may embed a port after the last `_` (`proxy01_10052`). The
//! remainder is resolved through DNS. A failed lookup falls back to the
//! loopback address, logged at warn level and reported in the status output.

use crate::error::RegistryError;
use crate::hosts::HostRegistry;
use crate::sender::{ProxySender, SenderContext};
use crate::trap::RoutedEvent;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_PROXY_PORT: u16 = 10051;

/// Split a proxy name into its DNS name and port.
pub fn parse_proxy_target(name: &str, default_port: u16) -> (String, u16) {
    match name.rsplit_once('_') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (name.to_string(), default_port),
    }
}

struct ProxyEntry {
    addr: SocketAddr,
    queue: mpsc::Sender<RoutedEvent>,
    worker: JoinHandle<()>,
}

pub struct ProxyRegistry {
    proxies: RwLock<HashMap<String, ProxyEntry>>,
    unresolved: RwLock<BTreeSet<String>>,
    ctx: SenderContext,
    queue_capacity: usize,
    default_port: u16,
}

impl ProxyRegistry {
    pub fn new(ctx: SenderContext, queue_capacity: usize, default_port: u16) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            unresolved: RwLock::new(BTreeSet::new()),
            ctx,
            queue_capacity,
            default_port,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.proxies.read().contains_key(name)
    }

    pub fn address(&self, name: &str) -> Option<SocketAddr> {
        self.proxies.read().get(name).map(|p| p.addr)
    }

    /// Running proxy names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.proxies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    /// Proxies currently running on the loopback fallback
    pub fn unresolved(&self) -> Vec<String> {
        self.unresolved.read().iter().cloned().collect()
    }

    async fn resolve(&self, name: &str) -> SocketAddr {
        let (host, port) = parse_proxy_target(name, self.default_port);

        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    self.unresolved.write().remove(name);
                    return addr;
                }
                warn!(proxy = name, "DNS returned no addresses for {}, falling back to loopback", host);
            }
            Err(e) => {
                warn!(proxy = name, "Failed to resolve {}, falling back to loopback: {}", host, e);
            }
        }

        self.unresolved.write().insert(name.to_string());
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Create the proxy entry and start its sender unless it already exists.
    pub async fn ensure(&self, name: &str) {
        if name.is_empty() || self.contains(name) {
            return;
        }

        let addr = self.resolve(name).await;

        let mut proxies = self.proxies.write();
        if proxies.contains_key(name) {
            return;
        }

        let (queue, rx) = mpsc::channel(self.queue_capacity);
        let sender = ProxySender::new(name.to_string(), addr, rx, self.ctx.clone());
        let worker = tokio::spawn(sender.run());
        proxies.insert(name.to_string(), ProxyEntry { addr, queue, worker });
        info!(proxy = name, %addr, "Proxy registered");
    }

    /// Queue an event for a proxy, waiting while its queue is full.
    pub async fn enqueue(&self, proxy: &str, event: RoutedEvent) -> Result<(), RegistryError> {
        let queue = self
            .proxies
            .read()
            .get(proxy)
            .map(|p| p.queue.clone())
            .ok_or_else(|| RegistryError::UnknownProxy(proxy.to_string()))?;

        queue
            .send(event)
            .await
            .map_err(|_| RegistryError::QueueClosed(proxy.to_string()))
    }

    /// Close and remove every proxy no host references any more.
    pub fn sweep(&self, hosts: &HostRegistry) -> Vec<String> {
        let referenced = hosts.proxy_names();
        let mut removed = Vec::new();

        self.proxies.write().retain(|name, entry| {
            let keep = referenced.contains(name);
            if !keep {
                debug!(proxy = %name, addr = %entry.addr, "Closing unreferenced proxy");
                removed.push(name.clone());
            }
            keep
        });

        if !removed.is_empty() {
            let mut unresolved = self.unresolved.write();
            for name in &removed {
                unresolved.remove(name);
            }
            info!("Removed {} unreferenced proxies: {:?}", removed.len(), removed);
        }
        removed
    }

    /// Close every queue and wait for the workers' final flush.
    pub async fn shutdown(&self) {
        let entries: Vec<ProxyEntry> = self.proxies.write().drain().map(|(_, e)| e).collect();
        for entry in entries {
            drop(entry.queue);
            let _ = entry.worker.await;
        }
    }
}
