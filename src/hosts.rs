//! Host Registry
//!
//! Known monitored hosts, keyed by (host name, source IP, instance). Fed by
//! the directory poller and by admin reassignment; consulted by the filter,
//! the router and the senders. Readers get copies, never references into the
//! table.

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub name: String,
    pub address: IpAddr,
    pub proxy: String,
    pub instance: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<Vec<HostRecord>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, name: &str, address: IpAddr, proxy: &str, instance: &str) {
        self.upsert_at(name, address, proxy, instance, Utc::now());
    }

    /// Update the proxy and last-seen of a matching record, or insert a new one.
    pub fn upsert_at(&self, name: &str, address: IpAddr, proxy: &str, instance: &str, now: DateTime<Utc>) {
        let mut hosts = self.hosts.write();
        if let Some(host) = hosts
            .iter_mut()
            .find(|h| h.name == name && h.address == address && h.instance == instance)
        {
            host.proxy = proxy.to_string();
            host.last_seen = now;
            return;
        }

        debug!(host = name, %address, proxy, instance, "New host");
        hosts.push(HostRecord {
            name: name.to_string(),
            address,
            proxy: proxy.to_string(),
            instance: instance.to_string(),
            last_seen: now,
        });
    }

    /// Move every record of `name` on `instance` to `proxy`.
    pub fn reassign(&self, name: &str, instance: &str, proxy: &str) -> Result<(), RegistryError> {
        let now = Utc::now();
        let mut found = false;
        for host in self
            .hosts
            .write()
            .iter_mut()
            .filter(|h| h.name == name && h.instance == instance)
        {
            host.proxy = proxy.to_string();
            host.last_seen = now;
            found = true;
        }

        if found {
            Ok(())
        } else {
            Err(RegistryError::HostNotFound {
                host: name.to_string(),
                instance: instance.to_string(),
            })
        }
    }

    pub fn contains_address(&self, address: IpAddr) -> bool {
        self.hosts.read().iter().any(|h| h.address == address)
    }

    /// Address of a uniformly chosen host.
    pub fn random_address(&self) -> Option<IpAddr> {
        self.hosts
            .read()
            .choose(&mut rand::thread_rng())
            .map(|h| h.address)
    }

    /// Distinct non-empty proxies assigned to hosts at `address`.
    pub fn proxies_for(&self, address: IpAddr) -> Vec<String> {
        self.hosts
            .read()
            .iter()
            .filter(|h| h.address == address && !h.proxy.is_empty())
            .map(|h| h.proxy.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Names of every host sharing one address and proxy.
    pub fn host_names(&self, address: IpAddr, proxy: &str) -> Vec<String> {
        self.hosts
            .read()
            .iter()
            .filter(|h| h.address == address && h.proxy == proxy)
            .map(|h| h.name.clone())
            .collect()
    }

    /// Refresh last-seen for every host of one instance.
    pub fn touch_instance(&self, instance: &str, now: DateTime<Utc>) {
        for host in self.hosts.write().iter_mut().filter(|h| h.instance == instance) {
            host.last_seen = now;
        }
    }

    /// Drop hosts not refreshed since `cutoff`; returns how many went.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut hosts = self.hosts.write();
        let before = hosts.len();
        hosts.retain(|h| {
            let keep = h.last_seen >= cutoff;
            if !keep {
                debug!(host = %h.name, address = %h.address, instance = %h.instance, "Evicting stale host");
            }
            keep
        });
        before - hosts.len()
    }

    pub fn references_proxy(&self, proxy: &str) -> bool {
        self.hosts.read().iter().any(|h| h.proxy == proxy)
    }

    pub fn proxy_names(&self) -> BTreeSet<String> {
        self.hosts
            .read()
            .iter()
            .filter(|h| !h.proxy.is_empty())
            .map(|h| h.proxy.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<HostRecord> {
        self.hosts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn upsert_matches_on_name_address_and_instance() {
        let registry = HostRegistry::new();
        registry.upsert("router1", ip("10.0.0.1"), "proxy-a", "east");
        registry.upsert("router1", ip("10.0.0.1"), "proxy-b", "east");
        registry.upsert("router1", ip("10.0.0.1"), "proxy-a", "west");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.proxies_for(ip("10.0.0.1")), vec!["proxy-a", "proxy-b"]);
    }

    #[test]
    fn reassign_unknown_host_fails() {
        let registry = HostRegistry::new();
        registry.upsert("router1", ip("10.0.0.1"), "proxy-a", "east");

        assert!(registry.reassign("router1", "east", "proxy-b").is_ok());
        assert_eq!(registry.host_names(ip("10.0.0.1"), "proxy-b"), vec!["router1"]);
        assert_eq!(
            registry.reassign("router9", "east", "proxy-b"),
            Err(RegistryError::HostNotFound {
                host: "router9".into(),
                instance: "east".into()
            })
        );
    }

    #[test]
    fn host_names_share_address_and_proxy() {
        let registry = HostRegistry::new();
        registry.upsert("a", ip("10.0.0.1"), "p1", "east");
        registry.upsert("b", ip("10.0.0.1"), "p1", "east");
        registry.upsert("c", ip("10.0.0.1"), "p2", "east");

        let mut names = registry.host_names(ip("10.0.0.1"), "p1");
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn evicts_hosts_not_refreshed_in_cycle() {
        let registry = HostRegistry::new();
        let t0 = Utc::now();
        registry.upsert_at("old", ip("10.0.0.1"), "p1", "east", t0);
        registry.upsert_at("fresh", ip("10.0.0.2"), "p2", "east", t0);

        let cycle_start = t0 + Duration::seconds(60);
        registry.upsert_at("fresh", ip("10.0.0.2"), "p2", "east", cycle_start);

        assert_eq!(registry.evict_older_than(cycle_start), 1);
        assert!(!registry.contains_address(ip("10.0.0.1")));
        assert!(!registry.references_proxy("p1"));
        assert!(registry.references_proxy("p2"));
    }

    #[test]
    fn random_address_comes_from_registry() {
        let registry = HostRegistry::new();
        assert!(registry.random_address().is_none());
        registry.upsert("a", ip("10.0.0.7"), "p1", "east");
        assert_eq!(registry.random_address(), Some(ip("10.0.0.7")));
    }
}
