//! Process-wide trap counters and the status report

use crate::cluster::ClusterPhase;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TrapStats {
    started: Instant,
    received: AtomicU64,
    passed_v2: AtomicU64,
    passed_v3: AtomicU64,
    test: AtomicU64,
    delivered: AtomicU64,
    undelivered: AtomicU64,
    lost: AtomicU64,
}

impl Default for TrapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            received: AtomicU64::new(0),
            passed_v2: AtomicU64::new(0),
            passed_v3: AtomicU64::new(0),
            test: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_passed(&self, authenticated: bool) {
        if authenticated {
            self.passed_v3.fetch_add(1, Ordering::Relaxed);
        } else {
            self.passed_v2.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_test(&self) {
        self.test.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: u64) {
        self.delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_undelivered(&self, count: u64) {
        self.undelivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(&self, node: NodeView) -> StatusReport {
        StatusReport {
            uptime: format_uptime(self.uptime()),
            received: self.received(),
            passedv2: self.passed_v2.load(Ordering::Relaxed),
            passedv3: self.passed_v3.load(Ordering::Relaxed),
            testtrap: self.test.load(Ordering::Relaxed),
            delivered: self.delivered(),
            undelivered: self.undelivered(),
            lost: self.lost(),
            master: node.master,
            phase: node.phase,
            proxies: node.proxies,
            unresolved_proxies: node.unresolved_proxies,
        }
    }
}

/// Cluster and proxy state reported next to the counters
#[derive(Debug, Clone, Default)]
pub struct NodeView {
    pub master: bool,
    pub phase: ClusterPhase,
    pub proxies: Vec<String>,
    pub unresolved_proxies: Vec<String>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub uptime: String,
    pub received: u64,
    pub passedv2: u64,
    pub passedv3: u64,
    pub testtrap: u64,
    pub delivered: u64,
    pub undelivered: u64,
    pub lost: u64,
    pub master: bool,
    pub phase: ClusterPhase,
    pub proxies: Vec<String>,
    pub unresolved_proxies: Vec<String>,
}

/// `1h2m3s` style uptime.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
