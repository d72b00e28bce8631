//! Per-proxy batching sender
//!
//! One worker per proxy owns that proxy's outbound queue. Routed events are
//! expanded into data items (one per host identity behind the source address)
//! and buffered. The buffer is flushed when the next event would push it past
//! the batch limit, and on every idle tick while it is non-empty.
//!
//! Both flush paths share one policy: the buffer goes out in chunks of at most
//! the batch limit, acknowledged chunks leave the buffer, and the first failed
//! chunk stops the flush and schedules a retry with exponential backoff. The
//! buffer is bounded; overflow drops the oldest items as undelivered.

use crate::hosts::HostRegistry;
use crate::stats::TrapStats;
use crate::trap::RoutedEvent;
use crate::wire::{self, DataItem};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reserved value-map key carrying the variant digit
pub const LAST_DIGIT_KEY: &str = "lastdigit";

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub batch_limit: usize,
    pub flush_interval: Duration,
    pub buffer_cap: usize,
    pub io_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            batch_limit: 128,
            flush_interval: Duration::from_secs(1),
            buffer_cap: 1024,
            io_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Shared collaborators handed to every sender worker
#[derive(Debug, Clone)]
pub struct SenderContext {
    pub hosts: Arc<HostRegistry>,
    pub stats: Arc<TrapStats>,
    pub settings: SenderSettings,
}

/// Expand a routed event into one data item per host name on its proxy.
pub fn make_data_items(routed: &RoutedEvent, hosts: &HostRegistry) -> Vec<DataItem> {
    let event = &routed.event;

    let mut values: BTreeMap<&str, &str> = BTreeMap::new();
    values.insert(LAST_DIGIT_KEY, &event.variant);
    for (name, value) in &event.variables {
        values.insert(name, value);
    }
    let value = match serde_json::to_string(&values) {
        Ok(value) => value,
        Err(e) => {
            warn!(trap = %event.name, "Failed to encode value map: {}", e);
            return Vec::new();
        }
    };

    let key = event.item_key();
    let clock = event.received_at.timestamp();
    let ns = event.received_at.timestamp_subsec_nanos();

    hosts
        .host_names(event.source, &routed.proxy)
        .into_iter()
        .map(|host| DataItem {
            host,
            key: key.clone(),
            clock,
            ns,
            value: value.clone(),
        })
        .collect()
}

pub struct ProxySender {
    proxy: String,
    addr: SocketAddr,
    rx: mpsc::Receiver<RoutedEvent>,
    ctx: SenderContext,
    buffer: VecDeque<DataItem>,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl ProxySender {
    pub fn new(proxy: String, addr: SocketAddr, rx: mpsc::Receiver<RoutedEvent>, ctx: SenderContext) -> Self {
        let backoff = ctx.settings.initial_backoff;
        Self {
            proxy,
            addr,
            rx,
            ctx,
            buffer: VecDeque::new(),
            backoff,
            retry_at: None,
        }
    }

    pub async fn run(mut self) {
        info!(proxy = %self.proxy, addr = %self.addr, "Sender started");

        let period = self.ctx.settings.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                routed = self.rx.recv() => {
                    match routed {
                        Some(routed) => self.accept(routed).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() && self.may_attempt() {
                        self.flush().await;
                    }
                }
            }
        }

        if !self.buffer.is_empty() {
            debug!(proxy = %self.proxy, "Queue closed, final flush of {} items", self.buffer.len());
            if !self.flush().await {
                let dropped = self.buffer.len() as u64;
                warn!(proxy = %self.proxy, "Discarding {} undelivered items on shutdown", dropped);
                self.ctx.stats.record_undelivered(dropped);
            }
        }
        info!(proxy = %self.proxy, "Sender stopped");
    }

    async fn accept(&mut self, routed: RoutedEvent) {
        let items = make_data_items(&routed, &self.ctx.hosts);
        if items.is_empty() {
            debug!(proxy = %self.proxy, source = %routed.event.source, "No host names for event, dropped");
            return;
        }

        if self.buffer.len() + items.len() > self.ctx.settings.batch_limit && self.may_attempt() {
            self.flush().await;
        }

        self.buffer.extend(items);
        self.enforce_cap();
    }

    fn may_attempt(&self) -> bool {
        self.retry_at.map_or(true, |at| Instant::now() >= at)
    }

    fn enforce_cap(&mut self) {
        let cap = self.ctx.settings.buffer_cap;
        if self.buffer.len() > cap {
            let excess = self.buffer.len() - cap;
            self.buffer.drain(..excess);
            warn!(proxy = %self.proxy, "Send buffer full, dropped {} oldest items", excess);
            self.ctx.stats.record_undelivered(excess as u64);
        }
    }

    /// Send the buffer chunk by chunk; `true` when it was fully drained.
    async fn flush(&mut self) -> bool {
        let limit = self.ctx.settings.batch_limit.max(1);

        while !self.buffer.is_empty() {
            let n = limit.min(self.buffer.len());
            let chunk: Vec<DataItem> = self.buffer.iter().take(n).cloned().collect();

            match wire::send_batch(self.addr, &chunk, self.ctx.settings.io_timeout, &self.ctx.stats).await {
                Ok(_) => {
                    self.buffer.drain(..n);
                    self.backoff = self.ctx.settings.initial_backoff;
                    self.retry_at = None;
                }
                Err(e) => {
                    warn!(
                        proxy = %self.proxy,
                        addr = %self.addr,
                        pending = self.buffer.len(),
                        "Delivery failed, retrying in {:?}: {}",
                        self.backoff,
                        e
                    );
                    self.retry_at = Some(Instant::now() + self.backoff);
                    self.backoff = (self.backoff * 2).min(self.ctx.settings.max_backoff);
                    return false;
                }
            }
        }

        true
    }
}
