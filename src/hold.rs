//! Hold Queue
//!
//! Correlates two-phase trap sequences. An event whose rule carries a hold
//! policy opens (or refreshes) an entry keyed by source address, trap name and
//! ifIndex. A later final event with the same key cancels the entry. An entry
//! that reaches its deadline is released to the router as a fallback event
//! with the rule's marker as its variant digit.
//!
//! The queue has exactly one owner: the task running [`HoldQueue::run`]. It is
//! driven by arrivals and by a one-second tick.

use crate::rules::RuleTables;
use crate::stats::TrapStats;
use crate::trap::CanonicalEvent;
use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub source: IpAddr,
    pub name: String,
    pub if_index: Option<String>,
}

impl CorrelationKey {
    pub fn of(event: &CanonicalEvent) -> Self {
        Self {
            source: event.source,
            name: event.name.clone(),
            if_index: event.if_index.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct HoldEntry {
    event: CanonicalEvent,
    deadline: Instant,
    marker: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    Held,
    Refreshed,
    Cancelled,
    Ignored,
}

pub struct HoldQueue {
    rules: Arc<RuleTables>,
    entries: HashMap<CorrelationKey, HoldEntry>,
}

impl HoldQueue {
    pub fn new(rules: Arc<RuleTables>) -> Self {
        Self {
            rules,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_held(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Apply one arriving event to the pending set.
    pub fn observe(&mut self, event: CanonicalEvent, now: Instant) -> HoldOutcome {
        let key = CorrelationKey::of(&event);
        let policy = self.rules.trap_rule(&event.oid).and_then(|rule| rule.hold);

        if let Some(entry) = self.entries.get_mut(&key) {
            return match policy {
                Some(policy) => {
                    entry.deadline = now + Duration::from_secs(policy.hold_secs);
                    entry.marker = policy.marker;
                    HoldOutcome::Refreshed
                }
                None => {
                    self.entries.remove(&key);
                    debug!(source = %key.source, trap = %key.name, "Hold cancelled by completing trap");
                    HoldOutcome::Cancelled
                }
            };
        }

        match policy {
            Some(policy) => {
                debug!(source = %key.source, trap = %key.name, secs = policy.hold_secs, "Holding trap");
                self.entries.insert(
                    key,
                    HoldEntry {
                        event,
                        deadline: now + Duration::from_secs(policy.hold_secs),
                        marker: policy.marker,
                    },
                );
                HoldOutcome::Held
            }
            None => HoldOutcome::Ignored,
        }
    }

    /// Remove and finalise every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<CanonicalEvent> {
        let due: Vec<CorrelationKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|entry| {
                let mut event = entry.event;
                event.variant = entry.marker;
                event.received_at = Utc::now();
                event
            })
            .collect()
    }

    /// Own the queue: consume converted events and push fallbacks to the router.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<CanonicalEvent>,
        router: mpsc::Sender<CanonicalEvent>,
        stats: Arc<TrapStats>,
    ) {
        info!("Hold queue started");
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            self.observe(event, Instant::now());
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {}
            }

            for event in self.expire(Instant::now()) {
                info!(source = %event.source, trap = %event.name, marker = %event.variant, "Hold expired, sending fallback");
                stats.record_lost();
                if router.send(event).await.is_err() {
                    warn!("Router queue closed, hold queue stopping");
                    return;
                }
            }
        }
        info!("Hold queue stopped with {} pending entries", self.entries.len());
    }
}
