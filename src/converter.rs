//! Normalises admitted traps into canonical events.

use crate::rules::{RuleTables, IF_INDEX};
use crate::trap::{variant_digit, CanonicalEvent, FilteredEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

pub struct Converter {
    rules: Arc<RuleTables>,
}

impl Converter {
    pub fn new(rules: Arc<RuleTables>) -> Self {
        Self { rules }
    }

    pub fn convert(&self, event: FilteredEvent) -> CanonicalEvent {
        let oid = event.trap.oid;
        let name = self
            .rules
            .trap_rule(&oid)
            .map(|rule| rule.name)
            .unwrap_or_else(|| oid.clone());

        let mut if_index = None;
        let mut variables = BTreeMap::new();
        for binding in event.bindings {
            match self.rules.variable_name(&binding.oid) {
                Some(var) if var == IF_INDEX => {
                    if if_index.is_none() {
                        if_index = Some(binding.value);
                    }
                }
                Some(var) => {
                    variables.insert(var, binding.value);
                }
                None => trace!(oid = %binding.oid, "Unmapped variable dropped"),
            }
        }

        CanonicalEvent {
            received_at: event.received_at,
            source: event.source,
            variant: variant_digit(&oid).to_string(),
            name,
            oid,
            if_index,
            variables,
        }
    }

    /// Convert every admitted trap and hand a copy to both the router and the hold queue.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<FilteredEvent>,
        router: mpsc::Sender<CanonicalEvent>,
        hold: mpsc::Sender<CanonicalEvent>,
    ) {
        info!("Converter started");
        while let Some(event) = rx.recv().await {
            let canonical = self.convert(event);
            if router.send(canonical.clone()).await.is_err() || hold.send(canonical).await.is_err() {
                warn!("Downstream queue closed, converter stopping");
                return;
            }
        }
        info!("Converter stopped");
    }
}
