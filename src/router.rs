//! Router: fans canonical events out to the proxies serving their source.

use crate::hosts::HostRegistry;
use crate::proxy::ProxyRegistry;
use crate::trap::{CanonicalEvent, RoutedEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Router {
    hosts: Arc<HostRegistry>,
    proxies: Arc<ProxyRegistry>,
}

impl Router {
    pub fn new(hosts: Arc<HostRegistry>, proxies: Arc<ProxyRegistry>) -> Self {
        Self { hosts, proxies }
    }

    /// Queue one copy per distinct proxy; returns how many were queued.
    ///
    /// Hosts sharing the source address and proxy are deduplicated here; the
    /// sender expands the copy into one data item per host name.
    pub async fn dispatch(&self, event: CanonicalEvent) -> usize {
        let targets = self.hosts.proxies_for(event.source);
        if targets.is_empty() {
            debug!(source = %event.source, trap = %event.name, "No proxy for source, event dropped");
            return 0;
        }

        let mut queued = 0;
        for proxy in targets {
            self.proxies.ensure(&proxy).await;
            let routed = RoutedEvent {
                proxy: proxy.clone(),
                event: event.clone(),
            };
            match self.proxies.enqueue(&proxy, routed).await {
                Ok(()) => queued += 1,
                Err(e) => warn!(proxy = %proxy, source = %event.source, "Failed to queue event: {}", e),
            }
        }
        queued
    }

    pub async fn run(self, mut rx: mpsc::Receiver<CanonicalEvent>) {
        info!("Router started");
        while let Some(event) = rx.recv().await {
            self.dispatch(event).await;
        }
        info!("Router stopped");
    }
}
