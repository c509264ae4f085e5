//! Coordinator-side staleness detection.
//!
//! Advisory only: a stale node keeps its authorization. The node itself
//! decides whether to withdraw its route.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::registry::EdgeRegistry;
use crate::types::StaleNode;

pub struct HealthMonitor {
    registry: Arc<EdgeRegistry>,
    threshold: chrono::Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<EdgeRegistry>, threshold: Duration) -> Self {
        Self {
            registry,
            threshold: chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn scan(&self) -> Vec<StaleNode> {
        self.scan_at(Utc::now())
    }

    /// Authorized nodes silent for longer than the threshold, plus
    /// authorized nodes that never sent a heartbeat.
    pub fn scan_at(&self, now: DateTime<Utc>) -> Vec<StaleNode> {
        self.registry
            .authorized_snapshot()
            .into_iter()
            .filter_map(|node| match node.last_seen {
                Some(seen) if now - seen <= self.threshold => None,
                Some(seen) => Some(StaleNode {
                    id: node.id,
                    last_seen: Some(seen),
                    silent_for_secs: Some((now - seen).num_seconds()),
                }),
                None => Some(StaleNode {
                    id: node.id,
                    last_seen: None,
                    silent_for_secs: None,
                }),
            })
            .collect()
    }

    /// Scan every `interval` and publish each stale node on `events`.
    /// The task ends when the receiving side is dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration, events: mpsc::Sender<StaleNode>) -> JoinHandle<()> {
        info!(
            "Starting health monitor (interval: {:?}, threshold: {}s)",
            interval,
            self.threshold.num_seconds()
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let stale = self.scan();
                debug!("Health scan found {} stale nodes", stale.len());
                for node in stale {
                    warn!(
                        "Node {} is stale (last seen {:?})",
                        node.id, node.last_seen
                    );
                    if events.send(node).await.is_err() {
                        info!("Health monitor stopped");
                        return;
                    }
                }
            }
        })
    }
}
