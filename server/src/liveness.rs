//! Liveness tracking for devices writing heartbeats into the tree

use agent_shared::{now_ms, presence, MemoryStore};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

/// A device crossing between live and stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChange {
    pub device_id: String,
    pub live: bool,
    pub last_seen_at: Option<u64>,
}

/// Periodically infers device liveness from `descriptor/lastSeenAt`
pub struct LivenessSweeper {
    store: MemoryStore,
    root: String,
    period: Duration,
    /// device_id -> last inferred liveness
    known: HashMap<String, bool>,
}

impl LivenessSweeper {
    pub fn new(store: MemoryStore, root: impl Into<String>, period: Duration) -> Self {
        Self {
            store,
            root: root.into(),
            period,
            known: HashMap::new(),
        }
    }

    /// Evaluate every device under the root and return the transitions
    /// since the previous sweep
    pub fn sweep(&mut self, now: u64) -> Vec<LivenessChange> {
        let period_ms = self.period.as_millis() as u64;
        let mut changes = Vec::new();
        let mut present = Vec::new();

        for (device_id, node) in self.store.children(&self.root) {
            let last_seen_at = node
                .get("descriptor")
                .and_then(|d| d.get("lastSeenAt"))
                .and_then(|v| v.as_u64());
            let live = last_seen_at
                .is_some_and(|seen| !presence::is_stale(seen, now, period_ms));

            if self.known.get(&device_id) != Some(&live) {
                changes.push(LivenessChange {
                    device_id: device_id.clone(),
                    live,
                    last_seen_at,
                });
                self.known.insert(device_id.clone(), live);
            }
            present.push(device_id);
        }

        // Devices whose whole subtree disappeared
        self.known.retain(|id, _| present.contains(id));
        changes
    }

    /// Sweep once per heartbeat period, forever
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);

        loop {
            ticker.tick().await;

            for change in self.sweep(now_ms()) {
                if change.live {
                    info!("Device {} is live", change.device_id);
                } else {
                    match change.last_seen_at {
                        Some(seen) => warn!(
                            "Device {} is stale (last seen {} ms ago)",
                            change.device_id,
                            now_ms().saturating_sub(seen)
                        ),
                        None => warn!("Device {} has never sent a heartbeat", change.device_id),
                    }
                }
            }
        }
    }
}
