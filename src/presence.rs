//! Presence Manager
//!
//! Announces the device descriptor on start and re-sends the full payload
//! on every heartbeat tick, so each tick alone proves liveness. Controllers
//! should treat a device as offline once `lastSeenAt` is older than two
//! periods (see [`agent_shared::presence::is_stale`]); the `online: false`
//! write on orderly shutdown is advisory only.

use crate::descriptor::DescriptorSource;
use agent_shared::{now_ms, DevicePaths, StoreError, TreeStore};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Writes the device descriptor and heartbeat
pub struct PresenceManager {
    store: Arc<dyn TreeStore>,
    paths: DevicePaths,
    source: DescriptorSource,
    period: Duration,
    write_timeout: Duration,
}

impl PresenceManager {
    pub fn new(
        store: Arc<dyn TreeStore>,
        paths: DevicePaths,
        source: DescriptorSource,
        period: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            store,
            paths,
            source,
            period,
            write_timeout,
        }
    }

    /// Full heartbeat payload: descriptor plus `online` and `lastSeenAt`
    pub fn heartbeat_payload(&self) -> Value {
        let mut fields = self.source.snapshot();
        fields.insert("online".into(), json!(true));
        fields.insert("lastSeenAt".into(), json!(now_ms()));
        Value::Object(fields)
    }

    /// Write the full descriptor once
    pub async fn announce(&self) -> Result<(), StoreError> {
        let payload = self.heartbeat_payload();
        self.bounded(self.store.write(&self.paths.descriptor(), payload))
            .await
    }

    /// Record an orderly shutdown. Both fields are attempted; the first
    /// error is returned.
    pub async fn mark_offline(&self) -> Result<(), StoreError> {
        let seen = now_ms();
        let last_seen = self
            .bounded(
                self.store
                    .write(&self.paths.descriptor_field("lastSeenAt"), json!(seen)),
            )
            .await;
        let online = self
            .bounded(
                self.store
                    .write(&self.paths.descriptor_field("online"), json!(false)),
            )
            .await;
        last_seen.and(online)
    }

    async fn bounded(
        &self,
        write: impl Future<Output = Result<(), StoreError>>,
    ) -> Result<(), StoreError> {
        timeout(self.write_timeout, write)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    /// Start the heartbeat task. The returned handle owns its lifecycle.
    pub fn start(self) -> PresenceHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reannounce = Arc::new(Notify::new());
        let wake = reannounce.clone();
        let manager = self;

        let task = tokio::spawn(async move {
            let mut ticker = interval(manager.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => ticker.reset(),
                }

                // A failed beat is skipped; the next tick retries
                match manager.announce().await {
                    Ok(()) => debug!("Heartbeat written for {}", manager.source.device_id()),
                    Err(e) => warn!("Heartbeat failed: {}", e),
                }
            }

            match manager.mark_offline().await {
                Ok(()) => info!("Marked {} offline", manager.source.device_id()),
                Err(e) => warn!("Failed to mark device offline: {}", e),
            }
        });

        PresenceHandle {
            shutdown_tx,
            reannounce,
            task,
        }
    }
}

/// Handle to the running heartbeat task
pub struct PresenceHandle {
    shutdown_tx: watch::Sender<bool>,
    reannounce: Arc<Notify>,
    task: JoinHandle<()>,
}

impl PresenceHandle {
    /// Send the descriptor now, e.g. after the store connection came back
    pub fn reannounce(&self) {
        self.reannounce.notify_one();
    }

    /// Stop heartbeats and write `online: false`
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStore;
    use agent_shared::MemoryStore;
    use tokio::time::{sleep, Instant};

    fn manager(store: Arc<dyn TreeStore>, period: Duration) -> PresenceManager {
        PresenceManager::new(
            store,
            DevicePaths::new("devices", "edge-001"),
            DescriptorSource::with_id("edge-001"),
            period,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_announce_writes_full_descriptor() {
        let memory = MemoryStore::new();
        manager(Arc::new(memory.clone()), Duration::from_secs(30))
            .announce()
            .await
            .unwrap();

        let descriptor = memory.read("devices/edge-001/descriptor").unwrap();
        assert_eq!(descriptor["online"], true);
        assert_eq!(descriptor["deviceId"], "edge-001");
        assert!(descriptor["lastSeenAt"].as_u64().unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_period() {
        let store = Arc::new(RecordingStore::new());
        let start = Instant::now();
        let handle = manager(store.clone(), Duration::from_secs(30)).start();

        sleep(Duration::from_secs(95)).await;
        handle.shutdown().await;

        let beats: Vec<Duration> = store
            .writes()
            .into_iter()
            .filter(|w| w.path == "devices/edge-001/descriptor")
            .map(|w| w.at - start)
            .collect();
        assert_eq!(beats.len(), 4, "beats at {:?}", beats);
        for (i, at) in beats.iter().enumerate() {
            let expected = Duration::from_secs(30 * i as u64);
            assert!(
                *at >= expected && *at < expected + Duration::from_secs(1),
                "beat {} at {:?}",
                i,
                at
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_writes_offline_last() {
        let store = Arc::new(RecordingStore::new());
        let handle = manager(store.clone(), Duration::from_secs(30)).start();
        sleep(Duration::from_secs(1)).await;
        handle.shutdown().await;

        let writes = store.writes();
        let last = writes.last().unwrap();
        assert_eq!(last.path, "devices/edge-001/descriptor/online");
        assert_eq!(last.value, json!(false));
        assert_eq!(
            store.memory().read("devices/edge-001/descriptor/deviceId"),
            Some(json!("edge-001")),
            "offline write must keep the descriptor"
        );
    }

    #[tokio::test]
    async fn test_offline_written_when_last_seen_fails() {
        let store = Arc::new(RecordingStore::new());
        let presence = manager(store.clone(), Duration::from_secs(30));
        presence.announce().await.unwrap();
        store.fail_writes_under("devices/edge-001/descriptor/lastSeenAt");

        let result = presence.mark_offline().await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(
            store.memory().read("devices/edge-001/descriptor/online"),
            Some(json!(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_beat_is_retried_next_tick() {
        let store = Arc::new(RecordingStore::new());
        store.fail_writes_under("devices/edge-001/descriptor");
        let handle = manager(store.clone(), Duration::from_secs(30)).start();

        sleep(Duration::from_secs(1)).await;
        assert!(store.memory().read("devices/edge-001/descriptor").is_none());

        store.clear_failures();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(
            store.memory().read("devices/edge-001/descriptor/online"),
            Some(json!(true))
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reannounce_beats_immediately() {
        let store = Arc::new(RecordingStore::new());
        let handle = manager(store.clone(), Duration::from_secs(30)).start();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(store.writes().len(), 1);

        handle.reannounce();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(store.writes().len(), 2);

        // Next regular beat is a full period after the re-announce
        sleep(Duration::from_secs(25)).await;
        assert_eq!(store.writes().len(), 2);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(store.writes().len(), 3);
        handle.shutdown().await;
    }
}
