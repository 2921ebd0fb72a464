//! Test doubles shared by the agent's unit tests

use agent_shared::{MemoryStore, StoreError, Subscription, TreeStore};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub path: String,
    pub value: Value,
    pub at: Instant,
}

/// Memory store that records writes and delete attempts, and can fail
/// writes under a path prefix or the next few deletes
#[derive(Default)]
pub struct RecordingStore {
    memory: MemoryStore,
    writes: Mutex<Vec<RecordedWrite>>,
    deletes: Mutex<Vec<String>>,
    fail_prefix: Mutex<Option<String>>,
    failing_deletes: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    /// Fail the next `count` deletes as a dropped connection would
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        *self.fail_prefix.lock().unwrap() = None;
        self.failing_deletes.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl TreeStore for RecordingStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push(RecordedWrite {
            path: path.to_string(),
            value: value.clone(),
            at: Instant::now(),
        });
        let failing = self
            .fail_prefix
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|prefix| path.starts_with(prefix));
        if failing {
            return Err(StoreError::Rejected("injected failure".into()));
        }
        self.memory.write(path, value).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(path.to_string());
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Disconnected);
        }
        self.memory.delete(path).await
    }

    async fn push_key(&self, path: &str) -> Result<String, StoreError> {
        self.memory.push_key(path).await
    }

    async fn subscribe_child_events(&self, path: &str) -> Result<Subscription, StoreError> {
        self.memory.subscribe_child_events(path).await
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
