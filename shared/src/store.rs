//! Remote tree store contract
//!
//! The agent needs exactly four primitives from the store it talks to:
//! point writes, deletes, ordered push keys, and an ordered stream of
//! child events for a path.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// A change to one direct child of a subscribed path
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added { key: String, value: Value },
    Changed { key: String, value: Value },
    Removed { key: String },
}

impl ChildEvent {
    pub fn key(&self) -> &str {
        match self {
            ChildEvent::Added { key, .. }
            | ChildEvent::Changed { key, .. }
            | ChildEvent::Removed { key } => key,
        }
    }
}

/// Errors returned by store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not connected to store")]
    Disconnected,

    #[error("Store request timed out")]
    Timeout,

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Store rejected request: {0}")]
    Rejected(String),

    #[error("Value encoding error: {0}")]
    Encoding(String),
}

/// Ordered stream of child events for one path.
///
/// The stream ending means the store cancelled the subscription
/// (transport loss, auth failure, server restart).
#[derive(Debug)]
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl Subscription {
    /// Create a subscription together with the sender that feeds it
    pub fn channel(path: impl Into<String>) -> (mpsc::UnboundedSender<ChildEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                path: path.into(),
                rx,
            },
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Receive the next event, or `None` once the subscription was cancelled
    pub async fn recv(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

/// Hierarchical key-value store shared by controller and agent
#[async_trait]
pub trait TreeStore: Send + Sync {
    /// Set the node at `path`. A `null` value removes the node.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Remove the node at `path`. Removing an absent node succeeds.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Allocate a unique child key under `path`, ordered after all earlier keys
    async fn push_key(&self, path: &str) -> Result<String, StoreError>;

    /// Subscribe to child events of `path`.
    ///
    /// Existing children are delivered first as `Added` in key order,
    /// followed by live changes in mutation order.
    async fn subscribe_child_events(&self, path: &str) -> Result<Subscription, StoreError>;
}

/// Generator for ordered push keys.
///
/// Keys are 12 hex digits of milliseconds followed by 8 hex digits of a
/// sequence counter, so lexicographic order is issue order even when the
/// clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct PushKeys {
    last_ms: u64,
    seq: u64,
}

impl PushKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, now_ms: u64) -> String {
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        format!("{:012x}{:08x}", self.last_ms, self.seq)
    }
}
