//! In-memory tree store
//!
//! Backs the tree server and doubles as the store used in tests. Children
//! of a node are kept in key order, which makes push keys come back in
//! insertion order.

use crate::paths::segments;
use crate::store::{ChildEvent, PushKeys, StoreError, Subscription, TreeStore};
use crate::now_ms;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Watcher {
    path: Vec<String>,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

struct Inner {
    root: Value,
    keys: PushKeys,
    watchers: Vec<Watcher>,
}

/// Shared in-memory tree. Clones refer to the same tree.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root: Value::Null,
                keys: PushKeys::new(),
                watchers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read a copy of the node at `path`
    pub fn read(&self, path: &str) -> Option<Value> {
        let segs = split(path);
        let inner = self.lock();
        node_at(&inner.root, &segs).cloned()
    }

    /// Direct children of `path` in key order
    pub fn children(&self, path: &str) -> Vec<(String, Value)> {
        let segs = split(path);
        let inner = self.lock();
        children_of(&inner.root, &segs).into_iter().collect()
    }

    /// End every open subscription, as a dropped transport would
    pub fn cancel_subscriptions(&self) {
        self.lock().watchers.clear();
    }

    /// Number of subscriptions still attached
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    fn mutate(&self, segs: &[String], value: Value) {
        let mut inner = self.lock();
        let before: Vec<Map<String, Value>> = inner
            .watchers
            .iter()
            .map(|w| children_of(&inner.root, &w.path))
            .collect();

        if value.is_null() {
            remove_at(&mut inner.root, segs);
        } else {
            set_at(&mut inner.root, segs, value);
        }

        let Inner { root, watchers, .. } = &mut *inner;
        let mut index = 0;
        watchers.retain(|watcher| {
            let after = children_of(root, &watcher.path);
            let events = diff(&before[index], &after);
            index += 1;
            events.into_iter().all(|event| watcher.tx.send(event).is_ok())
        });
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = checked(path)?;
        self.mutate(&segs, value);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let segs = checked(path)?;
        self.mutate(&segs, Value::Null);
        Ok(())
    }

    async fn push_key(&self, path: &str) -> Result<String, StoreError> {
        checked(path)?;
        Ok(self.lock().keys.next(now_ms()))
    }

    async fn subscribe_child_events(&self, path: &str) -> Result<Subscription, StoreError> {
        let segs = checked(path)?;
        let (tx, subscription) = Subscription::channel(path);

        let mut inner = self.lock();
        for (key, value) in children_of(&inner.root, &segs) {
            let _ = tx.send(ChildEvent::Added { key, value });
        }
        inner.watchers.push(Watcher { path: segs, tx });

        Ok(subscription)
    }
}

fn split(path: &str) -> Vec<String> {
    segments(path).map(str::to_string).collect()
}

fn checked(path: &str) -> Result<Vec<String>, StoreError> {
    let segs = split(path);
    if segs.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

fn node_at<'a>(node: &'a Value, segs: &[String]) -> Option<&'a Value> {
    match segs.split_first() {
        None if node.is_null() => None,
        None => Some(node),
        Some((head, rest)) => node_at(node.as_object()?.get(head)?, rest),
    }
}

fn children_of(root: &Value, segs: &[String]) -> Map<String, Value> {
    node_at(root, segs)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn set_at(node: &mut Value, segs: &[String], value: Value) {
    match segs.split_first() {
        None => *node = value,
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(head.clone()).or_insert(Value::Null);
                set_at(child, rest, value);
            }
        }
    }
}

/// Remove the node at `segs`, pruning parents left without children
fn remove_at(node: &mut Value, segs: &[String]) {
    let Some((head, rest)) = segs.split_first() else {
        *node = Value::Null;
        return;
    };
    if let Value::Object(map) = node {
        if rest.is_empty() {
            map.remove(head);
        } else if let Some(child) = map.get_mut(head) {
            remove_at(child, rest);
            if is_empty(child) {
                map.remove(head);
            }
        }
        if map.is_empty() {
            *node = Value::Null;
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn diff(before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<ChildEvent> {
    let mut events = Vec::new();
    for (key, value) in after {
        match before.get(key) {
            None => events.push(ChildEvent::Added {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(old) if old != value => events.push(ChildEvent::Changed {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(_) => {}
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            events.push(ChildEvent::Removed { key: key.clone() });
        }
    }
    events
}
