//! Command Channel Listener
//!
//! Subscribes to the device's command subtree and, for every new node:
//! 1. parses it (malformed nodes get an error response),
//! 2. hands it to the worker pool,
//! 3. deletes it from the store.
//!
//! The delete is the acknowledgment and happens once the pool has accepted
//! the command, not once it has finished, which gives at-most-once delivery.
//! The response is a separate write; if the agent dies between the two,
//! the command is consumed and its response is lost.
//!
//! A delete that fails is retried whenever the node is observed again
//! (typically the replay after a resubscription); the command itself is
//! never dispatched twice.

use crate::command::{PoolClosed, Submitter};
use crate::config::AgentConfig;
use crate::publisher::ResponsePublisher;
use agent_shared::{
    ChildEvent, Command, DevicePaths, ErrorKind, Response, StoreError, Subscription, TreeStore,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unsubscribed,
    Subscribing,
    Active,
    /// Subscription dropped by the transport; resubscribing after backoff
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Resubscription delay (initial)
    pub resubscribe_delay: Duration,
    /// Maximum resubscription delay
    pub max_resubscribe_delay: Duration,
    /// Upper bound for the acknowledging delete
    pub write_timeout: Duration,
}

impl From<&AgentConfig> for ListenerConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            resubscribe_delay: config.resubscribe_delay,
            max_resubscribe_delay: config.max_resubscribe_delay,
            write_timeout: config.write_timeout,
        }
    }
}

enum Flow {
    Resubscribe,
    Shutdown,
}

pub struct CommandListener {
    store: Arc<dyn TreeStore>,
    paths: DevicePaths,
    submitter: Submitter,
    publisher: ResponsePublisher,
    config: ListenerConfig,
    /// Command ids dispatched (or answered as malformed) whose node still exists
    dispatched: HashSet<String>,
    /// Subset of `dispatched` whose delete has not succeeded yet
    unacked: HashSet<String>,
    state: watch::Sender<ListenerState>,
}

impl CommandListener {
    pub fn new(
        store: Arc<dyn TreeStore>,
        paths: DevicePaths,
        submitter: Submitter,
        publisher: ResponsePublisher,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Unsubscribed);
        Self {
            store,
            paths,
            submitter,
            publisher,
            config,
            dispatched: HashSet::new(),
            unacked: HashSet::new(),
            state,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    /// Run until `shutdown` fires. Transport cancellations never end the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let path = self.paths.commands();
        let mut delay = self.config.resubscribe_delay;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ListenerState::Subscribing);
            match self.subscribe(&path, &mut shutdown).await {
                Some(Ok(subscription)) => {
                    delay = self.config.resubscribe_delay;
                    self.set_state(ListenerState::Active);
                    info!("Listening for commands at {}", path);

                    if let Flow::Shutdown = self.consume(subscription, &mut shutdown).await {
                        break;
                    }
                    self.set_state(ListenerState::Cancelled);
                    warn!(
                        "{}: command subscription dropped, resubscribing",
                        ErrorKind::TransportCancelled
                    );
                }
                Some(Err(e)) => warn!("Failed to subscribe to {}: {}", path, e),
                None => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            delay = std::cmp::min(delay * 2, self.config.max_resubscribe_delay);
        }

        self.set_state(ListenerState::Unsubscribed);
        info!("Command listener stopped");
    }

    /// Subscribe unless shutdown fires first
    async fn subscribe(
        &self,
        path: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Result<Subscription, StoreError>> {
        tokio::select! {
            result = self.store.subscribe_child_events(path) => Some(result),
            _ = shutdown.changed() => None,
        }
    }

    async fn consume(
        &mut self,
        mut subscription: Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Flow {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Flow::Shutdown,
                event = subscription.recv() => match event {
                    Some(ChildEvent::Added { key, value }) => self.handle_added(key, value).await,
                    Some(ChildEvent::Changed { key, .. }) => {
                        debug!("Command {} changed after enqueue, ignoring", key);
                    }
                    Some(ChildEvent::Removed { key }) => self.handle_removed(&key),
                    None => return Flow::Resubscribe,
                },
            }
        }
    }

    /// Process one new command node
    pub async fn handle_added(&mut self, key: String, value: Value) {
        if self.dispatched.contains(&key) {
            if self.unacked.contains(&key) {
                debug!("Command {} already dispatched, retrying delete", key);
                self.acknowledge(&key).await;
            } else {
                debug!("Command {} already observed, skipping", key);
            }
            return;
        }

        match Command::from_node(&key, &value) {
            Ok(command) => {
                info!("Command received: id={} name={}", command.id, command.name);
                if let Err(PoolClosed(command)) = self.submitter.submit(command).await {
                    // Not accepted, so not acknowledged
                    error!("Worker pool closed, leaving command {} in place", command.id);
                    return;
                }
            }
            Err(reason) => {
                warn!("{}: command {}: {}", ErrorKind::MalformedCommand, key, reason);
                self.publisher.publish(Response::malformed(&key, &value, &reason));
            }
        }

        self.dispatched.insert(key.clone());
        self.unacked.insert(key.clone());
        self.acknowledge(&key).await;
    }

    /// Forget a command once its node is gone; push keys are never reissued
    pub fn handle_removed(&mut self, key: &str) {
        debug!("Command {} removed", key);
        self.dispatched.remove(key);
        self.unacked.remove(key);
    }

    async fn acknowledge(&mut self, key: &str) {
        let path = self.paths.command(key);
        match timeout(self.config.write_timeout, self.store.delete(&path)).await {
            Ok(Ok(())) => {
                self.unacked.remove(key);
                debug!("Acknowledged command {}", key);
            }
            Ok(Err(e)) => warn!("Failed to delete command {}, will retry: {}", key, e),
            Err(_) => warn!("Timed out deleting command {}, will retry", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CapabilityHandler, Dispatcher, WorkerPool};
    use crate::testing::{wait_for, RecordingStore};
    use agent_shared::{MemoryStore, Outcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CapabilityHandler for CountingHandler {
        async fn handle(&self, params: Value) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Outcome::ok(params)
        }
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            resubscribe_delay: Duration::from_millis(10),
            max_resubscribe_delay: Duration::from_millis(50),
            write_timeout: Duration::from_secs(5),
        }
    }

    fn setup(store: Arc<dyn TreeStore>) -> (CommandListener, WorkerPool, Arc<AtomicUsize>) {
        let paths = DevicePaths::new("devices", "edge-001");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("count", Arc::new(CountingHandler { calls: calls.clone() }));

        let (publisher, _task) =
            ResponsePublisher::start(store.clone(), paths.clone(), 64, Duration::from_secs(5));
        let pool = WorkerPool::start(1, 16, Arc::new(dispatcher), publisher.clone());
        let listener = CommandListener::new(store, paths, pool.submitter(), publisher, config());
        (listener, pool, calls)
    }

    #[tokio::test]
    async fn test_duplicate_added_event_dispatched_once() {
        let store = Arc::new(RecordingStore::new());
        let (mut listener, pool, calls) = setup(store.clone());

        listener.handle_added("k1".into(), json!({"name": "count"})).await;
        listener.handle_added("k1".into(), json!({"name": "count"})).await;

        wait_for("dispatch", || pool.in_flight() == 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.deletes(), vec!["devices/edge-001/commands/k1".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_node_is_answered_and_consumed() {
        let store = Arc::new(RecordingStore::new());
        let (mut listener, _pool, calls) = setup(store.clone());

        listener.handle_added("bad".into(), json!({"params": {"x": 1}})).await;

        wait_for("error response", || {
            !store.memory().children("devices/edge-001/responses").is_empty()
        })
        .await;
        let responses = store.memory().children("devices/edge-001/responses");
        assert_eq!(responses[0].1["error"], "MalformedCommand");
        assert_eq!(responses[0].1["commandId"], "bad");
        assert_eq!(store.deletes(), vec!["devices/edge-001/commands/bad".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_state_machine_through_cancellation() {
        let memory = MemoryStore::new();
        let (listener, _pool, calls) = setup(Arc::new(memory.clone()));
        let mut state = listener.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        state.wait_for(|s| *s == ListenerState::Active).await.unwrap();

        memory.cancel_subscriptions();
        assert_eq!(memory.subscriber_count(), 0);
        wait_for("resubscription", || memory.subscriber_count() == 1).await;
        state.wait_for(|s| *s == ListenerState::Active).await.unwrap();

        // Still delivering after the resubscription
        memory
            .write("devices/edge-001/commands/k9", json!({"name": "count"}))
            .await
            .unwrap();
        wait_for("dispatch after resubscribe", || calls.load(Ordering::SeqCst) == 1).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(*state.borrow(), ListenerState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_on_replay() {
        let store = Arc::new(RecordingStore::new());
        store.fail_next_deletes(1);
        let memory = store.memory().clone();
        let (listener, _pool, calls) = setup(store.clone());
        let mut state = listener.state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));
        state.wait_for(|s| *s == ListenerState::Active).await.unwrap();

        let path = "devices/edge-001/commands/k1";
        memory.write(path, json!({"name": "count"})).await.unwrap();
        wait_for("first delete attempt", || store.deletes().len() == 1).await;
        assert!(memory.read(path).is_some());

        // The replay after resubscribing retries the delete only
        memory.cancel_subscriptions();
        wait_for("delete retried", || memory.read(path).is_none()).await;
        assert_eq!(store.deletes().len(), 2);

        // Further churn neither dispatches nor deletes again
        for _ in 0..3 {
            memory.cancel_subscriptions();
            wait_for("resubscription", || memory.subscriber_count() == 1).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.deletes().len(), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_command_is_forgotten() {
        let store = Arc::new(RecordingStore::new());
        let (mut listener, pool, _calls) = setup(store.clone());
        store.fail_next_deletes(1);

        listener.handle_added("k1".into(), json!({"name": "count"})).await;
        assert!(listener.unacked.contains("k1"));

        listener.handle_added("k1".into(), json!({"name": "count"})).await;
        assert!(listener.unacked.is_empty());
        assert!(listener.dispatched.contains("k1"));

        listener.handle_removed("k1");
        assert!(listener.dispatched.is_empty());
        wait_for("dispatch", || pool.in_flight() == 0).await;
    }
}
