//! Agent lifecycle
//!
//! Wires the presence manager, command listener, worker pool and response
//! publisher over one shared store connection, and tears them down in order.

use crate::command::{Dispatcher, WorkerPool};
use crate::config::AgentConfig;
use crate::descriptor::DescriptorSource;
use crate::listener::{CommandListener, ListenerConfig, ListenerState};
use crate::presence::{PresenceHandle, PresenceManager};
use crate::publisher::ResponsePublisher;
use agent_shared::{DevicePaths, TreeStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

pub struct Agent {
    paths: DevicePaths,
    presence: PresenceHandle,
    listener: JoinHandle<()>,
    listener_shutdown: watch::Sender<bool>,
    listener_state: watch::Receiver<ListenerState>,
    pool: WorkerPool,
    publisher_task: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl Agent {
    /// Start every component against `store`
    pub fn start(
        config: &AgentConfig,
        store: Arc<dyn TreeStore>,
        source: DescriptorSource,
        dispatcher: Dispatcher,
    ) -> Self {
        let paths = DevicePaths::new(&config.root_prefix, source.device_id());
        info!(
            "Agent for {} serving {} command(s): {}",
            paths.root(),
            dispatcher.names().len(),
            dispatcher.names().join(", ")
        );

        let (publisher, publisher_task) = ResponsePublisher::start(
            store.clone(),
            paths.clone(),
            config.publish_queue,
            config.write_timeout,
        );
        let pool = WorkerPool::start(
            config.workers,
            config.queue_capacity,
            Arc::new(dispatcher),
            publisher.clone(),
        );

        let listener = CommandListener::new(
            store.clone(),
            paths.clone(),
            pool.submitter(),
            publisher,
            ListenerConfig::from(config),
        );
        let listener_state = listener.state();
        let (listener_shutdown, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listener.run(shutdown_rx));

        let presence = PresenceManager::new(
            store,
            paths.clone(),
            source,
            config.heartbeat_interval,
            config.write_timeout,
        )
        .start();

        Self {
            paths,
            presence,
            listener,
            listener_shutdown,
            listener_state,
            pool,
            publisher_task,
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    /// Re-send the descriptor, e.g. after the store connection came back
    pub fn reannounce(&self) {
        self.presence.reannounce();
    }

    pub fn listener_state(&self) -> watch::Receiver<ListenerState> {
        self.listener_state.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Orderly shutdown: stop taking commands, let running handlers and
    /// pending responses finish within the grace period, then go offline.
    pub async fn shutdown(self) {
        let _ = self.listener_shutdown.send(true);
        let _ = self.listener.await;

        if timeout(self.shutdown_grace, self.pool.shutdown()).await.is_err() {
            warn!("Handlers still running after {:?}, abandoning them", self.shutdown_grace);
        }
        if timeout(self.shutdown_grace, self.publisher_task).await.is_err() {
            warn!("Pending responses not written after {:?}", self.shutdown_grace);
        }

        self.presence.shutdown().await;
        info!("Agent stopped");
    }
}
