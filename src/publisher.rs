//! Response Publisher
//!
//! Appends response nodes to the device's response log. Publishing never
//! blocks the caller: responses go onto a bounded queue drained by one
//! writer task, which also keeps them in hand-off order. A full queue or a
//! failed write is logged and the response dropped; there are no retries.

use agent_shared::{DevicePaths, ErrorKind, Response, StoreError, TreeStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ResponsePublisher {
    tx: mpsc::Sender<Response>,
}

impl ResponsePublisher {
    /// Start the writer task. It ends once every publisher clone is dropped
    /// and the queue is drained.
    pub fn start(
        store: Arc<dyn TreeStore>,
        paths: DevicePaths,
        capacity: usize,
        write_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(publish_loop(store, paths, rx, write_timeout));
        (Self { tx }, task)
    }

    /// Queue a response for writing
    pub fn publish(&self, response: Response) {
        match self.tx.try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(response)) => {
                warn!(
                    "{}: queue full, dropping response for {}",
                    ErrorKind::PublishFailure,
                    response.command
                );
            }
            Err(TrySendError::Closed(response)) => {
                warn!(
                    "{}: publisher stopped, dropping response for {}",
                    ErrorKind::PublishFailure,
                    response.command
                );
            }
        }
    }
}

async fn publish_loop(
    store: Arc<dyn TreeStore>,
    paths: DevicePaths,
    mut rx: mpsc::Receiver<Response>,
    write_timeout: Duration,
) {
    while let Some(response) = rx.recv().await {
        let result = timeout(write_timeout, append(store.as_ref(), &paths, &response))
            .await
            .unwrap_or(Err(StoreError::Timeout));

        match result {
            Ok(key) => debug!("Response for {} written as {}", response.command, key),
            Err(e) => warn!(
                "{}: response for {} lost: {}",
                ErrorKind::PublishFailure,
                response.command,
                e
            ),
        }
    }
}

/// Append one response node, returning its push key
pub async fn append(
    store: &dyn TreeStore,
    paths: &DevicePaths,
    response: &Response,
) -> Result<String, StoreError> {
    let value = response
        .to_value()
        .map_err(|e| StoreError::Encoding(e.to_string()))?;
    let key = store.push_key(&paths.responses()).await?;
    store.write(&paths.response(&key), value).await?;
    Ok(key)
}
