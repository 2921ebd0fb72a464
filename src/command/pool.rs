//! Bounded worker pool
//!
//! Decouples "observe and acknowledge" from "execute and respond": the
//! listener hands accepted commands to a bounded queue and returns; workers
//! run the handlers and queue the responses.

use super::Dispatcher;
use crate::publisher::ResponsePublisher;
use agent_shared::{Command, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The pool stopped before the command was accepted
#[derive(Error, Debug)]
#[error("Worker pool is closed")]
pub struct PoolClosed(pub Command);

/// Cloneable entry point for handing commands to the pool
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::Sender<Command>,
    in_flight: Arc<AtomicUsize>,
}

impl Submitter {
    /// Accept a command for execution, waiting for queue capacity
    pub async fn submit(&self, command: Command) -> Result<(), PoolClosed> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(command)) = self.tx.send(command).await {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolClosed(command));
        }
        Ok(())
    }

    /// Commands accepted but not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    submitter: Submitter,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `concurrency` workers sharing a queue of `capacity` commands
    pub fn start(
        concurrency: usize,
        capacity: usize,
        dispatcher: Arc<Dispatcher>,
        publisher: ResponsePublisher,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let workers = (0..concurrency.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    rx.clone(),
                    dispatcher.clone(),
                    publisher.clone(),
                    in_flight.clone(),
                ))
            })
            .collect();

        Self {
            submitter: Submitter { tx, in_flight },
            workers,
        }
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.submitter.in_flight()
    }

    /// Wait for queued and running commands to finish.
    ///
    /// Workers exit once every `Submitter` is dropped and the queue is empty.
    pub async fn shutdown(self) {
        drop(self.submitter);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Command>>>,
    dispatcher: Arc<Dispatcher>,
    publisher: ResponsePublisher,
    in_flight: Arc<AtomicUsize>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(command) = next else {
            break;
        };

        let outcome = dispatcher
            .dispatch(&command.name, command.params.clone())
            .await;
        if outcome.is_ok() {
            info!("[worker {}] {} ({}) completed", worker, command.name, command.id);
        } else {
            warn!("[worker {}] {} ({}) failed: {:?}", worker, command.name, command.id, outcome);
        }

        publisher.publish(Response::from_outcome(&command, outcome));
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
