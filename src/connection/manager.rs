//! Store client with a persistent connection and automatic reconnection

use agent_shared::codec::{self, FrameDecoder};
use agent_shared::wire::{
    encode_value, frame::Body, Delete, Frame, PushKey, Reply, Subscribe, Unsubscribe, Write,
};
use agent_shared::{ChildEvent, StoreError, Subscription, TreeStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Events emitted by the connection loop
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connected to the tree server
    Connected { addr: String },
    /// Lost an established connection
    Disconnected { reason: String },
    /// Connection attempt failed
    ConnectionFailed { reason: String },
}

/// Configuration for the store connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Tree server address
    pub store_addr: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Time to wait for the reply to a single request
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:7070".into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

type ReplyTx = oneshot::Sender<Result<Reply, StoreError>>;

/// A request waiting to be written to the current connection
struct Request {
    body: Body,
    reply: ReplyTx,
    /// Event sink for subscribe requests
    events: Option<mpsc::UnboundedSender<ChildEvent>>,
}

/// [`TreeStore`] backed by a tree server over TCP
pub struct RemoteStore {
    config: ConnectionConfig,
    request_tx: mpsc::Sender<Request>,
}

impl RemoteStore {
    /// Create the store client and start the connection loop
    pub fn connect(config: ConnectionConfig) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (request_tx, request_rx) = mpsc::channel::<Request>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        let config_clone = config.clone();
        tokio::spawn(async move {
            connection_loop(config_clone, request_rx, event_tx).await;
        });

        (Self { config, request_tx }, event_rx)
    }

    async fn request(
        &self,
        body: Body,
        events: Option<mpsc::UnboundedSender<ChildEvent>>,
    ) -> Result<Reply, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(Request {
                body,
                reply: reply_tx,
                events,
            })
            .await
            .map_err(|_| StoreError::Disconnected)?;

        let reply = match timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            // Connection dropped with the request in flight
            Ok(Err(_)) => return Err(StoreError::Disconnected),
            Err(_) => return Err(StoreError::Timeout),
        };

        if reply.ok {
            Ok(reply)
        } else {
            Err(StoreError::Rejected(reply.error))
        }
    }
}

#[async_trait]
impl TreeStore for RemoteStore {
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let value_json = encode_value(&value)?;
        self.request(
            Body::Write(Write {
                path: path.into(),
                value_json,
            }),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.request(Body::Delete(Delete { path: path.into() }), None)
            .await?;
        Ok(())
    }

    async fn push_key(&self, path: &str) -> Result<String, StoreError> {
        let reply = self
            .request(Body::PushKey(PushKey { path: path.into() }), None)
            .await?;
        Ok(reply.key)
    }

    async fn subscribe_child_events(&self, path: &str) -> Result<Subscription, StoreError> {
        let (events, subscription) = Subscription::channel(path);
        self.request(Body::Subscribe(Subscribe { path: path.into() }), Some(events))
            .await?;
        Ok(subscription)
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: ConnectionConfig,
    mut request_rx: mpsc::Receiver<Request>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.store_addr)).await {
            Ok(Ok(stream)) => {
                reconnect_delay = config.reconnect_delay;

                let _ = event_tx
                    .send(ConnectionEvent::Connected {
                        addr: config.store_addr.clone(),
                    })
                    .await;

                match handle_connection(stream, &mut request_rx).await {
                    // Every store handle is gone
                    Ok(()) => return,
                    Err(reason) => {
                        let _ = event_tx
                            .send(ConnectionEvent::Disconnected {
                                reason: reason.to_string(),
                            })
                            .await;
                    }
                }
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("{}: {}", config.store_addr, e),
                    })
                    .await;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("{}: connect timed out", config.store_addr),
                    })
                    .await;
            }
        }

        if !reject_requests_for(reconnect_delay, &mut request_rx).await {
            return;
        }

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Fail requests as `Disconnected` while waiting out the reconnect delay.
/// Returns false once every store handle is gone.
async fn reject_requests_for(delay: Duration, request_rx: &mut mpsc::Receiver<Request>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            request = request_rx.recv() => match request {
                Some(request) => {
                    let _ = request.reply.send(Err(StoreError::Disconnected));
                }
                None => return false,
            }
        }
    }
}

/// Per-connection request bookkeeping.
///
/// Dropping it fails every pending request and ends every subscription.
#[derive(Default)]
struct Session {
    next_id: u64,
    pending: HashMap<u64, ReplyTx>,
    subscriptions: HashMap<u64, mpsc::UnboundedSender<ChildEvent>>,
}

impl Session {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Route one inbound frame. Returns an unsubscribe frame to send when
    /// the local end of a subscription has gone away.
    fn route(&mut self, frame: Frame) -> Option<Frame> {
        let id = frame.request_id;
        match frame.body {
            Some(Body::Reply(reply)) => {
                if !reply.ok {
                    // Rejected subscribe, or the server cancelled it
                    self.subscriptions.remove(&id);
                }
                if let Some(tx) = self.pending.remove(&id) {
                    let _ = tx.send(Ok(reply));
                }
                None
            }
            Some(Body::Event(event)) => {
                let sink = self.subscriptions.get(&id)?;
                let event = match event.into_child_event() {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Dropping undecodable event on subscription {}: {}", id, e);
                        return None;
                    }
                };
                if sink.send(event).is_ok() {
                    return None;
                }
                self.subscriptions.remove(&id);
                let unsubscribe_id = self.next_id();
                Some(Frame::new(
                    unsubscribe_id,
                    Body::Unsubscribe(Unsubscribe {
                        subscription_id: id,
                    }),
                ))
            }
            other => {
                debug!("Unexpected frame {} from store: {:?}", id, other);
                None
            }
        }
    }
}

/// Handle an active connection.
///
/// Returns `Ok(())` when the request channel closes, or the reason the
/// connection was lost.
async fn handle_connection(
    stream: TcpStream,
    request_rx: &mut mpsc::Receiver<Request>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut session = Session::default();
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else {
                    return Ok(());
                };
                let id = session.next_id();
                if let Some(events) = request.events {
                    session.subscriptions.insert(id, events);
                }
                session.pending.insert(id, request.reply);
                send_frame(&mut writer, &Frame::new(id, request.body)).await?;
            }

            read = decoder.fill_from(&mut reader) => {
                if read? == 0 {
                    return Err(anyhow!("Store closed connection"));
                }

                while let Some(frame) = decoder.decode_next()? {
                    if let Some(unsubscribe) = session.route(frame) {
                        send_frame(&mut writer, &unsubscribe).await?;
                    }
                }
            }
        }
    }
}

async fn send_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    codec::write_frame(writer, frame).await?;
    Ok(())
}
