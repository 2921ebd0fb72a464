//! Serve a tree store over one framed connection
//!
//! Requests on a connection are applied in arrival order, which gives every
//! client per-path FIFO ordering. Subscription events are forwarded by a task
//! per subscription through a shared outbound queue.

use crate::codec::{self, CodecError, FrameDecoder};
use crate::store::{StoreError, TreeStore};
use crate::wire::{decode_value, frame::Body, Event, Frame, Reply};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Serve `store` to a single client until it disconnects
pub async fn serve_connection<T>(io: T, store: Arc<dyn TreeStore>) -> Result<(), ServeError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(io);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(write_frames(writer, out_rx));

    let mut forwarders: HashMap<u64, JoinHandle<()>> = HashMap::new();
    let mut decoder = FrameDecoder::new();

    let result = loop {
        match decoder.fill_from(&mut reader).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(ServeError::from(e)),
        }

        let mut failed = None;
        loop {
            match decoder.decode_next() {
                Ok(Some(frame)) => {
                    handle_frame(frame, &store, &out_tx, &mut forwarders).await;
                }
                Ok(None) => break,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            break Err(ServeError::from(e));
        }
    };

    for (_, forwarder) in forwarders.drain() {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;

    result
}

async fn handle_frame(
    frame: Frame,
    store: &Arc<dyn TreeStore>,
    out_tx: &mpsc::UnboundedSender<Frame>,
    forwarders: &mut HashMap<u64, JoinHandle<()>>,
) {
    let id = frame.request_id;
    let reply = match frame.body {
        Some(Body::Write(write)) => match decode_value(&write.value_json) {
            Ok(value) => to_reply(store.write(&write.path, value).await),
            Err(e) => Reply::error(e.to_string()),
        },
        Some(Body::Delete(delete)) => to_reply(store.delete(&delete.path).await),
        Some(Body::PushKey(push)) => match store.push_key(&push.path).await {
            Ok(key) => Reply::with_key(key),
            Err(e) => Reply::error(e.to_string()),
        },
        Some(Body::Subscribe(subscribe)) => {
            match store.subscribe_child_events(&subscribe.path).await {
                Ok(mut subscription) => {
                    // Reply first so the client sees acceptance before any event
                    let _ = out_tx.send(Frame::new(id, Body::Reply(Reply::ok())));
                    let out = out_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = subscription.recv().await {
                            let body = match Event::from_child_event(&event) {
                                Ok(event) => Body::Event(event),
                                Err(e) => {
                                    warn!("Dropping unencodable event {}: {}", event.key(), e);
                                    continue;
                                }
                            };
                            if out.send(Frame::new(id, body)).is_err() {
                                return;
                            }
                        }
                        let cancelled = Reply::error("subscription cancelled");
                        let _ = out.send(Frame::new(id, Body::Reply(cancelled)));
                    });
                    if let Some(previous) = forwarders.insert(id, forwarder) {
                        previous.abort();
                    }
                    return;
                }
                Err(e) => Reply::error(e.to_string()),
            }
        }
        Some(Body::Unsubscribe(unsubscribe)) => {
            if let Some(forwarder) = forwarders.remove(&unsubscribe.subscription_id) {
                forwarder.abort();
            }
            Reply::ok()
        }
        Some(Body::Reply(_)) | Some(Body::Event(_)) | None => {
            debug!("Ignoring unexpected frame {}", id);
            Reply::error("unexpected frame")
        }
    };

    let _ = out_tx.send(Frame::new(id, Body::Reply(reply)));
}

fn to_reply(result: Result<(), StoreError>) -> Reply {
    match result {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::error(e.to_string()),
    }
}

async fn write_frames<T>(mut writer: WriteHalf<T>, mut out_rx: mpsc::UnboundedReceiver<Frame>)
where
    T: AsyncWrite,
{
    while let Some(frame) = out_rx.recv().await {
        match codec::write_frame(&mut writer, &frame).await {
            Ok(()) => {}
            Err(e) if e.is_io() => {
                debug!("Client writer closed: {}", e);
                return;
            }
            Err(e) => warn!("Failed to encode frame {}: {}", frame.request_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::wire::{PushKey, Subscribe, Write};
    use serde_json::json;
    use tokio::io::DuplexStream;

    async fn next_frame(io: &mut DuplexStream, decoder: &mut FrameDecoder) -> Frame {
        loop {
            if let Some(frame) = decoder.decode_next().unwrap() {
                return frame;
            }
            let n = decoder.fill_from(io).await.unwrap();
            assert!(n > 0, "server closed connection");
        }
    }

    async fn send(io: &mut DuplexStream, request_id: u64, body: Body) {
        codec::write_frame(io, &Frame::new(request_id, body))
            .await
            .unwrap();
    }

    fn write(path: &str, value_json: &str) -> Body {
        Body::Write(Write {
            path: path.into(),
            value_json: value_json.into(),
        })
    }

    #[tokio::test]
    async fn test_write_push_key_and_subscribe() {
        let memory = MemoryStore::new();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(server, Arc::new(memory.clone())));
        let mut decoder = FrameDecoder::new();

        send(&mut client, 1, write("d/x/commands/a", r#"{"name":"vibrateDevice"}"#)).await;
        let reply = next_frame(&mut client, &mut decoder).await;
        assert_eq!(reply, Frame::new(1, Body::Reply(Reply::ok())));
        assert_eq!(
            memory.read("d/x/commands/a"),
            Some(json!({"name": "vibrateDevice"}))
        );

        let push = Body::PushKey(PushKey {
            path: "d/x/responses".into(),
        });
        send(&mut client, 2, push).await;
        let reply = next_frame(&mut client, &mut decoder).await;
        match reply.body {
            Some(Body::Reply(r)) => assert!(r.ok && r.key.len() == 20),
            other => panic!("unexpected {:?}", other),
        }

        let subscribe = Body::Subscribe(Subscribe {
            path: "d/x/commands".into(),
        });
        send(&mut client, 3, subscribe).await;
        assert_eq!(
            next_frame(&mut client, &mut decoder).await,
            Frame::new(3, Body::Reply(Reply::ok()))
        );
        match next_frame(&mut client, &mut decoder).await.body {
            Some(Body::Event(event)) => assert_eq!(event.key, "a"),
            other => panic!("unexpected {:?}", other),
        }

        // Cancellation is reported as a failed reply on the subscription id
        memory.cancel_subscriptions();
        match next_frame(&mut client, &mut decoder).await {
            Frame {
                request_id: 3,
                body: Some(Body::Reply(r)),
            } => assert!(!r.ok),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_path_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, Arc::new(MemoryStore::new())));
        let mut decoder = FrameDecoder::new();

        send(&mut client, 9, write("/", "1")).await;
        match next_frame(&mut client, &mut decoder).await.body {
            Some(Body::Reply(r)) => assert!(!r.ok && r.error.contains("Invalid path")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
