//! Connection to the remote tree store
//!
//! This module handles:
//! - Persistent TCP connection to the tree server with automatic reconnection
//! - Request/reply correlation over the framed wire protocol
//! - Routing subscription events to their `Subscription` streams
//! - Ending every open subscription when the connection drops

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, RemoteStore};
