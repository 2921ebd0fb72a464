//! Device Agent Shared Types
//!
//! This crate provides the pieces used by both the device agent and the
//! tree server: the remote tree store contract, the command and response
//! envelopes, the persisted layout, and the framed wire protocol.

pub mod codec;
pub mod envelope;
pub mod memory;
pub mod paths;
pub mod serve;
pub mod store;
pub mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use envelope::{Command, ErrorKind, MalformedCommand, Outcome, Response};
pub use memory::MemoryStore;
pub use paths::DevicePaths;
pub use store::{ChildEvent, PushKeys, StoreError, Subscription, TreeStore};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Presence parameters shared by the agent and the controller side
pub mod presence {
    /// Heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

    /// Number of missed heartbeat periods after which a device is stale
    pub const STALE_AFTER_PERIODS: u64 = 2;

    /// Whether a device last seen at `last_seen_ms` should be treated as offline.
    ///
    /// This is the authoritative liveness rule; the `online: false` write an
    /// agent makes on orderly shutdown is only advisory.
    pub fn is_stale(last_seen_ms: u64, now_ms: u64, period_ms: u64) -> bool {
        now_ms.saturating_sub(last_seen_ms) > STALE_AFTER_PERIODS * period_ms
    }
}
