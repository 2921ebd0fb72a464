//! Capability handlers
//!
//! A capability handler implements one named operation behind a uniform
//! interface. Platform handlers live outside the agent core and are
//! registered on the [`Dispatcher`](super::Dispatcher) at startup; the ones
//! here are the reference set the agent ships with.

mod system_info;
mod vibrate;

pub use system_info::SystemInfoHandler;
pub use vibrate::{NoopVibrator, VibrateHandler, Vibrator};

use agent_shared::Outcome;
use async_trait::async_trait;
use serde_json::Value;

pub const VIBRATE_DEVICE: &str = "vibrateDevice";
pub const GET_SYSTEM_INFO: &str = "getSystemInfo";

/// One named operation the agent can perform
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Execute with the command's parameters.
    ///
    /// Failures are reported as `Outcome::Err`; a panic is caught by the
    /// dispatcher and reported as a handler failure.
    async fn handle(&self, params: Value) -> Outcome;
}
