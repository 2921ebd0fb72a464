//! Command execution infrastructure for the agent
//!
//! This module handles:
//! - Resolving command names to registered capability handlers
//! - Normalizing handler success, failure and panics into an `Outcome`
//! - Running accepted commands on a bounded worker pool

mod dispatcher;
pub mod handlers;
mod pool;

pub use dispatcher::Dispatcher;
pub use handlers::CapabilityHandler;
pub use pool::{PoolClosed, Submitter, WorkerPool};
