//! Agent configuration
//!
//! Defaults live on [`AgentConfig`]; the command line (with environment
//! fallbacks) overrides them.

use crate::connection::ConnectionConfig;
use agent_shared::presence;
use clap::Parser;
use std::time::Duration;

/// Runtime configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device id override; resolved from the OS when absent
    pub device_id: Option<String>,
    /// Path prefix under which device roots live
    pub root_prefix: String,
    /// Presence heartbeat period
    pub heartbeat_interval: Duration,
    /// Concurrent command executions
    pub workers: usize,
    /// Accepted commands waiting for a worker
    pub queue_capacity: usize,
    /// Responses waiting to be written
    pub publish_queue: usize,
    /// Upper bound for a single store write issued by the agent
    pub write_timeout: Duration,
    /// Resubscription delay (initial)
    pub resubscribe_delay: Duration,
    /// Maximum resubscription delay
    pub max_resubscribe_delay: Duration,
    /// How long shutdown waits for running handlers and pending responses
    pub shutdown_grace: Duration,
    /// Store connection settings
    pub connection: ConnectionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            root_prefix: "devices".into(),
            heartbeat_interval: Duration::from_millis(presence::HEARTBEAT_INTERVAL_MS),
            workers: 2,
            queue_capacity: 64,
            publish_queue: 256,
            write_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
            max_resubscribe_delay: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "device-agent",
    version,
    about = "Executes commands queued for this device in a remote tree store"
)]
pub struct Cli {
    /// Tree server address
    #[arg(long, env = "AGENT_STORE_ADDR", default_value = "127.0.0.1:7070")]
    pub store_addr: String,

    /// Override the OS-derived device id
    #[arg(long, env = "AGENT_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Path prefix for device roots
    #[arg(long, env = "AGENT_ROOT", default_value = "devices")]
    pub root: String,

    /// Heartbeat period in seconds
    #[arg(long, env = "AGENT_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Concurrent command executions
    #[arg(long, env = "AGENT_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Accepted commands waiting for a worker
    #[arg(long, env = "AGENT_QUEUE_CAPACITY", default_value_t = 64)]
    pub queue_capacity: usize,
}

impl Cli {
    pub fn into_config(self) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            device_id: self.device_id.filter(|id| !id.trim().is_empty()),
            root_prefix: self.root,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            workers: self.workers.max(1),
            queue_capacity: self.queue_capacity.max(1),
            connection: ConnectionConfig {
                store_addr: self.store_addr,
                ..defaults.connection.clone()
            },
            ..defaults
        }
    }
}
