mod agent;
mod command;
mod config;
mod connection;
mod descriptor;
mod listener;
mod presence;
mod publisher;
#[cfg(test)]
mod testing;

use agent::Agent;
use clap::Parser;
use command::Dispatcher;
use config::Cli;
use connection::{ConnectionEvent, RemoteStore};
use descriptor::DescriptorSource;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Cli::parse().into_config();
    let source = DescriptorSource::resolve(config.device_id.as_deref());

    info!("Device agent starting: {}", source.device_id());
    info!("  Tree server: {}", config.connection.store_addr);
    info!("  Root: {}", config.root_prefix);

    let (store, mut events) = RemoteStore::connect(config.connection.clone());
    let dispatcher = Dispatcher::with_builtin(source.clone());
    let agent = Agent::start(&config, Arc::new(store), source, dispatcher);

    // Main event loop
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(ConnectionEvent::Connected { addr }) => {
                    info!("Connected to {}", addr);
                    agent.reannounce();
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!(
                        "Disconnected: {} (listener {:?}, {} command(s) in flight)",
                        reason,
                        *agent.listener_state().borrow(),
                        agent.in_flight()
                    );
                }
                Some(ConnectionEvent::ConnectionFailed { reason }) => {
                    error!("Connection failed: {}", reason);
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },
        }
    }

    agent.shutdown().await;
    Ok(())
}
