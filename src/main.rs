//! Modbridge - Modbus Field-Bus Connector
//!
//! Polls Modbus TCP/RTU devices and reconciles register state with
//! consumer-facing channel properties

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modbridge::{config, connector::Connector};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    info!("Starting Modbridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::load_config()?;
    info!(
        "Configuration loaded: {} devices configured",
        config.devices.len()
    );

    // Start the connector
    let mut handle = Connector::new(config)?.start()?;

    // Log connectivity changes until shutdown
    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(event) => {
                    info!(device = %event.device, state = ?event.state, "connection event");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                handle.shutdown();
                break;
            }
        }
    }

    Ok(())
}
