//! Connector orchestration

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::{Config, ConnectorMode};
use crate::modbus::codec::Framing;
use crate::modbus::transport::{RtuTransport, TcpTransport, Transport};
use crate::poll::write::WriteCoordinator;
use crate::poll::PollingEngine;
use crate::store::{ConnectionEvent, StateStore, WriteIntent};

const WRITE_QUEUE_DEPTH: usize = 100;
const EVENT_QUEUE_DEPTH: usize = 100;

/// Handle to a running connector: push writes in, take events out.
pub struct ConnectorHandle {
    pub store: StateStore,
    pub writes: mpsc::Sender<WriteIntent>,
    pub events: mpsc::Receiver<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
}

impl ConnectorHandle {
    /// Stop the polling engine. The write coordinator stops once the
    /// handle (and with it the write sender) is dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Main connector that wires transports, the polling engine and the
/// write coordinator together
pub struct Connector {
    config: Config,
    store: StateStore,
}

impl Connector {
    /// Create a new connector instance
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            store: StateStore::new(),
        })
    }

    /// Spawn the polling engine and write coordinator, returning the
    /// handle the consumer drives them through.
    pub fn start(self) -> Result<ConnectorHandle> {
        let (write_tx, write_rx) = mpsc::channel::<WriteIntent>(WRITE_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(EVENT_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let framing = match self.config.connector.mode {
            ConnectorMode::Rtu => Framing::Rtu,
            ConnectorMode::Tcp => Framing::Tcp,
        };

        // One shared serial transport in RTU mode, one connection
        // target per device in TCP mode.
        let shared_serial: Option<Arc<dyn Transport>> = match self.config.connector.mode {
            ConnectorMode::Rtu => {
                let serial = self
                    .config
                    .connector
                    .serial
                    .as_ref()
                    .context("rtu mode requires connector.serial settings")?;
                Some(Arc::new(RtuTransport::new(serial.settings()?)))
            }
            ConnectorMode::Tcp => None,
        };

        let mut devices: Vec<(crate::config::DeviceConfig, Arc<dyn Transport>)> = Vec::new();

        for device in &self.config.devices {
            let transport: Arc<dyn Transport> = match &shared_serial {
                Some(serial) => serial.clone(),
                None => {
                    // A host-less device is alerted by the engine before
                    // its first request; the empty target is never dialed.
                    let host = device.host.clone().unwrap_or_default();
                    Arc::new(TcpTransport::new(host, device.port))
                }
            };

            devices.push((device.clone(), transport));
        }

        info!(
            mode = ?self.config.connector.mode,
            devices = devices.len(),
            "starting connector"
        );

        let engine = PollingEngine::new(framing, devices.clone(), self.store.clone(), event_tx);
        tokio::spawn(engine.run(shutdown_rx));

        let coordinator = WriteCoordinator::new(framing, devices, self.store.clone());
        tokio::spawn(coordinator.run(write_rx));

        Ok(ConnectorHandle {
            store: self.store,
            writes: write_tx,
            events: event_rx,
            shutdown: shutdown_tx,
        })
    }
}
