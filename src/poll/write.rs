//! Write coordinator
//!
//! Delivers consumer value changes to the bus. Writes are debounced per
//! channel, transformed into the device's wire representation and sent
//! as single coil or register writes. Delivery outcomes only touch the
//! write side of the state store; read failure accounting stays with
//! the polling engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, DeviceConfig};
use crate::metrics;
use crate::modbus::codec::{
    decode_response, encode_write_register, encode_write_single_coil, Framing,
};
use crate::modbus::transform::{pack_value, transform_value_to_device, Value};
use crate::modbus::transport::Transport;
use crate::store::{StateStore, WriteIntent};

/// Repeated writes to one channel inside this window are dropped.
pub const WRITE_DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Drains write intents and delivers them to the bus.
pub struct WriteCoordinator {
    framing: Framing,
    devices: HashMap<String, (DeviceConfig, Arc<dyn Transport>)>,
    store: StateStore,
    attempted: HashMap<(String, String), Instant>,
}

impl WriteCoordinator {
    pub fn new(
        framing: Framing,
        devices: Vec<(DeviceConfig, Arc<dyn Transport>)>,
        store: StateStore,
    ) -> Self {
        Self {
            framing,
            devices: devices
                .into_iter()
                .map(|(device, transport)| (device.id.clone(), (device, transport)))
                .collect(),
            store,
            attempted: HashMap::new(),
        }
    }

    /// Run until the intent channel closes.
    pub async fn run(mut self, mut intents: mpsc::Receiver<WriteIntent>) {
        info!("write coordinator started");

        while let Some(intent) = intents.recv().await {
            self.handle(intent).await;
        }
    }

    /// Deliver one write intent.
    pub async fn handle(&mut self, intent: WriteIntent) {
        let Some((device, channel, transport)) = self.lookup(&intent) else {
            warn!(device = %intent.device, channel = %intent.channel, "write for unknown channel");
            return;
        };

        if !channel.settable {
            warn!(channel = %channel.id, "write rejected, channel is not settable");
            return;
        }

        let key = (intent.device.clone(), intent.channel.clone());
        let now = Instant::now();

        let debounced = self
            .attempted
            .get(&key)
            .is_some_and(|at| now.duration_since(*at) < WRITE_DEBOUNCE_DELAY);
        if debounced {
            debug!(channel = %channel.id, "write debounced");
            return;
        }
        self.attempted.insert(key, now);

        self.store.set_expected(&intent.channel, intent.value.clone()).await;

        let Some(write) =
            transform_value_to_device(channel.data_type, channel.format.as_ref(), &intent.value)
        else {
            warn!(channel = %channel.id, value = %intent.value, "value has no wire representation");
            self.store.abandon_write(&intent.channel).await;
            return;
        };

        let request = if channel.register.is_digital() {
            let Value::Bool(state) = write.value else {
                warn!(channel = %channel.id, "coil write needs a boolean value");
                self.store.abandon_write(&intent.channel).await;
                return;
            };

            encode_write_single_coil(self.framing, device.station, channel.address, state, None)
        } else {
            let Some(bytes) = pack_value(&write, device.byte_order) else {
                warn!(channel = %channel.id, "value does not fit its register width");
                self.store.abandon_write(&intent.channel).await;
                return;
            };

            match encode_write_register(
                self.framing,
                device.station,
                channel.address,
                &bytes,
                None,
            ) {
                Ok(request) => request,
                Err(err) => {
                    warn!(channel = %channel.id, error = %err, "write could not be encoded");
                    self.store.abandon_write(&intent.channel).await;
                    return;
                }
            }
        };

        self.store.mark_pending(&intent.channel, Utc::now()).await;

        let outcome = match transport.execute(&request).await {
            Ok(bytes) => decode_response(&request, &bytes).map(|_| ()),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                debug!(channel = %channel.id, value = %intent.value, "write confirmed");
                metrics::record_write(&intent.device, true);
                self.store.confirm_write(&intent.channel).await;
            }
            Err(err) => {
                warn!(channel = %channel.id, error = %err, "write failed");
                metrics::record_write(&intent.device, false);
                self.store.abandon_write(&intent.channel).await;
            }
        }
    }

    fn lookup(
        &self,
        intent: &WriteIntent,
    ) -> Option<(DeviceConfig, ChannelConfig, Arc<dyn Transport>)> {
        let (device, transport) = self.devices.get(&intent.device)?;
        let channel = device
            .channels
            .iter()
            .find(|channel| channel.id == intent.channel)?;

        Some((device.clone(), channel.clone(), transport.clone()))
    }
}
