//! Polling engine
//!
//! Drives the read side of the connector. Each tick advances a round
//! robin over the configured devices: due channels are batched into as
//! few bus reads as possible, responses are decoded, transformed and
//! reconciled into the state store, and per-device connectivity is
//! tracked through its failure counters.

pub mod write;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{ExceptionCode, ModbusError};
use crate::metrics::{self, ReadMetrics};
use crate::modbus::batch::{self, ReadAddress, ReadRequest};
use crate::modbus::codec::{decode_response, encode_read_request, Framing, ResponsePayload};
use crate::modbus::transform::{
    device_read_kind, transform_value_from_device, value_from_registers, Value,
};
use crate::modbus::transport::Transport;
use crate::modbus::RegisterKind;
use crate::store::{ConnectionEvent, ConnectionState, StateStore};

/// Consecutive failures of one channel before its device is lost.
pub const READ_MAX_ATTEMPTS: u8 = 5;

/// How long a lost device rests before polling resumes.
pub const LOST_DELAY: Duration = Duration::from_secs(5);

/// Round-robin tick interval.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Per-device runtime state tracked by the engine.
struct DeviceRuntime {
    config: DeviceConfig,
    transport: Arc<dyn Transport>,
    channels: HashMap<String, ChannelConfig>,
    state: ConnectionState,
    lost_at: Option<Instant>,
    attempts: HashMap<String, u8>,
    last_read: HashMap<String, Instant>,
}

impl DeviceRuntime {
    fn new(config: DeviceConfig, transport: Arc<dyn Transport>) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|channel| (channel.id.clone(), channel.clone()))
            .collect();

        Self {
            config,
            transport,
            channels,
            state: ConnectionState::Unknown,
            lost_at: None,
            attempts: HashMap::new(),
            last_read: HashMap::new(),
        }
    }
}

/// Registers one read of the channel covers on the wire.
fn register_size(channel: &ChannelConfig) -> u16 {
    if channel.register.is_digital() {
        1
    } else {
        device_read_kind(channel.data_type, channel.format.as_ref()).register_count()
    }
}

fn error_kind(err: &ModbusError) -> &'static str {
    match err {
        ModbusError::ChecksumMismatch => "checksum",
        ModbusError::TooShortResponse { .. } => "short_response",
        ModbusError::IllegalResponse { .. } => "illegal_response",
        ModbusError::ExceptionResponse(_) => "exception",
        ModbusError::FrameOverrun { .. } => "frame_overrun",
        ModbusError::Timeout => "timeout",
        ModbusError::Transport(_) => "transport",
        ModbusError::EncodeFailure(_) => "encode",
        ModbusError::ConfigurationMissing(_) => "configuration",
    }
}

/// Round-robin polling engine over all configured devices.
///
/// RTU devices share one serial transport; TCP devices each carry
/// their own.
pub struct PollingEngine {
    framing: Framing,
    devices: Vec<DeviceRuntime>,
    store: StateStore,
    events: mpsc::Sender<ConnectionEvent>,
    processed: HashSet<String>,
}

impl PollingEngine {
    pub fn new(
        framing: Framing,
        devices: Vec<(DeviceConfig, Arc<dyn Transport>)>,
        store: StateStore,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            framing,
            devices: devices
                .into_iter()
                .map(|(config, transport)| DeviceRuntime::new(config, transport))
                .collect(),
            store,
            events,
            processed: HashSet::new(),
        }
    }

    /// Current connectivity of a device.
    pub fn device_state(&self, id: &str) -> Option<ConnectionState> {
        self.devices
            .iter()
            .find(|device| device.config.id == id)
            .map(|device| device.state)
    }

    /// Run the engine until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(devices = self.devices.len(), "polling engine started");

        let mut ticker = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("polling engine stopped");
    }

    /// Advance the round robin by one device. A tick with every device
    /// already processed closes the cycle instead.
    pub async fn tick(&mut self) {
        let next = self
            .devices
            .iter()
            .position(|device| !self.processed.contains(&device.config.id));

        let Some(index) = next else {
            self.processed.clear();
            return;
        };

        self.processed.insert(self.devices[index].config.id.clone());
        self.poll_device(index).await;
    }

    async fn poll_device(&mut self, index: usize) {
        let now = Instant::now();

        // A TCP device with no host can never be reached; alert it once
        // and leave the rest of the fleet polling.
        if self.framing == Framing::Tcp
            && self.devices[index].config.host.is_none()
            && self.devices[index].state != ConnectionState::Alert
        {
            let err = ModbusError::ConfigurationMissing("device host");
            error!(device = %self.devices[index].config.id, error = %err, "device cannot be polled");
            self.set_state(index, ConnectionState::Alert).await;
            return;
        }

        match self.devices[index].state {
            ConnectionState::Alert => return,
            ConnectionState::Lost => {
                let resting = self.devices[index]
                    .lost_at
                    .is_some_and(|at| now.duration_since(at) < LOST_DELAY);
                if resting {
                    return;
                }
            }
            _ => {}
        }

        let requests = self.plan_requests(index, now);
        if requests.is_empty() {
            return;
        }

        let device_id = self.devices[index].config.id.clone();
        let station = self.devices[index].config.station;
        let transport = self.devices[index].transport.clone();
        let cycle_start = std::time::Instant::now();

        debug!(device = %device_id, requests = requests.len(), "polling device");

        let outcomes = match self.framing {
            Framing::Rtu => {
                // The serial bus is half duplex; requests go out one at
                // a time.
                let mut outcomes = Vec::with_capacity(requests.len());
                for request in requests {
                    let outcome = self
                        .execute_read(transport.as_ref(), &device_id, station, &request)
                        .await;
                    outcomes.push((request, outcome));
                }
                outcomes
            }
            Framing::Tcp => {
                join_all(requests.into_iter().map(|request| async {
                    let outcome = self
                        .execute_read(transport.as_ref(), &device_id, station, &request)
                        .await;
                    (request, outcome)
                }))
                .await
            }
        };

        let mut any_success = false;
        let mut any_failure = false;

        for (request, outcome) in outcomes {
            match outcome {
                Ok(payload) => {
                    any_success = true;
                    self.apply_payload(index, &request, &payload, now).await;
                }
                Err(err) => {
                    any_failure = true;
                    self.apply_failure(index, &request, &err, now).await;
                }
            }

            if self.devices[index].state == ConnectionState::Alert {
                break;
            }
        }

        // Connectivity is judged on the cycle as a whole; a partly
        // failed cycle must not promote a lost device.
        if any_success && !any_failure {
            self.set_state(index, ConnectionState::Connected).await;
        }

        metrics::record_poll_cycle(&device_id, cycle_start.elapsed().as_millis() as u64);
    }

    /// Batch every due channel of the device into read requests.
    fn plan_requests(&self, index: usize, now: Instant) -> Vec<ReadRequest> {
        let device = &self.devices[index];
        let mut by_kind: HashMap<RegisterKind, Vec<ReadAddress>> = HashMap::new();

        for channel in device.channels.values() {
            if !channel.queryable {
                continue;
            }

            let delay = Duration::from_millis(channel.reading_delay_ms);
            let fresh = device
                .last_read
                .get(&channel.id)
                .is_some_and(|read| now.duration_since(*read) < delay);
            if fresh {
                continue;
            }

            by_kind
                .entry(channel.register)
                .or_default()
                .push(ReadAddress {
                    channel: channel.id.clone(),
                    address: channel.address,
                    size: register_size(channel),
                });
        }

        let mut requests = Vec::new();
        for (kind, addresses) in by_kind {
            requests.extend(batch::split(kind, addresses));
        }

        requests.sort_by_key(|request| (request.kind.read_function().code(), request.start));
        requests
    }

    async fn execute_read(
        &self,
        transport: &dyn Transport,
        device_id: &str,
        station: u8,
        request: &ReadRequest,
    ) -> Result<ResponsePayload, ModbusError> {
        let wire = encode_read_request(
            self.framing,
            station,
            request.kind.read_function(),
            request.start,
            request.quantity,
            None,
        );

        let read_metrics = ReadMetrics::start(device_id);

        match transport.execute(&wire).await {
            Ok(bytes) => match decode_response(&wire, &bytes) {
                Ok(payload) => {
                    read_metrics.success();
                    Ok(payload)
                }
                Err(err) => {
                    read_metrics.failure(error_kind(&err));
                    Err(err)
                }
            },
            Err(err) => {
                read_metrics.failure(error_kind(&err));
                Err(err)
            }
        }
    }

    /// Reconcile a successful response into the state store.
    async fn apply_payload(
        &mut self,
        index: usize,
        request: &ReadRequest,
        payload: &ResponsePayload,
        now: Instant,
    ) {
        for member in &request.addresses {
            let device = &mut self.devices[index];
            let Some(channel) = device.channels.get(&member.channel) else {
                continue;
            };

            let raw = match payload {
                ResponsePayload::Bits(bits) => bits
                    .get(request.offset(member.address))
                    .map(|bit| Value::Bool(*bit)),
                ResponsePayload::Registers(bytes) => {
                    let from = request.offset(member.address) * 2;
                    let to = from + usize::from(member.size) * 2;
                    let kind = device_read_kind(channel.data_type, channel.format.as_ref());

                    bytes
                        .get(from..to)
                        .and_then(|slice| value_from_registers(slice, kind, device.config.byte_order))
                }
                _ => None,
            };

            let logical = raw.as_ref().and_then(|raw| {
                transform_value_from_device(channel.data_type, channel.format.as_ref(), raw)
            });

            device.last_read.insert(member.channel.clone(), now);
            device.attempts.remove(&member.channel);

            match logical {
                Some(value) => {
                    debug!(channel = %member.channel, value = %value, "channel value read");
                    self.store.set_actual(&member.channel, value).await;
                }
                None => {
                    warn!(channel = %member.channel, "read value could not be transformed");
                    self.store.set_invalid(&member.channel).await;
                }
            }
        }
    }

    /// Account a failed request against its member channels.
    async fn apply_failure(
        &mut self,
        index: usize,
        request: &ReadRequest,
        err: &ModbusError,
        now: Instant,
    ) {
        let device_id = self.devices[index].config.id.clone();

        // The device itself told us the registers do not exist; retrying
        // cannot help, the mapping is wrong.
        if matches!(
            err,
            ModbusError::ExceptionResponse(
                ExceptionCode::IllegalDataAddress | ExceptionCode::IllegalFunction
            )
        ) {
            error!(device = %device_id, error = %err, "device rejected configured registers");

            for member in &request.addresses {
                self.store.set_invalid(&member.channel).await;
            }

            self.set_state(index, ConnectionState::Alert).await;
            return;
        }

        warn!(device = %device_id, error = %err, "bus read failed");

        let mut lost = false;

        for member in &request.addresses {
            let device = &mut self.devices[index];
            let attempts = device.attempts.entry(member.channel.clone()).or_insert(0);
            *attempts += 1;

            if *attempts >= READ_MAX_ATTEMPTS {
                lost = true;
            }

            self.store.set_invalid(&member.channel).await;
        }

        if lost {
            let device = &mut self.devices[index];
            device.attempts.clear();
            device.last_read.clear();
            device.lost_at = Some(now);

            self.set_state(index, ConnectionState::Lost).await;
        }
    }

    async fn set_state(&mut self, index: usize, state: ConnectionState) {
        let device_id = {
            let device = &mut self.devices[index];
            if device.state == state {
                return;
            }
            device.state = state;
            device.config.id.clone()
        };

        info!(device = %device_id, state = ?state, "device connection state changed");
        metrics::record_device_state(&device_id, state);

        let event = ConnectionEvent {
            device: device_id,
            state,
            at: Utc::now(),
        };
        let _ = self.events.send(event).await;
    }
}
