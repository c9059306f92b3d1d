//! Integration tests for the polling engine and write coordinator

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use modbridge::config::{ChannelConfig, DeviceConfig};
use modbridge::error::ModbusError;
use modbridge::modbus::codec::{crc16, encode_write_register, Framing, WireRequest};
use modbridge::modbus::transform::{ByteOrder, DataKind, Value};
use modbridge::modbus::transport::Transport;
use modbridge::modbus::RegisterKind;
use modbridge::poll::write::{WriteCoordinator, WRITE_DEBOUNCE_DELAY};
use modbridge::poll::{PollingEngine, LOST_DELAY, READ_MAX_ATTEMPTS};
use modbridge::store::{ConnectionEvent, ConnectionState, StateStore, WriteIntent};

/// Transport that replays a scripted sequence of responses and records
/// every frame it was asked to send.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Vec<u8>, ModbusError>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, outcome: Result<Vec<u8>, ModbusError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &WireRequest) -> Result<Vec<u8>, ModbusError> {
        self.sent.lock().unwrap().push(request.frame.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ModbusError::Timeout))
    }
}

fn rtu_response(station: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![station, function];
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn channel(id: &str, address: u16) -> ChannelConfig {
    ChannelConfig {
        id: id.to_string(),
        address,
        register: RegisterKind::HoldingRegister,
        data_type: DataKind::UShort,
        format: None,
        reading_delay_ms: 0,
        settable: false,
        queryable: true,
    }
}

fn device(id: &str, channels: Vec<ChannelConfig>) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        name: id.to_string(),
        station: 1,
        host: None,
        port: 502,
        byte_order: ByteOrder::Big,
        channels,
    }
}

fn engine(
    transport: Arc<ScriptedTransport>,
    config: DeviceConfig,
    store: StateStore,
) -> (PollingEngine, mpsc::Receiver<ConnectionEvent>) {
    let (event_tx, event_rx) = mpsc::channel(16);
    let engine = PollingEngine::new(
        Framing::Rtu,
        vec![(config, transport as Arc<dyn Transport>)],
        store,
        event_tx,
    );
    (engine, event_rx)
}

/// Run enough ticks to complete one full round-robin cycle.
async fn run_cycle(engine: &mut PollingEngine) {
    engine.tick().await;
    engine.tick().await;
}

#[tokio::test(start_paused = true)]
async fn successful_read_lands_in_store() {
    let transport = ScriptedTransport::new();
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x07])));

    let store = StateStore::new();
    let (mut engine, _events) = engine(
        transport.clone(),
        device("dev", vec![channel("temp", 0)]),
        store.clone(),
    );

    run_cycle(&mut engine).await;

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Connected));

    let state = store.get("temp").await.unwrap();
    assert_eq!(state.actual, Some(Value::UInt(7)));
    assert!(state.valid);
}

#[tokio::test(start_paused = true)]
async fn device_is_lost_after_max_attempts_and_recovers() {
    let transport = ScriptedTransport::new();
    // Script is empty, every read times out.

    let store = StateStore::new();
    let (mut engine, mut events) = engine(
        transport.clone(),
        device("dev", vec![channel("temp", 0)]),
        store.clone(),
    );

    for _ in 0..u32::from(READ_MAX_ATTEMPTS) {
        run_cycle(&mut engine).await;
    }

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Lost));
    assert_eq!(
        transport.sent_frames().len(),
        usize::from(READ_MAX_ATTEMPTS)
    );
    assert!(!store.get("temp").await.unwrap().valid);

    let event = events.recv().await.unwrap();
    assert_eq!(event.state, ConnectionState::Lost);

    // Resting: no frames go out before the lost delay elapses.
    run_cycle(&mut engine).await;
    assert_eq!(
        transport.sent_frames().len(),
        usize::from(READ_MAX_ATTEMPTS)
    );

    tokio::time::advance(LOST_DELAY + Duration::from_millis(1)).await;
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x2A])));

    run_cycle(&mut engine).await;

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Connected));
    assert_eq!(
        store.get("temp").await.unwrap().actual,
        Some(Value::UInt(42))
    );

    let event = events.recv().await.unwrap();
    assert_eq!(event.state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn success_resets_the_failure_counter() {
    let transport = ScriptedTransport::new();

    let store = StateStore::new();
    let (mut engine, _events) = engine(
        transport.clone(),
        device("dev", vec![channel("temp", 0)]),
        store.clone(),
    );

    // Four failures, one success, four more failures: never lost.
    for _ in 0..4 {
        run_cycle(&mut engine).await;
    }
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x01])));
    run_cycle(&mut engine).await;
    for _ in 0..4 {
        run_cycle(&mut engine).await;
    }

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Connected));
}

#[tokio::test(start_paused = true)]
async fn partly_failed_cycle_does_not_reconnect_a_lost_device() {
    let transport = ScriptedTransport::new();
    // Empty script at first, both requests of each cycle time out.

    let store = StateStore::new();
    let (mut engine, mut events) = engine(
        transport.clone(),
        device("dev", vec![channel("a", 0), channel("b", 10)]),
        store.clone(),
    );

    for _ in 0..u32::from(READ_MAX_ATTEMPTS) {
        run_cycle(&mut engine).await;
    }

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Lost));
    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Lost);

    tokio::time::advance(LOST_DELAY + Duration::from_millis(1)).await;

    // One request succeeds, the other still times out: the device must
    // stay lost until a cycle goes through cleanly.
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x05])));
    run_cycle(&mut engine).await;

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Lost));
    assert_eq!(store.get("a").await.unwrap().actual, Some(Value::UInt(5)));
    assert!(!store.get("b").await.unwrap().valid);

    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x06])));
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x07])));
    run_cycle(&mut engine).await;

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Connected));
    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn illegal_address_exception_puts_device_in_alert() {
    let transport = ScriptedTransport::new();
    transport.push(Ok(rtu_response(1, 0x83, &[0x02])));

    let store = StateStore::new();
    let (mut engine, mut events) = engine(
        transport.clone(),
        device("dev", vec![channel("temp", 0)]),
        store.clone(),
    );

    run_cycle(&mut engine).await;

    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Alert));
    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Alert);

    // Alerted devices are never polled again.
    run_cycle(&mut engine).await;
    run_cycle(&mut engine).await;
    assert_eq!(transport.sent_frames().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn contiguous_channels_are_batched_into_one_request() {
    let transport = ScriptedTransport::new();
    // First request covers registers 0..3, second register 10.
    transport.push(Ok(rtu_response(
        1,
        0x03,
        &[0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03],
    )));
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x0A])));

    let store = StateStore::new();
    let (mut engine, _events) = engine(
        transport.clone(),
        device(
            "dev",
            vec![
                channel("a", 0),
                channel("b", 1),
                channel("c", 2),
                channel("d", 10),
            ],
        ),
        store.clone(),
    );

    run_cycle(&mut engine).await;

    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 2);

    // Read frames: station, function, start, quantity, crc.
    assert_eq!(&frames[0][2..6], &[0x00, 0x00, 0x00, 0x03]);
    assert_eq!(&frames[1][2..6], &[0x00, 0x0A, 0x00, 0x01]);

    assert_eq!(store.get("a").await.unwrap().actual, Some(Value::UInt(1)));
    assert_eq!(store.get("b").await.unwrap().actual, Some(Value::UInt(2)));
    assert_eq!(store.get("c").await.unwrap().actual, Some(Value::UInt(3)));
    assert_eq!(store.get("d").await.unwrap().actual, Some(Value::UInt(10)));
}

#[tokio::test(start_paused = true)]
async fn reading_delay_gates_repolling() {
    let transport = ScriptedTransport::new();
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x01])));
    transport.push(Ok(rtu_response(1, 0x03, &[0x02, 0x00, 0x02])));

    let mut config = device("dev", vec![channel("temp", 0)]);
    config.channels[0].reading_delay_ms = 10_000;

    let store = StateStore::new();
    let (mut engine, _events) = engine(transport.clone(), config, store.clone());

    run_cycle(&mut engine).await;
    run_cycle(&mut engine).await;
    run_cycle(&mut engine).await;
    assert_eq!(transport.sent_frames().len(), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    run_cycle(&mut engine).await;
    assert_eq!(transport.sent_frames().len(), 2);
    assert_eq!(
        store.get("temp").await.unwrap().actual,
        Some(Value::UInt(2))
    );
}

#[tokio::test(start_paused = true)]
async fn non_queryable_channels_are_not_polled() {
    let transport = ScriptedTransport::new();

    let mut config = device("dev", vec![channel("temp", 0)]);
    config.channels[0].queryable = false;

    let store = StateStore::new();
    let (mut engine, _events) = engine(transport.clone(), config, store.clone());

    run_cycle(&mut engine).await;
    run_cycle(&mut engine).await;

    assert!(transport.sent_frames().is_empty());
    assert_eq!(engine.device_state("dev"), Some(ConnectionState::Unknown));
}

fn tcp_response(unit: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x00, 0x01, 0x00, 0x00];
    frame.extend_from_slice(&(payload.len() as u16 + 2).to_be_bytes());
    frame.push(unit);
    frame.push(function);
    frame.extend_from_slice(payload);
    frame
}

#[tokio::test(start_paused = true)]
async fn device_without_host_is_alerted_while_others_poll() {
    let transport = ScriptedTransport::new();
    transport.push(Ok(tcp_response(1, 0x03, &[0x02, 0x00, 0x07])));

    let no_host = device("dev-a", vec![channel("a", 0)]);
    let mut reachable = device("dev-b", vec![channel("b", 0)]);
    reachable.host = Some("192.168.1.10".to_string());

    let store = StateStore::new();
    let (event_tx, mut events) = mpsc::channel(16);
    let mut engine = PollingEngine::new(
        Framing::Tcp,
        vec![
            (no_host, transport.clone() as Arc<dyn Transport>),
            (reachable, transport.clone() as Arc<dyn Transport>),
        ],
        store.clone(),
        event_tx,
    );

    engine.tick().await;
    engine.tick().await;
    engine.tick().await;

    assert_eq!(engine.device_state("dev-a"), Some(ConnectionState::Alert));
    assert_eq!(engine.device_state("dev-b"), Some(ConnectionState::Connected));

    let event = events.recv().await.unwrap();
    assert_eq!(event.device, "dev-a");
    assert_eq!(event.state, ConnectionState::Alert);
    assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connected);

    // Only the reachable device put a request on the wire.
    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0][7], 0x03);

    assert_eq!(store.get("b").await.unwrap().actual, Some(Value::UInt(7)));
    assert!(store.get("a").await.is_none());
}

fn write_intent(value: Value) -> WriteIntent {
    WriteIntent {
        device: "dev".to_string(),
        channel: "level".to_string(),
        value,
        received_at: Utc::now(),
    }
}

fn settable_device() -> DeviceConfig {
    let mut level = channel("level", 5);
    level.settable = true;
    device("dev", vec![level])
}

#[tokio::test(start_paused = true)]
async fn confirmed_write_promotes_expected_value() {
    let transport = ScriptedTransport::new();

    // A single register write is echoed back verbatim.
    let echo = encode_write_register(Framing::Rtu, 1, 5, &[0x00, 0x07], None).unwrap();
    transport.push(Ok(echo.frame.clone()));

    let store = StateStore::new();
    let mut coordinator = WriteCoordinator::new(
        Framing::Rtu,
        vec![(settable_device(), transport.clone() as Arc<dyn Transport>)],
        store.clone(),
    );

    coordinator.handle(write_intent(Value::UInt(7))).await;

    assert_eq!(transport.sent_frames(), vec![echo.frame]);

    let state = store.get("level").await.unwrap();
    assert_eq!(state.actual, Some(Value::UInt(7)));
    assert!(state.expected.is_none());
    assert!(state.valid);
}

#[tokio::test(start_paused = true)]
async fn repeated_writes_are_debounced() {
    let transport = ScriptedTransport::new();

    let echo = encode_write_register(Framing::Rtu, 1, 5, &[0x00, 0x07], None).unwrap();
    transport.push(Ok(echo.frame.clone()));

    let store = StateStore::new();
    let mut coordinator = WriteCoordinator::new(
        Framing::Rtu,
        vec![(settable_device(), transport.clone() as Arc<dyn Transport>)],
        store.clone(),
    );

    coordinator.handle(write_intent(Value::UInt(7))).await;
    coordinator.handle(write_intent(Value::UInt(7))).await;
    coordinator.handle(write_intent(Value::UInt(8))).await;

    // Only the first write went out inside the debounce window.
    assert_eq!(transport.sent_frames().len(), 1);

    tokio::time::advance(WRITE_DEBOUNCE_DELAY + Duration::from_millis(1)).await;

    let echo = encode_write_register(Framing::Rtu, 1, 5, &[0x00, 0x08], None).unwrap();
    transport.push(Ok(echo.frame));

    coordinator.handle(write_intent(Value::UInt(8))).await;
    assert_eq!(transport.sent_frames().len(), 2);
    assert_eq!(
        store.get("level").await.unwrap().actual,
        Some(Value::UInt(8))
    );
}

#[tokio::test(start_paused = true)]
async fn failed_write_abandons_the_expectation() {
    let transport = ScriptedTransport::new();
    // Empty script: the write times out.

    let store = StateStore::new();
    store.set_actual("level", Value::UInt(1)).await;

    let mut coordinator = WriteCoordinator::new(
        Framing::Rtu,
        vec![(settable_device(), transport.clone() as Arc<dyn Transport>)],
        store.clone(),
    );

    coordinator.handle(write_intent(Value::UInt(7))).await;

    let state = store.get("level").await.unwrap();
    assert_eq!(state.actual, Some(Value::UInt(1)));
    assert!(state.expected.is_none());
    assert!(!state.valid);
}

#[tokio::test(start_paused = true)]
async fn writes_to_non_settable_channels_are_rejected() {
    let transport = ScriptedTransport::new();

    let store = StateStore::new();
    let mut coordinator = WriteCoordinator::new(
        Framing::Rtu,
        vec![(
            device("dev", vec![channel("level", 5)]),
            transport.clone() as Arc<dyn Transport>,
        )],
        store.clone(),
    );

    coordinator.handle(write_intent(Value::UInt(7))).await;

    assert!(transport.sent_frames().is_empty());
    assert!(store.get("level").await.is_none());
}
