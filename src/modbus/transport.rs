//! RTU and TCP transports
//!
//! A transport owns the physical link and executes one framed request
//! at a time, returning the raw response bytes for the codec to decode.
//! The RTU transport keeps its serial handle open across requests and
//! drops it after an IO failure so the next request reopens the port.
//! The TCP transport opens a fresh connection per request.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, trace};

use super::codec::{check_tcp_frame, FrameStatus, WireRequest};
use super::ModbusFunction;
use crate::error::ModbusError;

/// Quiet period between consecutive frames on the serial bus.
pub const RTU_INTER_FRAME_DELAY: Duration = Duration::from_millis(100);

/// How long the RTU transport waits for a complete response.
pub const RTU_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP connection establishment timeout.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Overall deadline for one TCP request round trip.
pub const TCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Executes framed requests against the field bus.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &WireRequest) -> Result<Vec<u8>, ModbusError>;
}

/// Serial line parameters for the RTU transport.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

/// Expected RTU response length for a request, excluding the exception
/// case. Lets the reader stop without inter-byte timing heuristics.
fn expected_rtu_response_len(request: &WireRequest) -> usize {
    match request.function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            3 + usize::from(request.quantity.div_ceil(8)) + 2
        }
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            3 + usize::from(request.quantity) * 2 + 2
        }
        ModbusFunction::WriteSingleCoil
        | ModbusFunction::WriteSingleRegister
        | ModbusFunction::WriteMultipleRegisters => 8,
    }
}

/// RTU exception responses are always five bytes:
/// station, function | 0x80, exception code, CRC.
const RTU_EXCEPTION_LEN: usize = 5;

/// Serial RTU transport with a lazily opened, cached port handle.
pub struct RtuTransport {
    settings: SerialSettings,
    port: Mutex<Option<SerialStream>>,
}

impl RtuTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<SerialStream, ModbusError> {
        debug!(path = %self.settings.path, baud = self.settings.baud_rate, "opening serial port");

        let port = tokio_serial::new(&self.settings.path, self.settings.baud_rate)
            .data_bits(self.settings.data_bits)
            .stop_bits(self.settings.stop_bits)
            .parity(self.settings.parity)
            .timeout(RTU_READ_TIMEOUT)
            .open_native_async()
            .map_err(|err| ModbusError::Transport(err.into()))?;

        Ok(port)
    }

    async fn round_trip(
        &self,
        port: &mut SerialStream,
        request: &WireRequest,
    ) -> Result<Vec<u8>, ModbusError> {
        port.write_all(&request.frame).await?;
        port.flush().await?;

        // Read the exception-sized prefix first; the function byte
        // tells us whether more bytes are on the way.
        let mut response = vec![0u8; RTU_EXCEPTION_LEN];
        port.read_exact(&mut response).await?;

        let expected = expected_rtu_response_len(request);
        let is_exception = response[1] & 0x80 != 0;

        if !is_exception && expected > RTU_EXCEPTION_LEN {
            let mut rest = vec![0u8; expected - RTU_EXCEPTION_LEN];
            port.read_exact(&mut rest).await?;
            response.extend_from_slice(&rest);
        }

        trace!(station = request.station, len = response.len(), "rtu response received");

        Ok(response)
    }
}

#[async_trait]
impl Transport for RtuTransport {
    async fn execute(&self, request: &WireRequest) -> Result<Vec<u8>, ModbusError> {
        let mut guard = self.port.lock().await;

        let mut port = match guard.take() {
            Some(port) => port,
            None => self.open()?,
        };

        sleep(RTU_INTER_FRAME_DELAY).await;

        let result = match timeout(RTU_READ_TIMEOUT, self.round_trip(&mut port, request)).await {
            Ok(inner) => inner,
            Err(_) => Err(ModbusError::Timeout),
        };

        // A failed exchange leaves the line in an unknown state; keep
        // the handle only after a clean one.
        if result.is_ok() {
            *guard = Some(port);
        }

        result
    }
}

/// TCP transport opening a fresh connection per request.
pub struct TcpTransport {
    host: String,
    port: u16,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    async fn round_trip(&self, request: &WireRequest) -> Result<Vec<u8>, ModbusError> {
        let address = format!("{}:{}", self.host, self.port);

        let mut stream = match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(connected) => connected?,
            Err(_) => return Err(ModbusError::Timeout),
        };

        stream.write_all(&request.frame).await?;

        let mut response = Vec::with_capacity(request.frame.len());
        let mut chunk = [0u8; 256];

        loop {
            let read = stream.read(&mut chunk).await?;

            if read == 0 {
                return Err(ModbusError::TooShortResponse {
                    length: response.len(),
                });
            }

            response.extend_from_slice(&chunk[..read]);

            match check_tcp_frame(&response)? {
                FrameStatus::Complete => break,
                FrameStatus::Incomplete => continue,
            }
        }

        trace!(unit = request.station, len = response.len(), "tcp response received");

        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn execute(&self, request: &WireRequest) -> Result<Vec<u8>, ModbusError> {
        match timeout(TCP_REQUEST_TIMEOUT, self.round_trip(request)).await {
            Ok(inner) => inner,
            Err(_) => Err(ModbusError::Timeout),
        }
    }
}
