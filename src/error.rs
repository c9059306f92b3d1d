//! Protocol and transport error taxonomy
//!
//! Every failure the codec, transports or transformer can produce is a
//! value of [`ModbusError`]. The polling engine converts these into
//! per-channel invalid state at the request boundary; they never cross
//! a poll tick as panics.

use std::fmt;

/// Modbus exception code reported by a device in an exception response
/// (response function code = request function code | 0x80).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailedToRespond => 0x0B,
            Self::Unknown(other) => *other,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function"),
            Self::IllegalDataAddress => write!(f, "illegal data address"),
            Self::IllegalDataValue => write!(f, "illegal data value"),
            Self::ServerDeviceFailure => write!(f, "server device failure"),
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::ServerDeviceBusy => write!(f, "server device busy"),
            Self::MemoryParityError => write!(f, "memory parity error"),
            Self::GatewayPathUnavailable => write!(f, "gateway path unavailable"),
            Self::GatewayTargetFailedToRespond => write!(f, "gateway target failed to respond"),
            Self::Unknown(code) => write!(f, "unknown exception code {code:#04x}"),
        }
    }
}

/// Error type for Modbus operations
#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("response CRC does not match computed checksum")]
    ChecksumMismatch,

    #[error("response too short: {length} bytes")]
    TooShortResponse { length: usize },

    #[error("unexpected function code: expected {expected:#04x}, got {actual:#04x}")]
    IllegalResponse { expected: u8, actual: u8 },

    #[error("device reported Modbus exception: {0}")]
    ExceptionResponse(ExceptionCode),

    #[error("buffered frame has {actual} bytes, MBAP header declared {expected}")]
    FrameOverrun { expected: usize, actual: usize },

    #[error("device did not send response in time")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("value could not be represented on the wire: {0}")]
    EncodeFailure(String),

    #[error("device configuration is missing: {0}")]
    ConfigurationMissing(&'static str),
}
