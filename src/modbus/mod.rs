//! Modbus protocol handling
//!
//! Wire codec, value transformer, request batching and the RTU/TCP
//! transports that execute framed requests.

pub mod batch;
pub mod codec;
pub mod transform;
pub mod transport;

use serde::{Deserialize, Serialize};

/// Maximum quantity of 16-bit registers one read request may ask for
/// (function codes 0x03 / 0x04).
pub const MAX_ANALOG_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum quantity of single-bit registers one read request may ask for
/// (function codes 0x01 / 0x02).
pub const MAX_DISCRETE_REGISTERS_PER_REQUEST: u16 = 2000;

/// Modbus function codes used by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Register class a channel is mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl RegisterKind {
    /// Function code used to read this register class.
    pub fn read_function(&self) -> ModbusFunction {
        match self {
            Self::Coil => ModbusFunction::ReadCoils,
            Self::DiscreteInput => ModbusFunction::ReadDiscreteInputs,
            Self::HoldingRegister => ModbusFunction::ReadHoldingRegisters,
            Self::InputRegister => ModbusFunction::ReadInputRegisters,
        }
    }

    /// Protocol ceiling for one read request of this class.
    pub fn max_quantity_per_request(&self) -> u16 {
        match self {
            Self::Coil | Self::DiscreteInput => MAX_DISCRETE_REGISTERS_PER_REQUEST,
            Self::HoldingRegister | Self::InputRegister => MAX_ANALOG_REGISTERS_PER_REQUEST,
        }
    }

    /// True for single-bit register classes.
    pub fn is_digital(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    /// True when the class accepts writes.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }
}
