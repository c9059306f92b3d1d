//! Modbus wire codec
//!
//! Builds and parses RTU and TCP Application Data Units. RTU frames are
//! `station | function | data | CRC16-LE`; TCP frames carry the 7-byte
//! MBAP header (`transaction id | protocol id | length | unit id`)
//! instead of a checksum.

use rand::Rng;

use super::ModbusFunction;
use crate::error::{ExceptionCode, ModbusError};

/// Framing mode the request was encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Rtu,
    Tcp,
}

/// MBAP protocol identifier, always zero for Modbus.
const TCP_PROTOCOL_ID: u16 = 0;

/// Highest valid MBAP transaction identifier.
const MAX_TRANSACTION_ID: u16 = 0xFFFF;

/// One encoded request frame together with the fields needed to
/// validate its response.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub frame: Vec<u8>,
    pub framing: Framing,
    pub function: ModbusFunction,
    pub station: u8,
    pub start_address: u16,
    pub quantity: u16,
}

/// Decoded payload of a validated response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Coil / discrete input bits in address order, trimmed to the
    /// requested quantity.
    Bits(Vec<bool>),
    /// Raw register payload bytes, two per register, device byte order.
    Registers(Vec<u8>),
    /// Echo of a single-coil write.
    WriteCoilEcho { address: u16, value: bool },
    /// Echo of a single or multiple register write.
    WriteRegisterEcho { address: u16 },
}

/// Completeness of a buffered TCP byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete,
}

/// Modbus CRC16: poly 0xA001, init 0xFFFF, bit-shift algorithm.
/// Transmitted least significant byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for byte in data {
        crc ^= u16::from(*byte);

        for _ in 0..8 {
            let carry = crc & 0x0001;
            crc >>= 1;
            if carry != 0 {
                crc ^= 0xA001;
            }
        }
    }

    crc
}

fn rtu_frame(station: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(station);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn tcp_frame(transaction_id: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&TCP_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(pdu);
    frame
}

fn fresh_transaction_id() -> u16 {
    rand::thread_rng().gen_range(1..=MAX_TRANSACTION_ID)
}

fn build(
    framing: Framing,
    station: u8,
    function: ModbusFunction,
    start_address: u16,
    quantity: u16,
    transaction_id: Option<u16>,
    pdu: &[u8],
) -> WireRequest {
    let frame = match framing {
        Framing::Rtu => rtu_frame(station, pdu),
        Framing::Tcp => tcp_frame(
            transaction_id.unwrap_or_else(fresh_transaction_id),
            station,
            pdu,
        ),
    };

    WireRequest {
        frame,
        framing,
        function,
        station,
        start_address,
        quantity,
    }
}

/// Encode a read request (functions 0x01-0x04) for the given framing.
///
/// `transaction_id` applies to TCP framing only; a random id in
/// `1..=65535` is generated when the caller does not supply one.
pub fn encode_read_request(
    framing: Framing,
    station: u8,
    function: ModbusFunction,
    start_address: u16,
    quantity: u16,
    transaction_id: Option<u16>,
) -> WireRequest {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.code());
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());

    build(
        framing,
        station,
        function,
        start_address,
        quantity,
        transaction_id,
        &pdu,
    )
}

/// Encode a single-coil write (function 0x05). The coil value goes on
/// the wire as 0xFF00 (on) or 0x0000 (off).
pub fn encode_write_single_coil(
    framing: Framing,
    station: u8,
    address: u16,
    value: bool,
    transaction_id: Option<u16>,
) -> WireRequest {
    let wire_value: u16 = if value { 0xFF00 } else { 0x0000 };

    let mut pdu = Vec::with_capacity(5);
    pdu.push(ModbusFunction::WriteSingleCoil.code());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&wire_value.to_be_bytes());

    build(
        framing,
        station,
        ModbusFunction::WriteSingleCoil,
        address,
        1,
        transaction_id,
        &pdu,
    )
}

/// Encode a holding register write from packed value bytes.
///
/// Two bytes produce a single-register write (0x06); four bytes produce
/// a two-register multiple write (0x10) with the byte-count prefix.
pub fn encode_write_register(
    framing: Framing,
    station: u8,
    address: u16,
    value: &[u8],
    transaction_id: Option<u16>,
) -> Result<WireRequest, ModbusError> {
    let (function, mut pdu) = match value.len() {
        2 => {
            let mut pdu = Vec::with_capacity(5);
            pdu.push(ModbusFunction::WriteSingleRegister.code());
            pdu.extend_from_slice(&address.to_be_bytes());
            (ModbusFunction::WriteSingleRegister, pdu)
        }
        4 => {
            let mut pdu = Vec::with_capacity(10);
            pdu.push(ModbusFunction::WriteMultipleRegisters.code());
            pdu.extend_from_slice(&address.to_be_bytes());
            pdu.extend_from_slice(&2u16.to_be_bytes());
            pdu.push(4);
            (ModbusFunction::WriteMultipleRegisters, pdu)
        }
        other => {
            return Err(ModbusError::EncodeFailure(format!(
                "register write takes 2 or 4 value bytes, got {other}"
            )))
        }
    };

    pdu.extend_from_slice(value);

    let quantity = (value.len() / 2) as u16;

    Ok(build(
        framing,
        station,
        function,
        address,
        quantity,
        transaction_id,
        &pdu,
    ))
}

/// Decide whether a buffered TCP byte stream holds one complete frame.
///
/// The MBAP length field at offset 4 declares the byte count following
/// the 6-byte prefix. Fewer buffered bytes than declared means the
/// device response is still fragmented; more is a protocol violation.
pub fn check_tcp_frame(buffered: &[u8]) -> Result<FrameStatus, ModbusError> {
    // Minimal frame is 9 bytes: MBAP header, function code and one data byte.
    if buffered.len() < 9 {
        return Ok(FrameStatus::Incomplete);
    }

    let declared = u16::from_be_bytes([buffered[4], buffered[5]]) as usize;
    let expected = 6 + declared;

    if buffered.len() > expected {
        return Err(ModbusError::FrameOverrun {
            expected,
            actual: buffered.len(),
        });
    }

    if buffered.len() == expected {
        Ok(FrameStatus::Complete)
    } else {
        Ok(FrameStatus::Incomplete)
    }
}

/// Validate a response frame against its request and decode the payload.
pub fn decode_response(
    request: &WireRequest,
    response: &[u8],
) -> Result<ResponsePayload, ModbusError> {
    let min_length = match request.framing {
        Framing::Rtu => 4,
        Framing::Tcp => 8,
    };

    if response.len() < min_length {
        return Err(ModbusError::TooShortResponse {
            length: response.len(),
        });
    }

    let function_offset = match request.framing {
        Framing::Rtu => 1,
        Framing::Tcp => 7,
    };

    let expected = request.function.code();
    let actual = response[function_offset];

    if actual != expected {
        // Exception response carries function | 0x80 and a one-byte code.
        if actual == expected | 0x80 {
            let code = response
                .get(function_offset + 1)
                .copied()
                .ok_or(ModbusError::TooShortResponse {
                    length: response.len(),
                })?;

            return Err(ModbusError::ExceptionResponse(ExceptionCode::from_u8(code)));
        }

        return Err(ModbusError::IllegalResponse { expected, actual });
    }

    let data = match request.framing {
        Framing::Rtu => {
            let (body, trailer) = response.split_at(response.len() - 2);
            let received = u16::from_le_bytes([trailer[0], trailer[1]]);

            if crc16(body) != received {
                return Err(ModbusError::ChecksumMismatch);
            }

            &body[2..]
        }
        Framing::Tcp => &response[8..],
    };

    decode_payload(request, data)
}

fn decode_payload(request: &WireRequest, data: &[u8]) -> Result<ResponsePayload, ModbusError> {
    match request.function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            let count = usize::from(*data.first().ok_or(ModbusError::TooShortResponse {
                length: data.len(),
            })?);

            if data.len() < 1 + count {
                return Err(ModbusError::TooShortResponse { length: data.len() });
            }

            // Byte 0 holds addresses start..start+7 with bit 0 = start;
            // pad bits beyond the requested quantity are discarded.
            let mut bits = Vec::with_capacity(count * 8);

            for byte in &data[1..1 + count] {
                for bit in 0..8 {
                    bits.push(byte & (1 << bit) != 0);
                }
            }

            bits.truncate(usize::from(request.quantity));

            Ok(ResponsePayload::Bits(bits))
        }

        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            let count = usize::from(*data.first().ok_or(ModbusError::TooShortResponse {
                length: data.len(),
            })?);

            if data.len() < 1 + count {
                return Err(ModbusError::TooShortResponse { length: data.len() });
            }

            Ok(ResponsePayload::Registers(data[1..1 + count].to_vec()))
        }

        ModbusFunction::WriteSingleCoil => {
            if data.len() < 4 {
                return Err(ModbusError::TooShortResponse { length: data.len() });
            }

            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]) == 0xFF00;

            Ok(ResponsePayload::WriteCoilEcho { address, value })
        }

        ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
            if data.len() < 2 {
                return Err(ModbusError::TooShortResponse { length: data.len() });
            }

            let address = u16::from_be_bytes([data[0], data[1]]);

            Ok(ResponsePayload::WriteRegisterEcho { address })
        }
    }
}
