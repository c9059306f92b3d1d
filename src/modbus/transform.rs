//! Value transformer
//!
//! Converts between logical typed values and their on-wire register
//! representation. Packing honors the device's configured byte order;
//! unparseable or out-of-range values become `None` so callers can mark
//! the property invalid instead of failing the poll loop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Byte/word permutation applied when a value spans registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    Big,
    BigSwap,
    Little,
    LittleSwap,
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::Big
    }
}

/// Logical data type of a channel property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    String,
    Switch,
    Button,
}

impl DataKind {
    /// Number of 16-bit registers the type occupies on the wire.
    /// Digital (single-bit) and string types have no register footprint.
    pub fn register_count(&self) -> u16 {
        match self {
            Self::Int | Self::UInt | Self::Float => 2,
            _ => 1,
        }
    }

    pub fn is_signed_int(&self) -> bool {
        matches!(self, Self::Char | Self::Short | Self::Int)
    }

    pub fn is_unsigned_int(&self) -> bool {
        matches!(self, Self::UChar | Self::UShort | Self::UInt)
    }
}

/// Switch channel payload symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPayload {
    On,
    Off,
    Toggle,
}

impl FromStr for SwitchPayload {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "toggle" => Ok(Self::Toggle),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SwitchPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Toggle => write!(f, "toggle"),
        }
    }
}

/// Button channel payload symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonPayload {
    Pressed,
    Released,
    Clicked,
    DoubleClicked,
    LongClicked,
}

impl FromStr for ButtonPayload {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pressed" => Ok(Self::Pressed),
            "released" => Ok(Self::Released),
            "clicked" => Ok(Self::Clicked),
            "double_clicked" => Ok(Self::DoubleClicked),
            "long_clicked" => Ok(Self::LongClicked),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ButtonPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pressed => write!(f, "pressed"),
            Self::Released => write!(f, "released"),
            Self::Clicked => write!(f, "clicked"),
            Self::DoubleClicked => write!(f, "double_clicked"),
            Self::LongClicked => write!(f, "long_clicked"),
        }
    }
}

/// A logical value flowing between the connector and the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Switch(SwitchPayload),
    Button(ButtonPayload),
}

impl Value {
    /// Canonical textual form used for enumeration matching.
    pub fn canonical(&self) -> String {
        match self {
            Self::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            Self::Int(v) => v.to_string(),
            Self::UInt(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::String(v) => v.clone(),
            Self::Switch(v) => v.to_string(),
            Self::Button(v) => v.to_string(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::String(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::String(v) => v.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// One side of an enumeration entry: a wire data type and the literal
/// the device uses for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumFace {
    #[serde(rename = "type")]
    pub kind: DataKind,
    pub value: String,
}

/// One enumeration entry: the logical payload symbol plus its read and
/// write representations on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumItem {
    pub payload: String,
    pub read: EnumFace,
    pub write: EnumFace,
}

/// Per-property format constraint, parsed at configuration load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyFormat {
    Range {
        min: Option<f64>,
        max: Option<f64>,
    },
    Enum(Vec<EnumItem>),
}

/// A value ready to be written to the device, tagged with the wire data
/// type the registers must be packed as.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceWrite {
    pub kind: DataKind,
    pub value: Value,
}

// --- register packing -------------------------------------------------

/// Permute big-endian bytes into the device byte order. The permutation
/// is an involution, so the same call restores network order.
fn apply_order(mut bytes: Vec<u8>, order: ByteOrder) -> Vec<u8> {
    let swap_bytes = matches!(order, ByteOrder::Little | ByteOrder::LittleSwap);
    let reverse_words = matches!(order, ByteOrder::Little | ByteOrder::BigSwap);

    if reverse_words {
        let words: Vec<[u8; 2]> = bytes.chunks(2).map(|w| [w[0], w[1]]).collect();
        bytes = words.into_iter().rev().flatten().collect();
    }

    if swap_bytes {
        for word in bytes.chunks_mut(2) {
            word.swap(0, 1);
        }
    }

    bytes
}

/// Pack a signed integer into 2 or 4 register bytes in device order.
/// Returns `None` when the value does not fit the width.
pub fn pack_signed_int(value: i64, width: usize, order: ByteOrder) -> Option<Vec<u8>> {
    let bytes = match width {
        2 => i16::try_from(value).ok()?.to_be_bytes().to_vec(),
        4 => i32::try_from(value).ok()?.to_be_bytes().to_vec(),
        _ => return None,
    };

    Some(apply_order(bytes, order))
}

/// Pack an unsigned integer into 2 or 4 register bytes in device order.
pub fn pack_unsigned_int(value: u64, width: usize, order: ByteOrder) -> Option<Vec<u8>> {
    let bytes = match width {
        2 => u16::try_from(value).ok()?.to_be_bytes().to_vec(),
        4 => u32::try_from(value).ok()?.to_be_bytes().to_vec(),
        _ => return None,
    };

    Some(apply_order(bytes, order))
}

/// Pack an IEEE-754 single into 4 register bytes in device order.
pub fn pack_float(value: f32, order: ByteOrder) -> Vec<u8> {
    apply_order(value.to_be_bytes().to_vec(), order)
}

/// Unpack 2 or 4 register bytes into a signed integer.
pub fn unpack_signed_int(bytes: &[u8], order: ByteOrder) -> Option<i64> {
    let natural = apply_order(bytes.to_vec(), order);

    match natural.len() {
        2 => Some(i64::from(i16::from_be_bytes([natural[0], natural[1]]))),
        4 => Some(i64::from(i32::from_be_bytes([
            natural[0], natural[1], natural[2], natural[3],
        ]))),
        _ => None,
    }
}

/// Unpack 2 or 4 register bytes into an unsigned integer.
pub fn unpack_unsigned_int(bytes: &[u8], order: ByteOrder) -> Option<u64> {
    let natural = apply_order(bytes.to_vec(), order);

    match natural.len() {
        2 => Some(u64::from(u16::from_be_bytes([natural[0], natural[1]]))),
        4 => Some(u64::from(u32::from_be_bytes([
            natural[0], natural[1], natural[2], natural[3],
        ]))),
        _ => None,
    }
}

/// Unpack 4 register bytes into an IEEE-754 single.
pub fn unpack_float(bytes: &[u8], order: ByteOrder) -> Option<f32> {
    let natural = apply_order(bytes.to_vec(), order);

    if natural.len() != 4 {
        return None;
    }

    Some(f32::from_be_bytes([
        natural[0], natural[1], natural[2], natural[3],
    ]))
}

/// Interpret raw register payload bytes as a logical value of the given
/// wire data type.
pub fn value_from_registers(bytes: &[u8], kind: DataKind, order: ByteOrder) -> Option<Value> {
    match kind {
        k if k.is_signed_int() => unpack_signed_int(bytes, order).map(Value::Int),
        k if k.is_unsigned_int() => unpack_unsigned_int(bytes, order).map(Value::UInt),
        DataKind::Float => unpack_float(bytes, order).map(|v| Value::Float(f64::from(v))),
        _ => None,
    }
}

/// Pack a device write into register bytes in device order.
pub fn pack_value(write: &DeviceWrite, order: ByteOrder) -> Option<Vec<u8>> {
    let width = usize::from(write.kind.register_count()) * 2;

    match write.kind {
        k if k.is_signed_int() => pack_signed_int(write.value.as_i64()?, width, order),
        k if k.is_unsigned_int() => {
            let raw = write.value.as_i64()?;
            pack_unsigned_int(u64::try_from(raw).ok()?, width, order)
        }
        DataKind::Float => Some(pack_float(write.value.as_f64()? as f32, order)),
        _ => None,
    }
}

// --- wire type resolution ---------------------------------------------

fn uniform_enum_kind(items: &[EnumItem], face: fn(&EnumItem) -> &EnumFace) -> Option<DataKind> {
    let first = face(items.first()?).kind;

    items
        .iter()
        .all(|item| face(item).kind == first)
        .then_some(first)
}

/// Data type the device is expected to report for reads of a property.
/// Switch/button properties resolve through their enumeration format.
pub fn device_read_kind(kind: DataKind, format: Option<&PropertyFormat>) -> DataKind {
    if let Some(PropertyFormat::Enum(items)) = format {
        if let Some(resolved) = uniform_enum_kind(items, |item| &item.read) {
            return resolved;
        }
    }

    kind
}

/// Data type register writes of a property must be packed as.
pub fn device_write_kind(kind: DataKind, format: Option<&PropertyFormat>) -> DataKind {
    if let Some(PropertyFormat::Enum(items)) = format {
        if let Some(resolved) = uniform_enum_kind(items, |item| &item.write) {
            return resolved;
        }
    }

    kind
}

// --- enumeration lookup -----------------------------------------------

/// Find the unique enumeration entry whose read representation matches
/// the raw device value. Zero or multiple matches yield `None`.
pub fn decode_enum<'a>(raw: &Value, items: &'a [EnumItem]) -> Option<&'a EnumItem> {
    let needle = raw.canonical().to_ascii_lowercase();

    let mut matches = items
        .iter()
        .filter(|item| item.read.value.to_ascii_lowercase() == needle);

    match (matches.next(), matches.next()) {
        (Some(item), None) => Some(item),
        _ => None,
    }
}

/// Find the unique enumeration entry for a logical payload symbol.
pub fn encode_enum<'a>(payload: &Value, items: &'a [EnumItem]) -> Option<&'a EnumItem> {
    let needle = payload.canonical().to_ascii_lowercase();

    let mut matches = items
        .iter()
        .filter(|item| item.payload.to_ascii_lowercase() == needle);

    match (matches.next(), matches.next()) {
        (Some(item), None) => Some(item),
        _ => None,
    }
}

fn in_range(value: f64, format: Option<&PropertyFormat>) -> bool {
    match format {
        Some(PropertyFormat::Range { min, max }) => {
            if min.is_some_and(|m| value < m) {
                return false;
            }
            if max.is_some_and(|m| value > m) {
                return false;
            }
            true
        }
        _ => true,
    }
}

/// Parse an enumeration literal as the given wire data type. Also used
/// at configuration load time to refuse malformed tables early.
pub fn parse_literal(kind: DataKind, literal: &str) -> Option<Value> {
    match kind {
        DataKind::Bool => match literal.to_ascii_lowercase().as_str() {
            "1" | "true" => Some(Value::Bool(true)),
            "0" | "false" => Some(Value::Bool(false)),
            _ => None,
        },
        k if k.is_signed_int() => literal.trim().parse().ok().map(Value::Int),
        k if k.is_unsigned_int() => literal.trim().parse().ok().map(Value::UInt),
        DataKind::Float => literal.trim().parse().ok().map(Value::Float),
        DataKind::String => Some(Value::String(literal.to_string())),
        _ => None,
    }
}

// --- logical transformation -------------------------------------------

/// Turn a raw device value into the property's logical value.
///
/// Numeric values outside the configured range, failed enumeration
/// lookups and unrepresentable inputs all yield `None`; the caller
/// marks the property invalid instead of propagating an error.
pub fn transform_value_from_device(
    kind: DataKind,
    format: Option<&PropertyFormat>,
    raw: &Value,
) -> Option<Value> {
    match kind {
        DataKind::Bool => match raw {
            Value::Bool(v) => Some(Value::Bool(*v)),
            other => other.as_f64().map(|v| Value::Bool(v != 0.0)),
        },

        DataKind::Float => {
            let value = raw.as_f64()?;
            in_range(value, format).then_some(Value::Float(value))
        }

        k if k.is_signed_int() => {
            let value = raw.as_i64()?;
            in_range(value as f64, format).then_some(Value::Int(value))
        }

        k if k.is_unsigned_int() => {
            let value = raw.as_i64()?;
            let value = u64::try_from(value).ok()?;
            in_range(value as f64, format).then_some(Value::UInt(value))
        }

        DataKind::String => Some(Value::String(raw.canonical())),

        DataKind::Switch => {
            let Some(PropertyFormat::Enum(items)) = format else {
                return None;
            };
            let item = decode_enum(raw, items)?;
            item.payload.parse().ok().map(Value::Switch)
        }

        DataKind::Button => {
            let Some(PropertyFormat::Enum(items)) = format else {
                return None;
            };
            let item = decode_enum(raw, items)?;
            item.payload.parse().ok().map(Value::Button)
        }

        _ => None,
    }
}

/// Turn a logical expected value into its wire representation.
/// Boolean values map to 0/1; switch/button payloads resolve through
/// the enumeration's write representation.
pub fn transform_value_to_device(
    kind: DataKind,
    format: Option<&PropertyFormat>,
    value: &Value,
) -> Option<DeviceWrite> {
    match kind {
        DataKind::Bool => match value {
            Value::Bool(v) => Some(DeviceWrite {
                kind: DataKind::Bool,
                value: Value::Bool(*v),
            }),
            other => match other.as_i64() {
                Some(0) => Some(DeviceWrite {
                    kind: DataKind::Bool,
                    value: Value::Bool(false),
                }),
                Some(1) => Some(DeviceWrite {
                    kind: DataKind::Bool,
                    value: Value::Bool(true),
                }),
                _ => None,
            },
        },

        DataKind::Float => value.as_f64().map(|v| DeviceWrite {
            kind: DataKind::Float,
            value: Value::Float(v),
        }),

        k if k.is_signed_int() => value.as_i64().map(|v| DeviceWrite {
            kind,
            value: Value::Int(v),
        }),

        k if k.is_unsigned_int() => {
            let raw = value.as_i64()?;
            u64::try_from(raw).ok().map(|v| DeviceWrite {
                kind,
                value: Value::UInt(v),
            })
        }

        DataKind::String => Some(DeviceWrite {
            kind: DataKind::String,
            value: Value::String(value.canonical()),
        }),

        DataKind::Switch | DataKind::Button => {
            let Some(PropertyFormat::Enum(items)) = format else {
                return None;
            };
            let item = encode_enum(value, items)?;
            let literal = parse_literal(item.write.kind, &item.write.value)?;

            Some(DeviceWrite {
                kind: item.write.kind,
                value: literal,
            })
        }

        _ => None,
    }
}
