//! Configuration management for Modbridge

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_serial::{DataBits, Parity, StopBits};

use crate::modbus::transform::{parse_literal, ByteOrder, DataKind, PropertyFormat};
use crate::modbus::transport::SerialSettings;
use crate::modbus::RegisterKind;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connector-wide settings
    pub connector: ConnectorConfig,
    /// List of Modbus devices
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Bus mode: "rtu" or "tcp"
    pub mode: ConnectorMode,
    /// Serial line settings, required in RTU mode
    pub serial: Option<SerialConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorMode {
    Rtu,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., /dev/ttyUSB0)
    pub interface: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits: 5 to 8
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits: 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity: "none", "even", "odd"
    #[serde(default = "default_parity")]
    pub parity: String,
}

impl SerialConfig {
    /// Resolve into transport settings, rejecting unsupported values.
    pub fn settings(&self) -> Result<SerialSettings> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => bail!("unsupported data bits: {other}"),
        };

        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => bail!("unsupported stop bits: {other}"),
        };

        let parity = match self.parity.to_ascii_lowercase().as_str() {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            other => bail!("unsupported parity: {other}"),
        };

        Ok(SerialSettings {
            path: self.interface.clone(),
            baud_rate: self.baud_rate,
            data_bits,
            stop_bits,
            parity,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device ID
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// RTU station address / TCP unit identifier
    pub station: u8,
    /// Device host; a TCP device without one is alerted instead of polled
    pub host: Option<String>,
    /// Device port (default: 502)
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Multi-register byte order
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Channels mapped onto the device's registers
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel ID
    pub id: String,
    /// Zero-based register address
    pub address: u16,
    /// Register class the channel is mapped onto
    pub register: RegisterKind,
    /// Logical data type of the channel value
    pub data_type: DataKind,
    /// Optional range or enumeration constraint
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub format: Option<PropertyFormat>,
    /// Minimum milliseconds between reads of this channel
    #[serde(default = "default_reading_delay_ms")]
    pub reading_delay_ms: u64,
    /// Channel accepts writes
    #[serde(default)]
    pub settable: bool,
    /// Channel is polled
    #[serde(default = "default_true")]
    pub queryable: bool,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_tcp_port() -> u16 {
    502
}

fn default_reading_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connector: ConnectorConfig {
                mode: ConnectorMode::Tcp,
                serial: None,
            },
            devices: vec![],
        }
    }
}

impl Config {
    /// Reject configurations the connector cannot run with. Malformed
    /// enumeration literals are refused here instead of failing writes
    /// at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.connector.mode == ConnectorMode::Rtu {
            let serial = self
                .connector
                .serial
                .as_ref()
                .context("rtu mode requires connector.serial settings")?;
            serial.settings()?;
        }

        for device in &self.devices {
            for channel in &device.channels {
                if channel.settable && !channel.register.is_writable() {
                    bail!(
                        "channel {} is settable but mapped to a read-only register class",
                        channel.id
                    );
                }

                match (&channel.data_type, &channel.format) {
                    (DataKind::Switch | DataKind::Button, Some(PropertyFormat::Enum(items))) => {
                        for item in items {
                            parse_literal(item.write.kind, &item.write.value)
                                .with_context(|| {
                                    format!(
                                        "channel {} enum entry {} has an unparseable write value",
                                        channel.id, item.payload
                                    )
                                })?;
                        }
                    }
                    (DataKind::Switch | DataKind::Button, _) => {
                        bail!(
                            "channel {} needs an enum format for its data type",
                            channel.id
                        );
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

/// Load configuration from file or use defaults
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("MODBRIDGE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

    if Path::new(&config_path).exists() {
        load_config_from_path(&config_path)
    } else {
        tracing::warn!("Config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Load and validate configuration from a specific file
pub fn load_config_from_path(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    let config: Config =
        serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Load configuration from a YAML string (used in tests)
#[cfg(test)]
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml).with_context(|| "Failed to parse config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.connector.mode, ConnectorMode::Tcp);
        assert!(config.connector.serial.is_none());
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_tcp_device() {
        let yaml = r#"
connector:
  mode: tcp
devices:
  - id: "plc-001"
    name: "Test PLC"
    station: 1
    host: "192.168.1.100"
    channels:
      - id: "temperature"
        address: 0
        register: input_register
        data_type: short
        reading_delay_ms: 5000
"#;
        let config = load_config_from_str(yaml).unwrap();

        assert_eq!(config.devices.len(), 1);
        let device = &config.devices[0];
        assert_eq!(device.id, "plc-001");
        assert_eq!(device.port, 502);
        assert_eq!(device.byte_order, ByteOrder::Big);

        let channel = &device.channels[0];
        assert_eq!(channel.address, 0);
        assert_eq!(channel.register, RegisterKind::InputRegister);
        assert_eq!(channel.data_type, DataKind::Short);
        assert_eq!(channel.reading_delay_ms, 5000);
        assert!(!channel.settable);
        assert!(channel.queryable);
    }

    #[test]
    fn test_parse_rtu_connector() {
        let yaml = r#"
connector:
  mode: rtu
  serial:
    interface: "/dev/ttyUSB0"
    baud_rate: 9600
    parity: "even"
devices:
  - id: "sensor-001"
    name: "RTU Sensor"
    station: 3
    byte_order: little_swap
    channels:
      - id: "humidity"
        address: 100
        register: holding_register
        data_type: u_short
"#;
        let config = load_config_from_str(yaml).unwrap();

        let serial = config.connector.serial.as_ref().unwrap();
        assert_eq!(serial.interface, "/dev/ttyUSB0");
        assert_eq!(serial.data_bits, 8);
        assert_eq!(serial.stop_bits, 1);

        let settings = serial.settings().unwrap();
        assert_eq!(settings.parity, Parity::Even);

        assert_eq!(config.devices[0].byte_order, ByteOrder::LittleSwap);
    }

    #[test]
    fn test_parse_enum_format() {
        let yaml = r#"
connector:
  mode: tcp
devices:
  - id: "relay"
    name: "Relay"
    station: 1
    host: "localhost"
    channels:
      - id: "state"
        address: 4
        register: holding_register
        data_type: switch
        settable: true
        format:
          enum:
            - payload: "on"
              read: { type: u_char, value: "1" }
              write: { type: u_short, value: "256" }
            - payload: "off"
              read: { type: u_char, value: "0" }
              write: { type: u_short, value: "512" }
"#;
        let config = load_config_from_str(yaml).unwrap();

        let channel = &config.devices[0].channels[0];
        match channel.format.as_ref().unwrap() {
            PropertyFormat::Enum(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].payload, "on");
                assert_eq!(items[1].write.value, "512");
            }
            _ => panic!("Expected enum format"),
        }
    }

    #[test]
    fn test_parse_range_format() {
        let yaml = r#"
connector:
  mode: tcp
devices:
  - id: "dimmer"
    name: "Dimmer"
    station: 1
    host: "localhost"
    channels:
      - id: "level"
        address: 0
        register: holding_register
        data_type: u_short
        format:
          range:
            min: 0
            max: 100
"#;
        let config = load_config_from_str(yaml).unwrap();

        let channel = &config.devices[0].channels[0];
        assert!(matches!(
            channel.format,
            Some(PropertyFormat::Range {
                min: Some(_),
                max: Some(_)
            })
        ));
    }

    #[test]
    fn test_switch_without_enum_is_rejected() {
        let yaml = r#"
connector:
  mode: tcp
devices:
  - id: "relay"
    name: "Relay"
    station: 1
    host: "localhost"
    channels:
      - id: "state"
        address: 0
        register: holding_register
        data_type: switch
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_unparseable_enum_literal_is_rejected() {
        let yaml = r#"
connector:
  mode: tcp
devices:
  - id: "relay"
    name: "Relay"
    station: 1
    host: "localhost"
    channels:
      - id: "state"
        address: 0
        register: holding_register
        data_type: switch
        format:
          enum:
            - payload: "on"
              read: { type: u_char, value: "1" }
              write: { type: u_short, value: "not-a-number" }
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_settable_input_register_is_rejected() {
        let yaml = r#"
connector:
  mode: tcp
devices:
  - id: "meter"
    name: "Meter"
    station: 1
    host: "localhost"
    channels:
      - id: "energy"
        address: 0
        register: input_register
        data_type: u_int
        settable: true
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_rtu_mode_requires_serial() {
        let yaml = r#"
connector:
  mode: rtu
devices: []
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_bad_parity_is_rejected() {
        let yaml = r#"
connector:
  mode: rtu
  serial:
    interface: "/dev/ttyUSB0"
    baud_rate: 9600
    parity: "mark"
devices: []
"#;
        assert!(load_config_from_str(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connector:\n  mode: tcp\ndevices: []"
        )
        .unwrap();

        let config = load_config_from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.connector.mode, ConnectorMode::Tcp);
    }

    #[test]
    fn test_invalid_yaml() {
        let yaml = "this is not valid yaml: [";
        assert!(load_config_from_str(yaml).is_err());
    }
}
