//! Modbridge - Modbus Field-Bus Connector Library
//!
//! Polls Modbus TCP/RTU devices and reconciles register state with
//! consumer-facing channel properties

pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod modbus;
pub mod poll;
pub mod store;
