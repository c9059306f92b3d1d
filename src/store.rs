//! Channel property state store
//!
//! Shared snapshot of every channel property: the last value read from
//! the device, its validity, and any expected value a write is still
//! reconciling. Cloning the store is cheap; all clones see the same
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::modbus::transform::Value;

/// Device connectivity as tracked by the polling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never successfully polled yet.
    Unknown,
    /// Last poll cycle succeeded.
    Connected,
    /// Too many consecutive failures; polling is paused.
    Lost,
    /// Misconfiguration, the device will not be polled again.
    Alert,
}

/// Emitted whenever a device changes connectivity.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub device: String,
    pub state: ConnectionState,
    pub at: DateTime<Utc>,
}

/// A value change requested by the consumer, awaiting delivery to the
/// device.
#[derive(Debug, Clone)]
pub struct WriteIntent {
    pub device: String,
    pub channel: String,
    pub value: Value,
    pub received_at: DateTime<Utc>,
}

/// State of one channel property.
#[derive(Debug, Clone, Default)]
pub struct PropertyState {
    /// Last value confirmed by the device.
    pub actual: Option<Value>,
    /// False when the last read failed or the value was untransformable.
    pub valid: bool,
    /// Value a consumer asked us to write, not yet confirmed.
    pub expected: Option<Value>,
    /// When the expected value was handed to the transport.
    pub pending: Option<DateTime<Utc>>,
}

/// Shared store of channel property state, keyed by channel id.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<HashMap<String, PropertyState>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value read back from the device.
    pub async fn set_actual(&self, channel: &str, value: Value) {
        let mut map = self.inner.write().await;
        let state = map.entry(channel.to_string()).or_default();
        state.actual = Some(value);
        state.valid = true;
    }

    /// Mark the channel's value as stale after a failed or
    /// untransformable read.
    pub async fn set_invalid(&self, channel: &str) {
        let mut map = self.inner.write().await;
        let state = map.entry(channel.to_string()).or_default();
        state.valid = false;
    }

    /// Record a consumer's expected value for later delivery.
    pub async fn set_expected(&self, channel: &str, value: Value) {
        let mut map = self.inner.write().await;
        let state = map.entry(channel.to_string()).or_default();
        state.expected = Some(value);
        state.pending = None;
    }

    /// Mark the expected value as handed to the transport.
    pub async fn mark_pending(&self, channel: &str, at: DateTime<Utc>) {
        let mut map = self.inner.write().await;
        if let Some(state) = map.get_mut(channel) {
            state.pending = Some(at);
        }
    }

    /// The device accepted the write: promote expected to actual.
    pub async fn confirm_write(&self, channel: &str) {
        let mut map = self.inner.write().await;
        if let Some(state) = map.get_mut(channel) {
            if let Some(expected) = state.expected.take() {
                state.actual = Some(expected);
                state.valid = true;
            }
            state.pending = None;
        }
    }

    /// The write failed permanently: drop the expectation and flag the
    /// channel until the next successful read.
    pub async fn abandon_write(&self, channel: &str) {
        let mut map = self.inner.write().await;
        if let Some(state) = map.get_mut(channel) {
            state.expected = None;
            state.pending = None;
            state.valid = false;
        }
    }

    pub async fn get(&self, channel: &str) -> Option<PropertyState> {
        self.inner.read().await.get(channel).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, PropertyState> {
        self.inner.read().await.clone()
    }
}
