//! Adapter trait definition and core types
//!
//! The abstract interface a platform BLE radio driver conforms to. All
//! hardware interaction (scanning, connecting, GATT I/O) goes through
//! [`BleAdapter`] commands, and all asynchronous hardware callbacks come
//! back as [`AdapterEvent`]s on a broadcast channel.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::AdapterError;

/// Stable unique identifier for a physical device.
///
/// Used as the dedup key across discoveries, connection attempts and the
/// connected-device set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Power/authorization state of the radio as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Resetting,
    Unauthorized,
    Unsupported,
    Unknown,
}

/// Fields of one received advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// The local name of the advertising device, if broadcast.
    pub local_name: Option<String>,
    /// Service UUIDs carried in the advertisement.
    pub service_uuids: Vec<Uuid>,
    /// Raw vendor-specific data, if broadcast.
    pub manufacturer_data: Option<Vec<u8>>,
}

/// A discovered GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub primary: bool,
}

/// Capability flags of a discovered characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub notify: bool,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicProperties {
    pub fn is_readable(&self) -> bool {
        self.read
    }

    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// The write mode a send queue for this characteristic uses.
    ///
    /// Without-response is preferred when both are supported. `None` means
    /// the characteristic is not writable and gets no send queue.
    pub fn write_mode(&self) -> Option<WriteMode> {
        if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else if self.write {
            Some(WriteMode::WithResponse)
        } else {
            None
        }
    }
}

/// How a value is written to a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// A discovered characteristic within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub service: Uuid,
    pub properties: CharacteristicProperties,
}

/// One asynchronous callback from the platform adapter.
///
/// Each variant maps to exactly one internal handler in the session engine.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    StateChanged {
        state: AdapterState,
    },
    Discovered {
        device: DeviceId,
        advertisement: Advertisement,
        rssi: i16,
    },
    Connected {
        device: DeviceId,
    },
    ConnectFailed {
        device: DeviceId,
        error: Option<AdapterError>,
    },
    Disconnected {
        device: DeviceId,
        error: Option<AdapterError>,
    },
    ServicesDiscovered {
        device: DeviceId,
        result: Result<Vec<ServiceDescriptor>, AdapterError>,
    },
    CharacteristicsDiscovered {
        device: DeviceId,
        service: Uuid,
        result: Result<Vec<CharacteristicDescriptor>, AdapterError>,
    },
    /// The device can accept more write-without-response data.
    ReadyToWrite {
        device: DeviceId,
    },
    ValueUpdated {
        device: DeviceId,
        characteristic: Uuid,
        result: Result<Vec<u8>, AdapterError>,
    },
}

/// The platform BLE radio driver, central role.
///
/// Commands are fire-and-forget the way native radio APIs are: outcomes
/// arrive later as [`AdapterEvent`]s. The engine serializes all calls onto
/// one task, so implementations do not need to be reentrant.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current power/authorization state of the radio.
    fn state(&self) -> AdapterState;

    /// Subscribe to adapter callbacks.
    fn events(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Start scanning, optionally narrowed to devices advertising the given
    /// services. `allow_duplicates` controls whether repeat advertisements
    /// from an already-seen device are delivered.
    async fn start_scan(&self, service_filter: &[Uuid], allow_duplicates: bool);

    /// Stop an active scan.
    async fn stop_scan(&self);

    /// Initiate a connection. Resolves via `Connected` or `ConnectFailed`.
    async fn connect(&self, device: DeviceId);

    /// Cancel an active or pending connection. A connected device resolves
    /// via a `Disconnected` event.
    async fn cancel_connect(&self, device: DeviceId);

    /// Discover services, optionally narrowed to the given service UUIDs.
    async fn discover_services(&self, device: DeviceId, filter: Option<&[Uuid]>);

    /// Discover characteristics of a service, optionally narrowed.
    async fn discover_characteristics(&self, device: DeviceId, service: Uuid, filter: Option<&[Uuid]>);

    /// Enable or disable notifications for a characteristic.
    async fn set_notify(&self, device: DeviceId, characteristic: Uuid, enabled: bool);

    /// Request a characteristic read. The value arrives as `ValueUpdated`.
    async fn read_value(&self, device: DeviceId, characteristic: Uuid);

    /// Write one chunk to a characteristic.
    async fn write_value(&self, device: DeviceId, characteristic: Uuid, value: &[u8], mode: WriteMode);

    /// The largest payload one write to this device may carry.
    fn max_write_len(&self, device: DeviceId) -> usize;
}
