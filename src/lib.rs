// bluecentral - Central-role BLE session engine

pub mod adapter;
pub mod central;

pub use adapter::transport::{
    Advertisement, AdapterEvent, AdapterState, BleAdapter, CharacteristicDescriptor,
    CharacteristicProperties, DeviceId, ServiceDescriptor, WriteMode,
};
pub use adapter::AdapterError;
pub use central::availability::{Availability, UnavailabilityReason};
pub use central::gatt::{
    CharacteristicInfo, GattError, NotConnectedReason, ServiceInfo, ServiceInterest, ServiceMap,
};
pub use central::pool::ConnectionError;
pub use central::scanner::{Discovery, DiscoveryChange, ScanError, ScanFilter, ScanMode};
pub use central::{
    CentralManager, Disconnection, ReceivedData, ScanHandle, DEFAULT_CONNECT_TIMEOUT,
};
