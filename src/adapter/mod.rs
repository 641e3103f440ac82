//! Platform BLE adapter boundary
//!
//! Defines the abstract adapter interface the session engine drives, the
//! event type adapters deliver callbacks through, and an in-process
//! simulated adapter for testing without radio hardware.

pub mod simulated;
pub mod transport;

use thiserror::Error;

/// Errors reported by a platform adapter through events or command calls.
///
/// Cloneable so events carrying a failure can fan out on broadcast channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Adapter is not powered on")]
    NotPoweredOn,

    #[error("Device is not connected")]
    NotConnected,

    #[error("Unknown device")]
    UnknownDevice,

    #[error("Unknown attribute")]
    UnknownAttribute,

    #[error("Adapter error: {0}")]
    Other(String),

    #[error("Unknown adapter error")]
    Unknown,
}
