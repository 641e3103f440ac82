//! Radio availability
//!
//! Two-valued availability derived from the adapter's power/authorization
//! state. The coordinator owns the current value behind a lock and pushes
//! changes to subscribers; everything downstream receives it by value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapter::transport::AdapterState;

/// Whether the radio can be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Available,
    Unavailable(UnavailabilityReason),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }
}

impl From<AdapterState> for Availability {
    fn from(state: AdapterState) -> Self {
        match state {
            AdapterState::PoweredOn => Availability::Available,
            other => Availability::Unavailable(UnavailabilityReason::from(other)),
        }
    }
}

/// Why the radio cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailabilityReason {
    /// Bluetooth is turned off.
    PoweredOff,
    /// The radio stack is resetting.
    Resetting,
    /// The application is not authorized to use Bluetooth.
    Unauthorized,
    /// Bluetooth LE is not supported on this hardware.
    Unsupported,
    /// Transient state before the adapter reports a definite one.
    Unknown,
}

impl From<AdapterState> for UnavailabilityReason {
    fn from(state: AdapterState) -> Self {
        match state {
            AdapterState::PoweredOff => UnavailabilityReason::PoweredOff,
            AdapterState::Resetting => UnavailabilityReason::Resetting,
            AdapterState::Unauthorized => UnavailabilityReason::Unauthorized,
            AdapterState::Unsupported => UnavailabilityReason::Unsupported,
            // PoweredOn never reaches here; map it with the transient states.
            AdapterState::Unknown | AdapterState::PoweredOn => UnavailabilityReason::Unknown,
        }
    }
}

impl fmt::Display for UnavailabilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnavailabilityReason::PoweredOff => "bluetooth is powered off",
            UnavailabilityReason::Resetting => "bluetooth is resetting",
            UnavailabilityReason::Unauthorized => "bluetooth access is not authorized",
            UnavailabilityReason::Unsupported => "bluetooth le is not supported",
            UnavailabilityReason::Unknown => "bluetooth state is not known yet",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_from_state() {
        assert_eq!(
            Availability::from(AdapterState::PoweredOn),
            Availability::Available
        );
        assert_eq!(
            Availability::from(AdapterState::PoweredOff),
            Availability::Unavailable(UnavailabilityReason::PoweredOff)
        );
        assert_eq!(
            Availability::from(AdapterState::Unauthorized),
            Availability::Unavailable(UnavailabilityReason::Unauthorized)
        );
        assert!(!Availability::from(AdapterState::Resetting).is_available());
    }
}
