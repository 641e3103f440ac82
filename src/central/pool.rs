//! Connection pool
//!
//! Tracks in-flight connection attempts and established connections.
//! Each attempt carries a monotonically increasing id so a late timeout
//! message for an attempt that already resolved is discarded instead of
//! failing a newer attempt to the same device.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::adapter::transport::DeviceId;
use crate::adapter::AdapterError;
use crate::central::availability::{Availability, UnavailabilityReason};
use crate::central::gatt::GattSession;

/// Errors from connect and disconnect requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Bluetooth is unavailable: {0}")]
    Unavailable(UnavailabilityReason),

    #[error("Device is already connected")]
    AlreadyConnected,

    #[error("A connection attempt to this device is already in progress")]
    Connecting,

    #[error("The connection attempt timed out")]
    Timeout,

    #[error("The connection attempt was cancelled")]
    Cancelled,

    #[error("Device is not connected")]
    NotConnected,

    #[error("The adapter failed to connect: {0}")]
    Failed(AdapterError),

    #[error("The session engine has shut down")]
    Terminated,
}

type ConnectReply = oneshot::Sender<Result<(), ConnectionError>>;

struct Attempt {
    id: u64,
    reply: ConnectReply,
}

/// One established connection and its GATT session.
pub(crate) struct ConnectedDevice {
    pub session: GattSession,
}

pub(crate) struct ConnectionPool {
    attempts: HashMap<DeviceId, Attempt>,
    connected: HashMap<DeviceId, ConnectedDevice>,
    next_attempt: u64,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            attempts: HashMap::new(),
            connected: HashMap::new(),
            next_attempt: 0,
        }
    }

    /// Register a new attempt, or resolve the reply immediately on a
    /// precondition failure. Returns the attempt id for the timeout timer.
    pub fn register(
        &mut self,
        device: DeviceId,
        availability: Availability,
        reply: ConnectReply,
    ) -> Option<u64> {
        if self.connected.contains_key(&device) {
            let _ = reply.send(Err(ConnectionError::AlreadyConnected));
            return None;
        }
        if self.attempts.contains_key(&device) {
            let _ = reply.send(Err(ConnectionError::Connecting));
            return None;
        }
        if let Availability::Unavailable(reason) = availability {
            let _ = reply.send(Err(ConnectionError::Unavailable(reason)));
            return None;
        }
        self.next_attempt += 1;
        let id = self.next_attempt;
        self.attempts.insert(device, Attempt { id, reply });
        Some(id)
    }

    /// Resolve a successful attempt and open a GATT session.
    pub fn handle_connected(&mut self, device: DeviceId) -> bool {
        let attempt = match self.attempts.remove(&device) {
            Some(a) => a,
            None => return false,
        };
        self.connected.insert(
            device,
            ConnectedDevice {
                session: GattSession::new(device),
            },
        );
        let _ = attempt.reply.send(Ok(()));
        true
    }

    pub fn handle_connect_failed(&mut self, device: DeviceId, error: Option<AdapterError>) {
        if let Some(attempt) = self.attempts.remove(&device) {
            let error = error.unwrap_or(AdapterError::Unknown);
            log::warn!("connection to {} failed: {}", device, error);
            let _ = attempt.reply.send(Err(ConnectionError::Failed(error)));
        }
    }

    /// Fail the attempt the timer was armed for. A stale id is a no-op;
    /// returns true when the caller should cancel the platform attempt.
    pub fn handle_timeout(&mut self, device: DeviceId, attempt_id: u64) -> bool {
        let stale = self
            .attempts
            .get(&device)
            .map_or(true, |attempt| attempt.id != attempt_id);
        if stale {
            return false;
        }
        if let Some(attempt) = self.attempts.remove(&device) {
            log::warn!("connection to {} timed out", device);
            let _ = attempt.reply.send(Err(ConnectionError::Timeout));
        }
        true
    }

    /// Remove an established connection, handing its session back for
    /// teardown. Returns None for devices this pool never connected.
    pub fn handle_disconnected(&mut self, device: DeviceId) -> Option<ConnectedDevice> {
        self.connected.remove(&device)
    }

    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.connected.contains_key(&device)
    }

    pub fn has_attempt(&self, device: DeviceId) -> bool {
        self.attempts.contains_key(&device)
    }

    pub fn session_mut(&mut self, device: DeviceId) -> Option<&mut GattSession> {
        self.connected.get_mut(&device).map(|c| &mut c.session)
    }

    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.connected.keys().copied().collect()
    }

    /// Fail every pending attempt with Cancelled and drain all established
    /// connections. Used when the radio becomes unavailable.
    pub fn reset(&mut self) -> (Vec<DeviceId>, Vec<(DeviceId, ConnectedDevice)>) {
        let pending: Vec<DeviceId> = self.attempts.keys().copied().collect();
        for (_, attempt) in self.attempts.drain() {
            let _ = attempt.reply.send(Err(ConnectionError::Cancelled));
        }
        let dropped = self.connected.drain().collect();
        (pending, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_attempts_rejected_synchronously() {
        let mut pool = ConnectionPool::new();
        let device = DeviceId::new();

        let (tx, _rx) = oneshot::channel();
        assert!(pool.register(device, Availability::Available, tx).is_some());

        let (tx, rx) = oneshot::channel();
        assert!(pool.register(device, Availability::Available, tx).is_none());
        assert_eq!(rx.await.unwrap(), Err(ConnectionError::Connecting));

        pool.handle_connected(device);
        let (tx, rx) = oneshot::channel();
        assert!(pool.register(device, Availability::Available, tx).is_none());
        assert_eq!(rx.await.unwrap(), Err(ConnectionError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_unavailable_rejected_before_registering() {
        let mut pool = ConnectionPool::new();
        let (tx, rx) = oneshot::channel();
        let availability = Availability::Unavailable(UnavailabilityReason::PoweredOff);
        assert!(pool.register(DeviceId::new(), availability, tx).is_none());
        assert_eq!(
            rx.await.unwrap(),
            Err(ConnectionError::Unavailable(UnavailabilityReason::PoweredOff))
        );
    }

    #[tokio::test]
    async fn test_stale_timeout_is_discarded() {
        let mut pool = ConnectionPool::new();
        let device = DeviceId::new();

        let (tx, rx) = oneshot::channel();
        let first = pool.register(device, Availability::Available, tx).unwrap();
        pool.handle_connect_failed(device, None);
        assert_eq!(
            rx.await.unwrap(),
            Err(ConnectionError::Failed(AdapterError::Unknown))
        );

        // A second attempt to the same device gets a fresh id; the first
        // attempt's timer must not touch it.
        let (tx, mut rx) = oneshot::channel();
        let second = pool.register(device, Availability::Available, tx).unwrap();
        assert_ne!(first, second);
        assert!(!pool.handle_timeout(device, first));
        assert!(rx.try_recv().is_err());

        assert!(pool.handle_timeout(device, second));
        assert_eq!(rx.try_recv().unwrap(), Err(ConnectionError::Timeout));
        assert!(!pool.has_attempt(device));

        // A platform callback arriving after the timeout lands on no one.
        assert!(!pool.handle_connected(device));
        assert!(!pool.is_connected(device));
    }

    #[tokio::test]
    async fn test_reset_cancels_attempts_and_drains_connections() {
        let mut pool = ConnectionPool::new();
        let pending = DeviceId::new();
        let established = DeviceId::new();

        let (tx, pending_rx) = oneshot::channel();
        pool.register(pending, Availability::Available, tx).unwrap();

        let (tx, established_rx) = oneshot::channel();
        pool.register(established, Availability::Available, tx).unwrap();
        pool.handle_connected(established);
        assert_eq!(established_rx.await.unwrap(), Ok(()));
        assert!(pool.is_connected(established));

        let (cancelled, dropped) = pool.reset();
        assert_eq!(cancelled, vec![pending]);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, established);
        assert_eq!(pending_rx.await.unwrap(), Err(ConnectionError::Cancelled));
        assert!(pool.connected_ids().is_empty());
    }

    #[test]
    fn test_disconnect_of_unknown_device_yields_nothing() {
        let mut pool = ConnectionPool::new();
        assert!(pool.handle_disconnected(DeviceId::new()).is_none());
    }
}
