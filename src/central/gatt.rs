//! Per-device GATT session
//!
//! State machine that walks a connected device's service/characteristic
//! tree, arms notifications, and builds one send queue per writable
//! characteristic. Preparation either reaches Ready with the full
//! service map or fails as a whole; there is no partially-ready state.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::adapter::transport::{
    CharacteristicDescriptor, CharacteristicProperties, DeviceId, ServiceDescriptor,
};
use crate::adapter::AdapterError;
use crate::central::availability::{Availability, UnavailabilityReason};
use crate::central::send_queue::{Chunk, ChunkedSendQueue};

/// Errors from service preparation and characteristic I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Bluetooth is unavailable: {0}")]
    Unavailable(UnavailabilityReason),

    #[error("Device is not connected ({0})")]
    NotConnected(NotConnectedReason),

    #[error("Services have not been prepared")]
    NotPrepared,

    #[error("Service preparation is in progress")]
    Preparing,

    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),

    #[error("Discovery failed: {0}")]
    Discovery(AdapterError),

    #[error("The session engine has shut down")]
    Terminated,
}

/// Why a device counts as not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotConnectedReason {
    /// A connection attempt is still pending.
    Connecting,
    /// No connection exists.
    Disconnected,
}

impl fmt::Display for NotConnectedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotConnectedReason::Connecting => f.write_str("still connecting"),
            NotConnectedReason::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A service the caller cares about, with optional characteristic narrowing.
///
/// An empty interest set discovers everything; an interest with no
/// characteristic UUIDs discovers all characteristics of that service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInterest {
    pub service: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl ServiceInterest {
    pub fn new(service: Uuid) -> Self {
        Self {
            service,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristics(service: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            service,
            characteristics,
        }
    }

    fn service_filter(interest: &[ServiceInterest]) -> Option<Vec<Uuid>> {
        if interest.is_empty() {
            None
        } else {
            Some(interest.iter().map(|i| i.service).collect())
        }
    }

    fn characteristic_filter(interest: &[ServiceInterest], service: Uuid) -> Option<Vec<Uuid>> {
        let entry = interest.iter().find(|i| i.service == service)?;
        if entry.characteristics.is_empty() {
            None
        } else {
            Some(entry.characteristics.clone())
        }
    }
}

/// Discovered-capability record for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: HashMap<Uuid, CharacteristicInfo>,
}

/// Discovered-capability record for one characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Last value read from a readable characteristic.
    pub value: Option<Vec<u8>>,
}

/// Map of discovered services, delivered on readiness.
pub type ServiceMap = HashMap<Uuid, ServiceInfo>;

type PrepareReply = oneshot::Sender<Result<ServiceMap, GattError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    NotReady,
    Preparing,
    Ready,
    Failed(AdapterError),
}

/// Adapter work the coordinator performs after a preparation step.
pub(crate) struct PrepareStart {
    pub service_filter: Option<Vec<Uuid>>,
    /// Notifications left armed by a previous preparation to disable first.
    pub disable_notify: Vec<Uuid>,
}

pub(crate) enum ServicesOutcome {
    /// Not preparing; stale callback.
    Ignored,
    Failed {
        disable_notify: Vec<Uuid>,
    },
    /// Request characteristic discovery for each (service, filter) pair.
    Discover(Vec<(Uuid, Option<Vec<Uuid>>)>),
    /// The device had no matching services at all.
    NoServices,
}

pub(crate) enum CharacteristicsOutcome {
    Ignored,
    Failed {
        disable_notify: Vec<Uuid>,
    },
    /// More services still pending; arm these notifications.
    Progress {
        enable_notify: Vec<Uuid>,
    },
    /// This was the last pending service; arm, then resolve readiness.
    LastService {
        enable_notify: Vec<Uuid>,
    },
}

struct CharacteristicRecord {
    service: Uuid,
    properties: CharacteristicProperties,
}

/// The per-device GATT state machine. Owned by the connection pool's
/// connected-device entry; all calls happen on the coordinator loop.
pub(crate) struct GattSession {
    device: DeviceId,
    state: State,
    interest: Vec<ServiceInterest>,
    services: ServiceMap,
    characteristics: HashMap<Uuid, CharacteristicRecord>,
    queues: HashMap<Uuid, ChunkedSendQueue>,
    notifying: Vec<Uuid>,
    pending_services: Vec<Uuid>,
    responder: Option<PrepareReply>,
}

impl GattSession {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            state: State::NotReady,
            interest: Vec::new(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
            queues: HashMap::new(),
            notifying: Vec::new(),
            pending_services: Vec::new(),
            responder: None,
        }
    }

    /// Start preparation, or resolve the reply immediately on a
    /// precondition failure.
    pub fn begin_prepare(
        &mut self,
        interest: Vec<ServiceInterest>,
        availability: Availability,
        reply: PrepareReply,
    ) -> Option<PrepareStart> {
        if let Availability::Unavailable(reason) = availability {
            let _ = reply.send(Err(GattError::Unavailable(reason)));
            return None;
        }
        if self.state == State::Preparing {
            let _ = reply.send(Err(GattError::Preparing));
            return None;
        }
        let disable_notify = self.clear();
        self.state = State::Preparing;
        self.interest = interest;
        self.responder = Some(reply);
        Some(PrepareStart {
            service_filter: ServiceInterest::service_filter(&self.interest),
            disable_notify,
        })
    }

    pub fn handle_services_discovered(
        &mut self,
        result: Result<Vec<ServiceDescriptor>, AdapterError>,
    ) -> ServicesOutcome {
        if self.state != State::Preparing {
            return ServicesOutcome::Ignored;
        }
        let descriptors = match result {
            Ok(d) => d,
            Err(error) => {
                return ServicesOutcome::Failed {
                    disable_notify: self.fail(error),
                }
            }
        };
        if descriptors.is_empty() {
            return ServicesOutcome::NoServices;
        }

        let mut requests = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            self.services.insert(
                descriptor.uuid,
                ServiceInfo {
                    uuid: descriptor.uuid,
                    primary: descriptor.primary,
                    characteristics: HashMap::new(),
                },
            );
            self.pending_services.push(descriptor.uuid);
            requests.push((
                descriptor.uuid,
                ServiceInterest::characteristic_filter(&self.interest, descriptor.uuid),
            ));
        }
        ServicesOutcome::Discover(requests)
    }

    pub fn handle_characteristics_discovered(
        &mut self,
        service: Uuid,
        result: Result<Vec<CharacteristicDescriptor>, AdapterError>,
        max_write_len: usize,
    ) -> CharacteristicsOutcome {
        if self.state != State::Preparing {
            return CharacteristicsOutcome::Ignored;
        }
        let descriptors = match result {
            Ok(d) => d,
            Err(error) => {
                return CharacteristicsOutcome::Failed {
                    disable_notify: self.fail(error),
                }
            }
        };

        let mut enable_notify = Vec::new();
        for descriptor in descriptors {
            self.characteristics.insert(
                descriptor.uuid,
                CharacteristicRecord {
                    service,
                    properties: descriptor.properties,
                },
            );
            if let Some(info) = self.services.get_mut(&service) {
                info.characteristics.insert(
                    descriptor.uuid,
                    CharacteristicInfo {
                        uuid: descriptor.uuid,
                        properties: descriptor.properties,
                        value: None,
                    },
                );
            }
            if descriptor.properties.notify {
                self.notifying.push(descriptor.uuid);
                enable_notify.push(descriptor.uuid);
            }
            if let Some(mode) = descriptor.properties.write_mode() {
                self.queues.insert(
                    descriptor.uuid,
                    ChunkedSendQueue::new(descriptor.uuid, mode, max_write_len),
                );
            }
        }

        self.pending_services.retain(|s| *s != service);
        if self.pending_services.is_empty() {
            CharacteristicsOutcome::LastService { enable_notify }
        } else {
            CharacteristicsOutcome::Progress { enable_notify }
        }
    }

    /// Transition Preparing -> Ready and deliver the service map.
    pub fn resolve_ready(&mut self) {
        if self.state != State::Preparing {
            return;
        }
        self.state = State::Ready;
        log::debug!(
            "device {} ready with {} services",
            self.device,
            self.services.len()
        );
        if let Some(reply) = self.responder.take() {
            let _ = reply.send(Ok(self.services.clone()));
        }
    }

    /// Check read preconditions; the value arrives through the data stream.
    pub fn read(&self, characteristic: Uuid) -> Result<(), GattError> {
        self.validate_ready()?;
        if !self.characteristics.contains_key(&characteristic) {
            return Err(GattError::UnknownCharacteristic(characteristic));
        }
        Ok(())
    }

    /// Queue a payload on the characteristic's send queue. Returns the
    /// first chunk to write, if the queue was idle.
    pub fn write(&mut self, characteristic: Uuid, payload: Vec<u8>) -> Result<Option<Chunk>, GattError> {
        self.validate_ready()?;
        let queue = self
            .queues
            .get_mut(&characteristic)
            .ok_or(GattError::UnknownCharacteristic(characteristic))?;
        Ok(queue.enqueue(payload))
    }

    /// Resume every send queue after a ready-to-write signal.
    pub fn pump(&mut self) -> Vec<Chunk> {
        self.queues.values_mut().filter_map(|q| q.resume()).collect()
    }

    /// Cache the last value of a readable characteristic.
    pub fn handle_value(&mut self, characteristic: Uuid, value: &[u8]) {
        let record = match self.characteristics.get(&characteristic) {
            Some(r) if r.properties.read => r,
            _ => return,
        };
        if let Some(info) = self
            .services
            .get_mut(&record.service)
            .and_then(|s| s.characteristics.get_mut(&characteristic))
        {
            info.value = Some(value.to_vec());
        }
    }

    /// Tear down per-characteristic state. Fails while a preparation is
    /// still in flight; callers wait for it to resolve first.
    pub fn invalidate(&mut self) -> Result<Vec<Uuid>, GattError> {
        if self.state == State::Preparing {
            return Err(GattError::Preparing);
        }
        Ok(self.clear())
    }

    /// Forced teardown on disconnect or pool reset. A pending preparation
    /// resolves with the given error instead of hanging.
    pub fn abort(&mut self, error: GattError) -> Vec<Uuid> {
        if let Some(reply) = self.responder.take() {
            let _ = reply.send(Err(error));
        }
        self.clear()
    }

    fn validate_ready(&self) -> Result<(), GattError> {
        match &self.state {
            State::Ready => Ok(()),
            State::NotReady => Err(GattError::NotPrepared),
            State::Preparing => Err(GattError::Preparing),
            State::Failed(error) => Err(GattError::Discovery(error.clone())),
        }
    }

    /// Roll back all partial state after a discovery error.
    fn fail(&mut self, error: AdapterError) -> Vec<Uuid> {
        log::warn!("service preparation failed for {}: {}", self.device, error);
        let disable_notify = self.clear();
        self.state = State::Failed(error.clone());
        if let Some(reply) = self.responder.take() {
            let _ = reply.send(Err(GattError::Discovery(error)));
        }
        disable_notify
    }

    fn clear(&mut self) -> Vec<Uuid> {
        for queue in self.queues.values_mut() {
            queue.cancel_all();
        }
        self.queues.clear();
        self.services.clear();
        self.characteristics.clear();
        self.pending_services.clear();
        self.state = State::NotReady;
        std::mem::take(&mut self.notifying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(service: Uuid, properties: CharacteristicProperties) -> CharacteristicDescriptor {
        CharacteristicDescriptor {
            uuid: Uuid::new_v4(),
            service,
            properties,
        }
    }

    fn start_prepare(session: &mut GattSession) -> oneshot::Receiver<Result<ServiceMap, GattError>> {
        let (tx, rx) = oneshot::channel();
        let start = session.begin_prepare(Vec::new(), Availability::Available, tx);
        assert!(start.is_some());
        rx
    }

    #[tokio::test]
    async fn test_two_service_preparation_reaches_ready_after_last() {
        let mut session = GattSession::new(DeviceId::new());
        let mut reply = start_prepare(&mut session);

        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let outcome = session.handle_services_discovered(Ok(vec![
            ServiceDescriptor { uuid: s1, primary: true },
            ServiceDescriptor { uuid: s2, primary: false },
        ]));
        assert!(matches!(outcome, ServicesOutcome::Discover(ref r) if r.len() == 2));

        let writable = descriptor(
            s1,
            CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            },
        );
        match session.handle_characteristics_discovered(s1, Ok(vec![writable]), 20) {
            CharacteristicsOutcome::Progress { enable_notify } => assert!(enable_notify.is_empty()),
            _ => panic!("first service is not the last"),
        }
        assert!(reply.try_recv().is_err(), "not ready until the last service");

        let notifiable = descriptor(
            s2,
            CharacteristicProperties {
                notify: true,
                read: true,
                ..Default::default()
            },
        );
        match session.handle_characteristics_discovered(s2, Ok(vec![notifiable]), 20) {
            CharacteristicsOutcome::LastService { enable_notify } => assert_eq!(enable_notify.len(), 1),
            _ => panic!("second service completes preparation"),
        }
        session.resolve_ready();

        let map = reply.await.unwrap().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&s1].characteristics.len(), 1);
        assert!(session.write(writable.uuid, vec![1]).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_failure_rolls_back_everything() {
        let mut session = GattSession::new(DeviceId::new());
        let reply = start_prepare(&mut session);

        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        session
            .handle_services_discovered(Ok(vec![
                ServiceDescriptor { uuid: s1, primary: true },
                ServiceDescriptor { uuid: s2, primary: true },
            ]));

        let notifiable = descriptor(
            s1,
            CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        );
        session.handle_characteristics_discovered(s1, Ok(vec![notifiable]), 20);

        match session.handle_characteristics_discovered(
            s2,
            Err(AdapterError::Other("boom".into())),
            20,
        ) {
            CharacteristicsOutcome::Failed { disable_notify } => {
                // The notification armed for the first service is torn down.
                assert_eq!(disable_notify, vec![notifiable.uuid]);
            }
            _ => panic!("expected failure"),
        }

        assert_eq!(
            reply.await.unwrap(),
            Err(GattError::Discovery(AdapterError::Other("boom".into())))
        );
        // No characteristic info for either service is retained.
        assert!(session.services.is_empty());
        assert!(session.characteristics.is_empty());
        assert_eq!(
            session.read(notifiable.uuid),
            Err(GattError::Discovery(AdapterError::Other("boom".into())))
        );
    }

    #[tokio::test]
    async fn test_io_preconditions() {
        let mut session = GattSession::new(DeviceId::new());
        assert_eq!(session.read(Uuid::new_v4()), Err(GattError::NotPrepared));

        let _reply = start_prepare(&mut session);
        assert_eq!(session.read(Uuid::new_v4()), Err(GattError::Preparing));
        assert_eq!(session.invalidate(), Err(GattError::Preparing));

        // A second prepare while the first is pending is rejected.
        let (tx, rx) = oneshot::channel();
        assert!(session
            .begin_prepare(Vec::new(), Availability::Available, tx)
            .is_none());
        assert_eq!(rx.await.unwrap(), Err(GattError::Preparing));
    }

    #[tokio::test]
    async fn test_unknown_characteristic() {
        let mut session = GattSession::new(DeviceId::new());
        let mut reply = start_prepare(&mut session);
        let s1 = Uuid::new_v4();
        session.handle_services_discovered(Ok(vec![ServiceDescriptor {
            uuid: s1,
            primary: true,
        }]));
        let readonly = descriptor(
            s1,
            CharacteristicProperties {
                read: true,
                ..Default::default()
            },
        );
        session.handle_characteristics_discovered(s1, Ok(vec![readonly]), 20);
        session.resolve_ready();
        reply.try_recv().unwrap().unwrap();

        let unknown = Uuid::new_v4();
        assert_eq!(
            session.write(unknown, vec![1]),
            Err(GattError::UnknownCharacteristic(unknown))
        );
        // A readable characteristic without write flags has no send queue.
        assert_eq!(
            session.write(readonly.uuid, vec![1]),
            Err(GattError::UnknownCharacteristic(readonly.uuid))
        );
        assert!(session.read(readonly.uuid).is_ok());
    }

    #[tokio::test]
    async fn test_abort_resolves_pending_prepare() {
        let mut session = GattSession::new(DeviceId::new());
        let reply = start_prepare(&mut session);
        session.abort(GattError::NotConnected(NotConnectedReason::Disconnected));
        assert_eq!(
            reply.await.unwrap(),
            Err(GattError::NotConnected(NotConnectedReason::Disconnected))
        );
        // Back to NotReady: teardown is allowed again.
        assert!(session.invalidate().is_ok());
    }

    #[test]
    fn test_value_caching_for_readable_characteristics() {
        let mut session = GattSession::new(DeviceId::new());
        let (tx, _rx) = oneshot::channel();
        session.begin_prepare(Vec::new(), Availability::Available, tx);
        let s1 = Uuid::new_v4();
        session.handle_services_discovered(Ok(vec![ServiceDescriptor {
            uuid: s1,
            primary: true,
        }]));
        let readable = descriptor(
            s1,
            CharacteristicProperties {
                read: true,
                ..Default::default()
            },
        );
        session.handle_characteristics_discovered(s1, Ok(vec![readable]), 20);
        session.resolve_ready();

        session.handle_value(readable.uuid, &[7, 8]);
        let info = &session.services[&s1].characteristics[&readable.uuid];
        assert_eq!(info.value.as_deref(), Some(&[7u8, 8][..]));
    }

    #[test]
    fn test_interest_filters() {
        let s = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_eq!(ServiceInterest::service_filter(&[]), None);
        let interest = vec![ServiceInterest::with_characteristics(s, vec![c])];
        assert_eq!(ServiceInterest::service_filter(&interest), Some(vec![s]));
        assert_eq!(
            ServiceInterest::characteristic_filter(&interest, s),
            Some(vec![c])
        );
        assert_eq!(ServiceInterest::characteristic_filter(&interest, Uuid::new_v4()), None);
        let broad = vec![ServiceInterest::new(s)];
        assert_eq!(ServiceInterest::characteristic_filter(&broad, s), None);
    }
}
