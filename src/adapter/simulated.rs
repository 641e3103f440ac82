//! In-process simulated adapter
//!
//! A scriptable [`BleAdapter`] used for integration testing without radio
//! hardware: peers are registered with a GATT tree and a connect behavior,
//! tests inject advertisements, disconnects and flow-control signals, and
//! every command the engine issues is recorded for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::transport::{
    Advertisement, AdapterEvent, AdapterState, BleAdapter, CharacteristicDescriptor,
    CharacteristicProperties, DeviceId, ServiceDescriptor, WriteMode,
};
use super::AdapterError;

/// How a simulated peer responds to a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Resolve with a `Connected` event.
    Succeed,
    /// Resolve with a `ConnectFailed` event carrying this error.
    Fail(Option<AdapterError>),
    /// Never resolve; only a timeout or cancel releases the attempt.
    Hang,
}

/// A characteristic hosted by a simulated peer.
#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Vec<u8>,
}

/// A service hosted by a simulated peer.
#[derive(Debug, Clone)]
pub struct SimService {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<SimCharacteristic>,
    /// Makes characteristic discovery for this service fail.
    pub discovery_error: Option<AdapterError>,
}

impl SimService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
            discovery_error: None,
        }
    }
}

/// A scriptable remote device on the simulated radio.
#[derive(Debug, Clone)]
pub struct SimPeer {
    pub id: DeviceId,
    pub advertisement: Advertisement,
    pub rssi: i16,
    pub connect_behavior: ConnectBehavior,
    pub max_write_len: usize,
    pub services: Vec<SimService>,
    /// Makes service discovery fail.
    pub discovery_error: Option<AdapterError>,
}

impl SimPeer {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            advertisement: Advertisement::default(),
            rssi: -60,
            connect_behavior: ConnectBehavior::Succeed,
            max_write_len: 20,
            services: Vec::new(),
            discovery_error: None,
        }
    }
}

/// One adapter command as recorded by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    StartScan {
        service_filter: Vec<Uuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(DeviceId),
    CancelConnect(DeviceId),
    DiscoverServices {
        device: DeviceId,
        filter: Option<Vec<Uuid>>,
    },
    DiscoverCharacteristics {
        device: DeviceId,
        service: Uuid,
        filter: Option<Vec<Uuid>>,
    },
    SetNotify {
        device: DeviceId,
        characteristic: Uuid,
        enabled: bool,
    },
    ReadValue {
        device: DeviceId,
        characteristic: Uuid,
    },
    Write {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    },
}

struct ScanState {
    service_filter: Vec<Uuid>,
    allow_duplicates: bool,
    seen: HashSet<DeviceId>,
}

/// The simulated radio.
pub struct SimAdapter {
    state: Mutex<AdapterState>,
    peers: Mutex<HashMap<DeviceId, SimPeer>>,
    scan: Mutex<Option<ScanState>>,
    connected: Mutex<HashSet<DeviceId>>,
    pending: Mutex<HashSet<DeviceId>>,
    calls: Mutex<Vec<SimCall>>,
    event_tx: broadcast::Sender<AdapterEvent>,
}

impl SimAdapter {
    /// Create a simulator in the given initial state.
    pub fn new(state: AdapterState) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(state),
            peers: Mutex::new(HashMap::new()),
            scan: Mutex::new(None),
            connected: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            event_tx,
        }
    }

    /// Register a peer on the simulated radio.
    pub fn add_peer(&self, peer: SimPeer) {
        self.peers.lock().unwrap().insert(peer.id, peer);
    }

    /// Change the radio state and emit a state-change event.
    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock().unwrap() = state;
        self.emit(AdapterEvent::StateChanged { state });
    }

    /// Deliver one advertisement from a registered peer, honoring the
    /// active scan's service filter and duplicate suppression.
    pub fn advertise(&self, device: DeviceId) {
        let peer = match self.peers.lock().unwrap().get(&device) {
            Some(p) => p.clone(),
            None => return,
        };
        let deliver = {
            let mut scan = self.scan.lock().unwrap();
            match scan.as_mut() {
                Some(s) => {
                    let matches = s.service_filter.is_empty()
                        || peer
                            .advertisement
                            .service_uuids
                            .iter()
                            .any(|u| s.service_filter.contains(u));
                    matches && (s.allow_duplicates || s.seen.insert(device))
                }
                None => false,
            }
        };
        if deliver {
            self.emit(AdapterEvent::Discovered {
                device,
                advertisement: peer.advertisement,
                rssi: peer.rssi,
            });
        }
    }

    /// Resolve a hanging connect attempt as if the platform finished it,
    /// emitting a Connected event. The caller decides when this lands, so
    /// it can arrive after the issuing side has already given up.
    pub fn complete_connect(&self, device: DeviceId) {
        self.pending.lock().unwrap().remove(&device);
        self.connected.lock().unwrap().insert(device);
        self.emit(AdapterEvent::Connected { device });
    }

    /// Inject a remote-initiated disconnect.
    pub fn disconnect_peer(&self, device: DeviceId, error: Option<AdapterError>) {
        if self.connected.lock().unwrap().remove(&device) {
            self.emit(AdapterEvent::Disconnected { device, error });
        }
    }

    /// Signal that the device can accept more write data.
    pub fn ready_to_write(&self, device: DeviceId) {
        self.emit(AdapterEvent::ReadyToWrite { device });
    }

    /// Inject a notification-style value update from a peer.
    pub fn notify_value(&self, device: DeviceId, characteristic: Uuid, value: Vec<u8>) {
        self.emit(AdapterEvent::ValueUpdated {
            device,
            characteristic,
            result: Ok(value),
        });
    }

    /// Whether the simulator considers the device connected.
    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.connected.lock().unwrap().contains(&device)
    }

    /// All commands issued so far, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().unwrap().clone()
    }

    /// All chunks written to a characteristic, in order.
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<(Vec<u8>, WriteMode)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SimCall::Write {
                    characteristic: ch,
                    value,
                    mode,
                    ..
                } if *ch == characteristic => Some((value.clone(), *mode)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SimCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit(&self, event: AdapterEvent) {
        // No subscribers yet is fine; tests may poke the simulator early.
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl BleAdapter for SimAdapter {
    fn state(&self) -> AdapterState {
        *self.state.lock().unwrap()
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.event_tx.subscribe()
    }

    async fn start_scan(&self, service_filter: &[Uuid], allow_duplicates: bool) {
        self.record(SimCall::StartScan {
            service_filter: service_filter.to_vec(),
            allow_duplicates,
        });
        *self.scan.lock().unwrap() = Some(ScanState {
            service_filter: service_filter.to_vec(),
            allow_duplicates,
            seen: HashSet::new(),
        });
    }

    async fn stop_scan(&self) {
        self.record(SimCall::StopScan);
        *self.scan.lock().unwrap() = None;
    }

    async fn connect(&self, device: DeviceId) {
        self.record(SimCall::Connect(device));
        let behavior = self
            .peers
            .lock()
            .unwrap()
            .get(&device)
            .map(|p| p.connect_behavior.clone());
        match behavior {
            Some(ConnectBehavior::Succeed) => {
                self.connected.lock().unwrap().insert(device);
                self.emit(AdapterEvent::Connected { device });
            }
            Some(ConnectBehavior::Fail(error)) => {
                self.emit(AdapterEvent::ConnectFailed { device, error });
            }
            Some(ConnectBehavior::Hang) => {
                self.pending.lock().unwrap().insert(device);
            }
            None => {
                self.emit(AdapterEvent::ConnectFailed {
                    device,
                    error: Some(AdapterError::UnknownDevice),
                });
            }
        }
    }

    async fn cancel_connect(&self, device: DeviceId) {
        self.record(SimCall::CancelConnect(device));
        self.pending.lock().unwrap().remove(&device);
        if self.connected.lock().unwrap().remove(&device) {
            self.emit(AdapterEvent::Disconnected {
                device,
                error: None,
            });
        }
    }

    async fn discover_services(&self, device: DeviceId, filter: Option<&[Uuid]>) {
        self.record(SimCall::DiscoverServices {
            device,
            filter: filter.map(|f| f.to_vec()),
        });
        let peer = match self.peers.lock().unwrap().get(&device) {
            Some(p) => p.clone(),
            None => {
                self.emit(AdapterEvent::ServicesDiscovered {
                    device,
                    result: Err(AdapterError::UnknownDevice),
                });
                return;
            }
        };
        let result = match peer.discovery_error {
            Some(e) => Err(e),
            None => Ok(peer
                .services
                .iter()
                .filter(|s| filter.map_or(true, |f| f.contains(&s.uuid)))
                .map(|s| ServiceDescriptor {
                    uuid: s.uuid,
                    primary: s.primary,
                })
                .collect()),
        };
        self.emit(AdapterEvent::ServicesDiscovered { device, result });
    }

    async fn discover_characteristics(&self, device: DeviceId, service: Uuid, filter: Option<&[Uuid]>) {
        self.record(SimCall::DiscoverCharacteristics {
            device,
            service,
            filter: filter.map(|f| f.to_vec()),
        });
        let peer = match self.peers.lock().unwrap().get(&device) {
            Some(p) => p.clone(),
            None => return,
        };
        let result = match peer.services.iter().find(|s| s.uuid == service) {
            Some(s) => match &s.discovery_error {
                Some(e) => Err(e.clone()),
                None => Ok(s
                    .characteristics
                    .iter()
                    .filter(|c| filter.map_or(true, |f| f.contains(&c.uuid)))
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        service,
                        properties: c.properties,
                    })
                    .collect()),
            },
            None => Err(AdapterError::UnknownAttribute),
        };
        self.emit(AdapterEvent::CharacteristicsDiscovered {
            device,
            service,
            result,
        });
    }

    async fn set_notify(&self, device: DeviceId, characteristic: Uuid, enabled: bool) {
        self.record(SimCall::SetNotify {
            device,
            characteristic,
            enabled,
        });
    }

    async fn read_value(&self, device: DeviceId, characteristic: Uuid) {
        self.record(SimCall::ReadValue {
            device,
            characteristic,
        });
        let value = self.peers.lock().unwrap().get(&device).and_then(|p| {
            p.services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .find(|c| c.uuid == characteristic)
                .map(|c| c.value.clone())
        });
        let result = value.ok_or(AdapterError::UnknownAttribute);
        self.emit(AdapterEvent::ValueUpdated {
            device,
            characteristic,
            result,
        });
    }

    async fn write_value(&self, device: DeviceId, characteristic: Uuid, value: &[u8], mode: WriteMode) {
        self.record(SimCall::Write {
            device,
            characteristic,
            value: value.to_vec(),
            mode,
        });
    }

    fn max_write_len(&self, device: DeviceId) -> usize {
        self.peers
            .lock()
            .unwrap()
            .get(&device)
            .map(|p| p.max_write_len)
            .unwrap_or(20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writable_peer(id: DeviceId) -> SimPeer {
        let mut service = SimService::new(Uuid::new_v4());
        service.characteristics.push(SimCharacteristic {
            uuid: Uuid::new_v4(),
            properties: CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            },
            value: Vec::new(),
        });
        let mut peer = SimPeer::new(id);
        peer.services.push(service);
        peer
    }

    #[tokio::test]
    async fn test_duplicate_suppression() {
        let adapter = SimAdapter::new(AdapterState::PoweredOn);
        let id = DeviceId::new();
        adapter.add_peer(SimPeer::new(id));

        let mut events = adapter.events();
        adapter.start_scan(&[], false).await;
        adapter.advertise(id);
        adapter.advertise(id);

        assert!(matches!(
            events.recv().await.unwrap(),
            AdapterEvent::Discovered { device, .. } if device == id
        ));
        assert!(events.try_recv().is_err(), "repeat advertisement suppressed");
    }

    #[tokio::test]
    async fn test_duplicates_delivered_when_allowed() {
        let adapter = SimAdapter::new(AdapterState::PoweredOn);
        let id = DeviceId::new();
        adapter.add_peer(SimPeer::new(id));

        let mut events = adapter.events();
        adapter.start_scan(&[], true).await;
        adapter.advertise(id);
        adapter.advertise(id);

        assert!(matches!(events.recv().await.unwrap(), AdapterEvent::Discovered { .. }));
        assert!(matches!(events.recv().await.unwrap(), AdapterEvent::Discovered { .. }));
    }

    #[tokio::test]
    async fn test_service_filter_narrows_scan() {
        let adapter = SimAdapter::new(AdapterState::PoweredOn);
        let wanted = Uuid::new_v4();
        let matching = DeviceId::new();
        let other = DeviceId::new();

        let mut peer = SimPeer::new(matching);
        peer.advertisement.service_uuids = vec![wanted];
        adapter.add_peer(peer);
        adapter.add_peer(SimPeer::new(other));

        let mut events = adapter.events();
        adapter.start_scan(&[wanted], false).await;
        adapter.advertise(other);
        adapter.advertise(matching);

        assert!(matches!(
            events.recv().await.unwrap(),
            AdapterEvent::Discovered { device, .. } if device == matching
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_behaviors() {
        let adapter = SimAdapter::new(AdapterState::PoweredOn);
        let ok = DeviceId::new();
        let bad = DeviceId::new();
        let hang = DeviceId::new();
        adapter.add_peer(SimPeer::new(ok));
        let mut failing = SimPeer::new(bad);
        failing.connect_behavior = ConnectBehavior::Fail(None);
        adapter.add_peer(failing);
        let mut hanging = SimPeer::new(hang);
        hanging.connect_behavior = ConnectBehavior::Hang;
        adapter.add_peer(hanging);

        let mut events = adapter.events();
        adapter.connect(ok).await;
        adapter.connect(bad).await;
        adapter.connect(hang).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            AdapterEvent::Connected { device } if device == ok
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            AdapterEvent::ConnectFailed { device, error: None } if device == bad
        ));
        assert!(events.try_recv().is_err(), "hanging connect emits nothing");
        assert!(adapter.is_connected(ok));
    }

    #[tokio::test]
    async fn test_write_recording() {
        let adapter = SimAdapter::new(AdapterState::PoweredOn);
        let id = DeviceId::new();
        let peer = writable_peer(id);
        let characteristic = peer.services[0].characteristics[0].uuid;
        adapter.add_peer(peer);

        adapter
            .write_value(id, characteristic, &[1, 2, 3], WriteMode::WithoutResponse)
            .await;
        adapter
            .write_value(id, characteristic, &[4], WriteMode::WithoutResponse)
            .await;

        let writes = adapter.writes_to(characteristic);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, vec![1, 2, 3]);
        assert_eq!(writes[1].0, vec![4]);
    }
}
