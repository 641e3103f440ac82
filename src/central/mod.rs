//! Central-role session engine
//!
//! [`CentralManager`] is the public handle. All state lives in a single
//! event-loop task that owns the scanner, the connection pool, and the
//! per-device GATT sessions, and reacts to two inputs: commands from the
//! handle and events from the adapter. Timers never mutate state
//! directly; they post a message back into the command channel carrying
//! the generation or attempt id they were armed for, and the loop drops
//! the message if that work already resolved.

pub mod availability;
pub mod gatt;
pub mod pool;
pub mod scanner;
pub mod send_queue;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::adapter::transport::{AdapterEvent, BleAdapter, DeviceId};
use crate::adapter::AdapterError;
use availability::Availability;
use gatt::{
    CharacteristicsOutcome, GattError, NotConnectedReason, ServiceInterest, ServiceMap,
    ServicesOutcome,
};
use pool::{ConnectionError, ConnectionPool};
use scanner::{Discovery, DiscoveryChange, ScanError, ScanFilter, ScanMode, Scanner};

/// Timeout applied to connection attempts when the caller passes none.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A value received from a device, by notification or by an explicit read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    pub device: DeviceId,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// A connection that ended, with the platform error if it was unexpected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnection {
    pub device: DeviceId,
    pub error: Option<AdapterError>,
}

/// Caller-facing side of a running scan: live discovery changes plus the
/// final discovery list once the scan ends.
pub struct ScanHandle {
    changes: mpsc::UnboundedReceiver<DiscoveryChange>,
    completion: oneshot::Receiver<Vec<Discovery>>,
}

impl ScanHandle {
    /// Next discovery change, or `None` once the scan has ended.
    pub async fn next_change(&mut self) -> Option<DiscoveryChange> {
        self.changes.recv().await
    }

    /// Wait for the scan to end and take the final discovery list.
    pub async fn wait(self) -> Result<Vec<Discovery>, ScanError> {
        self.completion.await.map_err(|_| ScanError::Terminated)
    }
}

type ScanReply = oneshot::Sender<
    Result<
        (
            mpsc::UnboundedReceiver<DiscoveryChange>,
            oneshot::Receiver<Vec<Discovery>>,
        ),
        ScanError,
    >,
>;

enum Command {
    StartScan {
        filter: ScanFilter,
        mode: ScanMode,
        reply: ScanReply,
    },
    StopScan {
        reply: oneshot::Sender<()>,
    },
    Connect {
        device: DeviceId,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        device: DeviceId,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    ConnectedDevices {
        reply: oneshot::Sender<Vec<DeviceId>>,
    },
    PrepareServices {
        device: DeviceId,
        interest: Vec<ServiceInterest>,
        reply: oneshot::Sender<Result<ServiceMap, GattError>>,
    },
    ReadCharacteristic {
        device: DeviceId,
        characteristic: Uuid,
        reply: oneshot::Sender<Result<(), GattError>>,
    },
    WriteCharacteristic {
        device: DeviceId,
        characteristic: Uuid,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), GattError>>,
    },
    InvalidateServices {
        device: DeviceId,
        reply: oneshot::Sender<Result<(), GattError>>,
    },
    ScanTimerFired {
        generation: u64,
    },
    ConnectTimerFired {
        device: DeviceId,
        attempt: u64,
    },
    Shutdown,
}

/// Handle to the central session engine.
pub struct CentralManager {
    commands: mpsc::UnboundedSender<Command>,
    availability: Arc<RwLock<Availability>>,
    availability_tx: broadcast::Sender<Availability>,
    disconnect_tx: broadcast::Sender<Disconnection>,
    data_tx: broadcast::Sender<ReceivedData>,
}

impl CentralManager {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (availability_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (disconnect_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (data_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let current = Availability::from(adapter.state());
        let availability = Arc::new(RwLock::new(current));

        let event_loop = EventLoop {
            adapter,
            commands: cmd_rx,
            loopback: cmd_tx.clone(),
            scanner: Scanner::new(),
            pool: ConnectionPool::new(),
            current,
            shared: Arc::clone(&availability),
            availability_tx: availability_tx.clone(),
            disconnect_tx: disconnect_tx.clone(),
            data_tx: data_tx.clone(),
        };
        tokio::spawn(event_loop.run());

        Arc::new(Self {
            commands: cmd_tx,
            availability,
            availability_tx,
            disconnect_tx,
            data_tx,
        })
    }

    /// Current radio availability.
    pub async fn availability(&self) -> Availability {
        *self.availability.read().await
    }

    pub fn availability_events(&self) -> broadcast::Receiver<Availability> {
        self.availability_tx.subscribe()
    }

    pub fn disconnect_events(&self) -> broadcast::Receiver<Disconnection> {
        self.disconnect_tx.subscribe()
    }

    /// Stream of characteristic values from all connected devices.
    pub fn data_events(&self) -> broadcast::Receiver<ReceivedData> {
        self.data_tx.subscribe()
    }

    /// Start a scan session. At most one scan runs at a time.
    pub async fn start_scan(
        &self,
        filter: ScanFilter,
        mode: ScanMode,
    ) -> Result<ScanHandle, ScanError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartScan { filter, mode, reply })
            .map_err(|_| ScanError::Terminated)?;
        let (changes, completion) = rx.await.map_err(|_| ScanError::Terminated)??;
        Ok(ScanHandle {
            changes,
            completion,
        })
    }

    /// End the running scan, if any. The final discovery list is delivered
    /// through the scan's [`ScanHandle`].
    pub async fn stop_scan(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::StopScan { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Connect to a device, resolving when the link is up or the attempt
    /// fails, times out, or is cancelled.
    pub async fn connect(
        &self,
        device: DeviceId,
        timeout: Option<Duration>,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            device,
            timeout: timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            reply,
        })
        .map_err(|_| ConnectionError::Terminated)?;
        rx.await.map_err(|_| ConnectionError::Terminated)?
    }

    /// Tear down a connection. Errors with [`ConnectionError::NotConnected`]
    /// when the device is not connected, including while an attempt is still
    /// pending. Completion of a live connection's teardown is observed on
    /// [`disconnect_events`].
    ///
    /// [`disconnect_events`]: CentralManager::disconnect_events
    pub async fn disconnect(&self, device: DeviceId) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { device, reply })
            .map_err(|_| ConnectionError::Terminated)?;
        rx.await.map_err(|_| ConnectionError::Terminated)?
    }

    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::ConnectedDevices { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Discover services and characteristics on a connected device, arm
    /// notifications, and build send queues. Resolves with the service map
    /// once the device is ready for I/O.
    pub async fn prepare_services(
        &self,
        device: DeviceId,
        interest: Vec<ServiceInterest>,
    ) -> Result<ServiceMap, GattError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PrepareServices {
            device,
            interest,
            reply,
        })
        .map_err(|_| GattError::Terminated)?;
        rx.await.map_err(|_| GattError::Terminated)?
    }

    /// Request a read. The value arrives on [`data_events`].
    ///
    /// [`data_events`]: CentralManager::data_events
    pub async fn read_characteristic(
        &self,
        device: DeviceId,
        characteristic: Uuid,
    ) -> Result<(), GattError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReadCharacteristic {
            device,
            characteristic,
            reply,
        })
        .map_err(|_| GattError::Terminated)?;
        rx.await.map_err(|_| GattError::Terminated)?
    }

    /// Queue a payload for a writable characteristic. Payloads larger than
    /// the device's maximum write length are chunked and paced by the
    /// adapter's ready-to-write signal.
    pub async fn write_characteristic(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), GattError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::WriteCharacteristic {
            device,
            characteristic,
            payload,
            reply,
        })
        .map_err(|_| GattError::Terminated)?;
        rx.await.map_err(|_| GattError::Terminated)?
    }

    /// Tear down a device's prepared GATT state without disconnecting.
    /// Notifications are disarmed and send queues dropped; fails while a
    /// preparation is still in flight.
    pub async fn invalidate_services(&self, device: DeviceId) -> Result<(), GattError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::InvalidateServices { device, reply })
            .map_err(|_| GattError::Terminated)?;
        rx.await.map_err(|_| GattError::Terminated)?
    }

    /// Stop the event loop. Pending requests resolve as terminated.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), mpsc::error::SendError<Command>> {
        self.commands.send(command)
    }
}

struct EventLoop {
    adapter: Arc<dyn BleAdapter>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Timer tasks post back here instead of touching state.
    loopback: mpsc::UnboundedSender<Command>,
    scanner: Scanner,
    pool: ConnectionPool,
    current: Availability,
    shared: Arc<RwLock<Availability>>,
    availability_tx: broadcast::Sender<Availability>,
    disconnect_tx: broadcast::Sender<Disconnection>,
    data_tx: broadcast::Sender<ReceivedData>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut events = self.adapter.events();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("adapter event stream lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("central event loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan { filter, mode, reply } => {
                let service_uuids = filter.service_uuids.clone();
                let allow_duplicates = filter.update_duplicates;
                match self.scanner.begin(filter, self.current) {
                    Ok(channels) => {
                        self.adapter
                            .start_scan(&service_uuids, allow_duplicates)
                            .await;
                        if let ScanMode::FixedDuration(duration) = mode {
                            self.arm_scan_timer(duration);
                        }
                        let _ = reply.send(Ok(channels));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            Command::StopScan { reply } => {
                if self.scanner.end() {
                    self.adapter.stop_scan().await;
                }
                let _ = reply.send(());
            }
            Command::ScanTimerFired { generation } => {
                if self.scanner.is_scanning() && self.scanner.generation() == generation {
                    self.scanner.end();
                    self.adapter.stop_scan().await;
                }
            }
            Command::Connect {
                device,
                timeout,
                reply,
            } => {
                if let Some(attempt) = self.pool.register(device, self.current, reply) {
                    self.adapter.connect(device).await;
                    self.arm_connect_timer(device, attempt, timeout);
                }
            }
            Command::ConnectTimerFired { device, attempt } => {
                if self.pool.handle_timeout(device, attempt) {
                    self.adapter.cancel_connect(device).await;
                }
            }
            Command::Disconnect { device, reply } => {
                if self.pool.is_connected(device) {
                    self.adapter.cancel_connect(device).await;
                    let _ = reply.send(Ok(()));
                } else {
                    // A pending attempt is not a connection; it keeps
                    // running and resolves via its own timer, the adapter
                    // callback, or a pool reset.
                    let _ = reply.send(Err(ConnectionError::NotConnected));
                }
            }
            Command::ConnectedDevices { reply } => {
                let _ = reply.send(self.pool.connected_ids());
            }
            Command::PrepareServices {
                device,
                interest,
                reply,
            } => {
                let availability = self.current;
                let reason = self.not_connected_reason(device);
                let start = match self.pool.session_mut(device) {
                    Some(session) => session.begin_prepare(interest, availability, reply),
                    None => {
                        let _ = reply.send(Err(GattError::NotConnected(reason)));
                        return;
                    }
                };
                if let Some(start) = start {
                    for characteristic in start.disable_notify {
                        self.adapter.set_notify(device, characteristic, false).await;
                    }
                    self.adapter
                        .discover_services(device, start.service_filter.as_deref())
                        .await;
                }
            }
            Command::ReadCharacteristic {
                device,
                characteristic,
                reply,
            } => {
                let reason = self.not_connected_reason(device);
                let result = match self.pool.session_mut(device) {
                    Some(session) => session.read(characteristic),
                    None => Err(GattError::NotConnected(reason)),
                };
                if result.is_ok() {
                    self.adapter.read_value(device, characteristic).await;
                }
                let _ = reply.send(result);
            }
            Command::WriteCharacteristic {
                device,
                characteristic,
                payload,
                reply,
            } => {
                let reason = self.not_connected_reason(device);
                let result = match self.pool.session_mut(device) {
                    Some(session) => session.write(characteristic, payload),
                    None => Err(GattError::NotConnected(reason)),
                };
                match result {
                    Ok(first_chunk) => {
                        if let Some(chunk) = first_chunk {
                            self.adapter
                                .write_value(device, chunk.characteristic, &chunk.value, chunk.mode)
                                .await;
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            Command::InvalidateServices { device, reply } => {
                let reason = self.not_connected_reason(device);
                let result = match self.pool.session_mut(device) {
                    Some(session) => session.invalidate(),
                    None => Err(GattError::NotConnected(reason)),
                };
                match result {
                    Ok(disable_notify) => {
                        self.disable_notifications(device, disable_notify).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            // The run loop breaks on Shutdown before dispatching here.
            Command::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::StateChanged { state } => {
                self.apply_availability(Availability::from(state)).await;
            }
            AdapterEvent::Discovered {
                device,
                advertisement,
                rssi,
            } => {
                self.scanner.handle_discovery(device, advertisement, rssi);
            }
            AdapterEvent::Connected { device } => {
                if self.pool.handle_connected(device) {
                    log::info!("connected to {}", device);
                }
            }
            AdapterEvent::ConnectFailed { device, error } => {
                self.pool.handle_connect_failed(device, error);
            }
            AdapterEvent::Disconnected { device, error } => {
                if let Some(mut dropped) = self.pool.handle_disconnected(device) {
                    // The link is gone; armed notifications die with it.
                    dropped
                        .session
                        .abort(GattError::NotConnected(NotConnectedReason::Disconnected));
                    let _ = self.disconnect_tx.send(Disconnection { device, error });
                }
            }
            AdapterEvent::ServicesDiscovered { device, result } => {
                let outcome = match self.pool.session_mut(device) {
                    Some(session) => session.handle_services_discovered(result),
                    None => return,
                };
                match outcome {
                    ServicesOutcome::Ignored => {}
                    ServicesOutcome::NoServices => {
                        if let Some(session) = self.pool.session_mut(device) {
                            session.resolve_ready();
                        }
                    }
                    ServicesOutcome::Discover(requests) => {
                        for (service, filter) in requests {
                            self.adapter
                                .discover_characteristics(device, service, filter.as_deref())
                                .await;
                        }
                    }
                    ServicesOutcome::Failed { disable_notify } => {
                        self.disable_notifications(device, disable_notify).await;
                    }
                }
            }
            AdapterEvent::CharacteristicsDiscovered {
                device,
                service,
                result,
            } => {
                let max_write_len = self.adapter.max_write_len(device);
                let outcome = match self.pool.session_mut(device) {
                    Some(session) => {
                        session.handle_characteristics_discovered(service, result, max_write_len)
                    }
                    None => return,
                };
                match outcome {
                    CharacteristicsOutcome::Ignored => {}
                    CharacteristicsOutcome::Progress { enable_notify } => {
                        self.enable_notifications(device, enable_notify).await;
                    }
                    CharacteristicsOutcome::LastService { enable_notify } => {
                        self.enable_notifications(device, enable_notify).await;
                        if let Some(session) = self.pool.session_mut(device) {
                            session.resolve_ready();
                        }
                    }
                    CharacteristicsOutcome::Failed { disable_notify } => {
                        self.disable_notifications(device, disable_notify).await;
                    }
                }
            }
            AdapterEvent::ReadyToWrite { device } => {
                let chunks = match self.pool.session_mut(device) {
                    Some(session) => session.pump(),
                    None => return,
                };
                for chunk in chunks {
                    self.adapter
                        .write_value(device, chunk.characteristic, &chunk.value, chunk.mode)
                        .await;
                }
            }
            AdapterEvent::ValueUpdated {
                device,
                characteristic,
                result,
            } => match result {
                Ok(value) => {
                    if value.is_empty() {
                        return;
                    }
                    if let Some(session) = self.pool.session_mut(device) {
                        session.handle_value(characteristic, &value);
                    }
                    let _ = self.data_tx.send(ReceivedData {
                        device,
                        characteristic,
                        value,
                    });
                }
                Err(error) => {
                    log::warn!("value update for {} on {} failed: {}", characteristic, device, error);
                }
            },
        }
    }

    /// Availability transitions. Dropping out of Available tears down the
    /// whole session: the running scan ends with its partial results,
    /// pending attempts fail with Cancelled, and every connection drops.
    async fn apply_availability(&mut self, availability: Availability) {
        if availability == self.current {
            return;
        }
        log::info!("adapter availability changed: {:?}", availability);
        self.current = availability;
        *self.shared.write().await = availability;

        if let Availability::Unavailable(reason) = availability {
            if self.scanner.end() {
                self.adapter.stop_scan().await;
            }
            let (pending, dropped) = self.pool.reset();
            for device in pending {
                self.adapter.cancel_connect(device).await;
            }
            for (device, mut connection) in dropped {
                connection.session.abort(GattError::Unavailable(reason));
                self.adapter.cancel_connect(device).await;
                let _ = self.disconnect_tx.send(Disconnection {
                    device,
                    error: None,
                });
            }
        }

        let _ = self.availability_tx.send(availability);
    }

    fn not_connected_reason(&self, device: DeviceId) -> NotConnectedReason {
        if self.pool.has_attempt(device) {
            NotConnectedReason::Connecting
        } else {
            NotConnectedReason::Disconnected
        }
    }

    async fn enable_notifications(&self, device: DeviceId, characteristics: Vec<Uuid>) {
        for characteristic in characteristics {
            self.adapter.set_notify(device, characteristic, true).await;
        }
    }

    async fn disable_notifications(&self, device: DeviceId, characteristics: Vec<Uuid>) {
        for characteristic in characteristics {
            self.adapter.set_notify(device, characteristic, false).await;
        }
    }

    fn arm_scan_timer(&self, duration: Duration) {
        let generation = self.scanner.generation();
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = loopback.send(Command::ScanTimerFired { generation });
        });
    }

    fn arm_connect_timer(&self, device: DeviceId, attempt: u64, timeout: Duration) {
        let loopback = self.loopback.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = loopback.send(Command::ConnectTimerFired { device, attempt });
        });
    }
}
