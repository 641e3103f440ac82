//! Scan session
//!
//! Owns one active-or-idle scan: applies the filter, deduplicates
//! discoveries by device identity, optionally times out, and delivers
//! incremental progress plus a final snapshot. All mutation happens on the
//! coordinator's event loop; the duration timer posts back into that loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::adapter::transport::{Advertisement, DeviceId};
use crate::central::availability::{Availability, UnavailabilityReason};

/// Errors starting a scan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Bluetooth is unavailable: {0}")]
    Unavailable(UnavailabilityReason),

    #[error("A scan is already in progress")]
    AlreadyScanning,

    #[error("The session engine has shut down")]
    Terminated,
}

/// Scan until stopped, or for a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Infinite,
    FixedDuration(Duration),
}

/// Custom accept/reject predicate applied to each discovery.
pub type DiscoveryPredicate = Arc<dyn Fn(&Discovery) -> bool + Send + Sync>;

/// Which discoveries a scan reports.
#[derive(Clone, Default)]
pub struct ScanFilter {
    /// Only scan devices advertising these services (empty scans everything).
    pub service_uuids: Vec<Uuid>,
    /// Deliver and apply repeat advertisements from already-seen devices.
    /// Also forwarded to the adapter so it stops merging duplicates itself.
    pub update_duplicates: bool,
    /// Discoveries rejected by the predicate are dropped without side effects.
    pub custom: Option<DiscoveryPredicate>,
}

impl fmt::Debug for ScanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanFilter")
            .field("service_uuids", &self.service_uuids)
            .field("update_duplicates", &self.update_duplicates)
            .field("custom", &self.custom.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// One (possibly updated) observation of an advertising device.
///
/// Two discoveries are equal when they refer to the same device, whatever
/// their advertisement payloads.
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub device: DeviceId,
    pub advertisement: Advertisement,
    pub rssi: i16,
    /// How long after scan start this advertisement arrived.
    pub time_offset: Duration,
}

impl PartialEq for Discovery {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
    }
}

impl Eq for Discovery {}

/// Incremental scan progress.
#[derive(Debug, Clone)]
pub enum DiscoveryChange {
    /// First sighting of a device.
    New(Discovery),
    /// A known device advertised again; carries its position in the
    /// discovery list.
    Updated(Discovery, usize),
}

impl DiscoveryChange {
    pub fn discovery(&self) -> &Discovery {
        match self {
            DiscoveryChange::New(d) | DiscoveryChange::Updated(d, _) => d,
        }
    }

    pub fn time_offset(&self) -> Duration {
        self.discovery().time_offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Scanning,
}

/// The scan-session state machine.
pub(crate) struct Scanner {
    state: State,
    filter: ScanFilter,
    discoveries: Vec<Discovery>,
    progress: Option<mpsc::UnboundedSender<DiscoveryChange>>,
    completion: Option<oneshot::Sender<Vec<Discovery>>>,
    started_at: Instant,
    generation: u64,
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            filter: ScanFilter::default(),
            discoveries: Vec::new(),
            progress: None,
            completion: None,
            started_at: Instant::now(),
            generation: 0,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.state == State::Scanning
    }

    /// Generation of the current scan, used to discard stale duration timers.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Transition Idle -> Scanning and hand back the caller-facing channels.
    pub fn begin(
        &mut self,
        filter: ScanFilter,
        availability: Availability,
    ) -> Result<
        (
            mpsc::UnboundedReceiver<DiscoveryChange>,
            oneshot::Receiver<Vec<Discovery>>,
        ),
        ScanError,
    > {
        if self.state == State::Scanning {
            return Err(ScanError::AlreadyScanning);
        }
        if let Availability::Unavailable(reason) = availability {
            return Err(ScanError::Unavailable(reason));
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        self.state = State::Scanning;
        self.filter = filter;
        self.discoveries.clear();
        self.progress = Some(progress_tx);
        self.completion = Some(completion_tx);
        self.started_at = Instant::now();
        self.generation += 1;
        Ok((progress_rx, completion_rx))
    }

    /// End the scan and deliver the final discovery list. Returns whether a
    /// scan was actually running, so the caller knows to stop the adapter.
    pub fn end(&mut self) -> bool {
        if self.state != State::Scanning {
            return false;
        }
        self.state = State::Idle;
        self.progress = None;
        let discoveries = std::mem::take(&mut self.discoveries);
        log::debug!("scan ended with {} discoveries", discoveries.len());
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(discoveries);
        }
        true
    }

    /// Route one adapter discovery callback through filter and dedup.
    pub fn handle_discovery(&mut self, device: DeviceId, advertisement: Advertisement, rssi: i16) {
        if self.state != State::Scanning {
            return;
        }
        let discovery = Discovery {
            device,
            advertisement,
            rssi,
            time_offset: self.started_at.elapsed(),
        };
        if let Some(predicate) = &self.filter.custom {
            if !predicate(&discovery) {
                return;
            }
        }

        let change = match self.discoveries.iter().position(|d| d.device == device) {
            Some(index) => {
                if !self.filter.update_duplicates {
                    return;
                }
                self.discoveries[index] = discovery.clone();
                DiscoveryChange::Updated(discovery, index)
            }
            None => {
                self.discoveries.push(discovery.clone());
                DiscoveryChange::New(discovery)
            }
        };
        if let Some(progress) = &self.progress {
            let _ = progress.send(change);
        }
    }
}
