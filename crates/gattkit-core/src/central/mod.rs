//! Central manager
//!
//! ## Architecture
//!
//! All connection bookkeeping, pending-operation routing, watchdog expiry and
//! transport events are handled by a single task (the central's execution
//! context). [`CentralManager`] and [`Peripheral`] are cheap handles that post
//! commands onto that task; transport events and timer ticks arrive on their
//! own channels into the same task. No state is shared across threads except
//! the nearby-peripheral map, which sits behind an explicit mutex so that
//! presentation code can read it directly.

mod context;
mod scan;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::attributes::{Characteristic, Service};
use crate::config::ScanSettings;
use crate::error::{BleError, BleResult};
use crate::peripheral::Peripheral;
use crate::pending::{Disconnection, Updates};
use crate::router::{Completion, NotificationSender, OperationKey};
use crate::transport::{BleTransport, EventSink};
use crate::types::{AdapterState, CharacteristicId, ConnectOptions, DescriptorId, DeviceId};

use context::CentralContext;
pub use scan::{NearbyPeripherals, PeripheralSnapshot, ScanUpdates};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Primitive GATT request, as submitted to the transport
#[derive(Debug)]
pub(crate) enum Request {
    DiscoverServices {
        filter: Option<Vec<Uuid>>,
    },
    DiscoverIncludedServices {
        service: Uuid,
        filter: Option<Vec<Uuid>>,
    },
    DiscoverCharacteristics {
        service: Uuid,
        filter: Option<Vec<Uuid>>,
    },
    DiscoverDescriptors {
        characteristic: CharacteristicId,
    },
    SetNotify {
        characteristic: CharacteristicId,
        enabled: bool,
        listener: Option<NotificationSender>,
    },
    ReadCharacteristic {
        characteristic: CharacteristicId,
    },
    WriteCharacteristic {
        characteristic: CharacteristicId,
        data: Vec<u8>,
    },
    ReadDescriptor {
        descriptor: DescriptorId,
    },
    WriteDescriptor {
        descriptor: DescriptorId,
        data: Vec<u8>,
    },
    ReadRssi,
}

impl Request {
    pub(crate) fn key(&self) -> OperationKey {
        match self {
            Self::DiscoverServices { .. } => OperationKey::DiscoverServices,
            Self::DiscoverIncludedServices { service, .. } => OperationKey::DiscoverIncludedServices(*service),
            Self::DiscoverCharacteristics { service, .. } => OperationKey::DiscoverCharacteristics(*service),
            Self::DiscoverDescriptors { characteristic } => OperationKey::DiscoverDescriptors(*characteristic),
            Self::SetNotify { characteristic, .. } => OperationKey::SetNotify(*characteristic),
            Self::ReadCharacteristic { characteristic } => OperationKey::ReadCharacteristic(*characteristic),
            Self::WriteCharacteristic { characteristic, .. } => OperationKey::WriteCharacteristic(*characteristic),
            Self::ReadDescriptor { descriptor } => OperationKey::ReadDescriptor(*descriptor),
            Self::WriteDescriptor { descriptor, .. } => OperationKey::WriteDescriptor(*descriptor),
            Self::ReadRssi => OperationKey::ReadRssi,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        device: DeviceId,
        options: ConnectOptions,
        timeout: Option<Duration>,
        reply: oneshot::Sender<BleResult<Disconnection>>,
    },
    Disconnect {
        device: DeviceId,
        timeout: Option<Duration>,
        reply: oneshot::Sender<BleResult<()>>,
    },
    Operation {
        device: DeviceId,
        request: Request,
        timeout: Option<Duration>,
        completion: Completion,
    },
    WriteWithoutResponse {
        device: DeviceId,
        characteristic: CharacteristicId,
        data: Vec<u8>,
        reply: oneshot::Sender<BleResult<Characteristic>>,
    },
    Services {
        device: DeviceId,
        reply: oneshot::Sender<BleResult<Vec<Service>>>,
    },
    StartRssiPolling {
        device: DeviceId,
        interval: Duration,
        updates: mpsc::UnboundedSender<BleResult<Option<i16>>>,
    },
    StopRssiPolling {
        device: DeviceId,
    },
    StartScan {
        settings: ScanSettings,
        updates: mpsc::UnboundedSender<Vec<PeripheralSnapshot>>,
    },
    StopScan,
    Shutdown,
}

// ----------------------------------------------------------------------------
// Central Manager
// ----------------------------------------------------------------------------

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    transport: Arc<dyn BleTransport>,
    states: watch::Receiver<AdapterState>,
    nearby: NearbyPeripherals,
}

/// Handle to the central's execution context.
///
/// Cloning is cheap; every clone drives the same context. The context stops
/// once every handle (including [`Peripheral`] handles) has been dropped, or
/// on [`CentralManager::shutdown`].
#[derive(Clone)]
pub struct CentralManager {
    inner: Arc<Inner>,
}

impl CentralManager {
    /// Attach to `transport` and spawn the execution context on the current
    /// tokio runtime
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sink, events_rx) = EventSink::channel();
        transport.attach(sink);

        let initial_state = transport.adapter_state();
        let (state_tx, state_rx) = watch::channel(initial_state);
        let nearby = NearbyPeripherals::default();

        let context = CentralContext::new(transport.clone(), state_tx, nearby.clone());
        tokio::spawn(context.run(commands_rx, events_rx));
        info!("Central manager started, adapter is {}", initial_state);

        Self {
            inner: Arc::new(Inner {
                commands: commands_tx,
                transport,
                states: state_rx,
                nearby,
            }),
        }
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.inner.transport.adapter_state()
    }

    pub fn is_powered_on(&self) -> bool {
        self.adapter_state().is_powered_on()
    }

    /// Receiver that observes every adapter state change
    pub fn state_changes(&self) -> watch::Receiver<AdapterState> {
        self.inner.states.clone()
    }

    /// Wait until the adapter reports powered on, bounded by `timeout`
    pub async fn wait_until_powered_on(&self, timeout: Option<Duration>) -> BleResult<()> {
        let mut states = self.state_changes();
        let wait = async move {
            loop {
                if states.borrow_and_update().is_powered_on() {
                    return Ok(());
                }
                if states.changed().await.is_err() {
                    return Err(BleError::CentralNotReady);
                }
            }
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .unwrap_or(Err(BleError::CentralNotReady)),
            None => wait.await,
        }
    }

    /// Handle for the peripheral with the given identifier
    pub fn peripheral(&self, device: impl Into<DeviceId>) -> Peripheral {
        Peripheral::new(device.into(), self.clone())
    }

    /// Start scanning; the returned stream yields the nearby list, strongest
    /// signal first, after every accepted advertisement.
    ///
    /// Starting a new scan replaces the previous one and ends its stream.
    pub fn start_scan(&self, settings: ScanSettings) -> ScanUpdates {
        let (updates, stream) = Updates::channel();
        self.send(Command::StartScan { settings, updates });
        stream
    }

    pub fn stop_scan(&self) {
        self.send(Command::StopScan);
    }

    /// Snapshot of every peripheral seen since the current scan started
    pub fn nearby_peripherals(&self) -> Vec<PeripheralSnapshot> {
        self.inner.nearby.sorted()
    }

    /// Stop the execution context. Every pending operation resolves with
    /// [`BleError::CentralNotReady`].
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub(crate) fn transport(&self) -> &Arc<dyn BleTransport> {
        &self.inner.transport
    }

    /// Post a command; when the context is gone the command (and any reply
    /// channel inside it) is dropped, which resolves callers with
    /// `CentralNotReady`.
    pub(crate) fn send(&self, command: Command) -> bool {
        match self.inner.commands.send(command) {
            Ok(()) => true,
            Err(_) => {
                debug!("Central execution context is gone, dropping command");
                false
            }
        }
    }
}

impl std::fmt::Debug for CentralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralManager")
            .field("adapter_state", &self.adapter_state())
            .finish()
    }
}
