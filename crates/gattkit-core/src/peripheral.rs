//! Peripheral handle and its primitive GATT operations
//!
//! Every primitive follows the same template inside the central's execution
//! context: check the preconditions, register a completion under the
//! operation's key, arm the watchdog, then submit the request. The
//! transport's answer, the watchdog expiry or link teardown (whichever comes
//! first) resolves the returned [`Pending`] exactly once.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::attributes::{Characteristic, Descriptor, Service};
use crate::central::{CentralManager, Command, Request};
use crate::config::defaults;
use crate::error::{BleError, BleResult};
use crate::pending::{Disconnection, Notifications, Pending, RssiUpdates, Updates};
use crate::router::Completion;
use crate::types::{CharacteristicId, ConnectOptions, DescriptorId, DeviceId, PeripheralState};

#[derive(Clone, Debug)]
pub struct Peripheral {
    id: DeviceId,
    central: CentralManager,
}

impl Peripheral {
    pub(crate) fn new(id: DeviceId, central: CentralManager) -> Self {
        Self { id, central }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn state(&self) -> PeripheralState {
        self.central.transport().peripheral_state(&self.id)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeripheralState::Connected
    }

    pub fn central(&self) -> &CentralManager {
        &self.central
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect with default options.
    ///
    /// Resolves once the link is up, yielding a [`Disconnection`] future that
    /// completes when that link later ends.
    pub fn connect(&self, timeout: Option<Duration>) -> Pending<Disconnection> {
        self.connect_with_options(ConnectOptions::default(), timeout)
    }

    pub fn connect_with_options(&self, options: ConnectOptions, timeout: Option<Duration>) -> Pending<Disconnection> {
        let (reply, pending) = Pending::channel();
        self.central.send(Command::Connect {
            device: self.id.clone(),
            options,
            timeout,
            reply,
        });
        pending
    }

    /// Request the link to be torn down; resolves once the disconnect has been
    /// observed (or with `Timeout` when it never is)
    pub fn disconnect(&self, timeout: Option<Duration>) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.central.send(Command::Disconnect {
            device: self.id.clone(),
            timeout,
            reply,
        });
        pending
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    pub fn discover_services(&self, filter: Option<Vec<Uuid>>, timeout: Option<Duration>) -> Pending<Vec<Service>> {
        let (tx, pending) = Pending::channel();
        self.submit(Request::DiscoverServices { filter }, timeout, Completion::Services(tx));
        pending
    }

    pub fn discover_included_services(
        &self,
        service: Uuid,
        filter: Option<Vec<Uuid>>,
        timeout: Option<Duration>,
    ) -> Pending<Vec<Service>> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::DiscoverIncludedServices { service, filter },
            timeout,
            Completion::Services(tx),
        );
        pending
    }

    pub fn discover_characteristics(
        &self,
        service: Uuid,
        filter: Option<Vec<Uuid>>,
        timeout: Option<Duration>,
    ) -> Pending<Vec<Characteristic>> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::DiscoverCharacteristics { service, filter },
            timeout,
            Completion::Characteristics(tx),
        );
        pending
    }

    pub fn discover_descriptors(
        &self,
        characteristic: CharacteristicId,
        timeout: Option<Duration>,
    ) -> Pending<Vec<Descriptor>> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::DiscoverDescriptors { characteristic },
            timeout,
            Completion::Descriptors(tx),
        );
        pending
    }

    /// Discover one service and then its characteristics under a single
    /// overall `timeout`.
    ///
    /// The characteristic phase only gets what is left of the budget. An
    /// exhausted budget is passed on as a zero timeout, so the second phase
    /// fails with `Timeout` rather than running unbounded.
    pub async fn discover(
        &self,
        characteristics: Option<Vec<Uuid>>,
        service: Uuid,
        timeout: Option<Duration>,
    ) -> BleResult<Vec<Characteristic>> {
        let started = Instant::now();
        let services = self.discover_services(Some(vec![service]), timeout).await?;

        if !services.iter().any(|s| s.uuid == service) {
            return Err(BleError::invalid_param(
                "service",
                format!("service {} was not found", service),
            ));
        }

        let remaining = timeout.map(|budget| budget.saturating_sub(started.elapsed()));
        debug!(device = %self.id, "Discovering characteristics of {} with {:?} left", service, remaining);
        self.discover_characteristics(service, characteristics, remaining).await
    }

    /// Last discovered attribute tree
    pub async fn services(&self) -> BleResult<Vec<Service>> {
        let (reply, pending) = Pending::channel();
        self.central.send(Command::Services {
            device: self.id.clone(),
            reply,
        });
        pending.await
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Toggle notifications without installing a listener
    pub fn set_notify(&self, characteristic: CharacteristicId, enabled: bool, timeout: Option<Duration>) -> Pending<Characteristic> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::SetNotify {
                characteristic,
                enabled,
                listener: None,
            },
            timeout,
            Completion::Characteristic(tx),
        );
        pending
    }

    /// Enable notifications and receive every subsequent value update.
    ///
    /// The stream stays open until notifications are disabled, enabling fails,
    /// or the link ends.
    pub fn subscribe(&self, characteristic: CharacteristicId, timeout: Option<Duration>) -> (Pending<Characteristic>, Notifications) {
        let (tx, pending) = Pending::channel();
        let (listener, notifications) = Updates::channel();
        self.submit(
            Request::SetNotify {
                characteristic,
                enabled: true,
                listener: Some(listener),
            },
            timeout,
            Completion::Characteristic(tx),
        );
        (pending, notifications)
    }

    pub fn unsubscribe(&self, characteristic: CharacteristicId, timeout: Option<Duration>) -> Pending<Characteristic> {
        self.set_notify(characteristic, false, timeout)
    }

    // ------------------------------------------------------------------------
    // Reads and Writes
    // ------------------------------------------------------------------------

    pub fn read_value(&self, characteristic: CharacteristicId, timeout: Option<Duration>) -> Pending<Characteristic> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::ReadCharacteristic { characteristic },
            timeout,
            Completion::Characteristic(tx),
        );
        pending
    }

    pub fn write_value(&self, characteristic: CharacteristicId, data: Vec<u8>, timeout: Option<Duration>) -> Pending<Characteristic> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::WriteCharacteristic { characteristic, data },
            timeout,
            Completion::Characteristic(tx),
        );
        pending
    }

    /// Write without waiting for an acknowledgement; resolves as soon as the
    /// write has been handed to the transport
    pub fn write_value_without_response(&self, characteristic: CharacteristicId, data: Vec<u8>) -> Pending<Characteristic> {
        let (reply, pending) = Pending::channel();
        self.central.send(Command::WriteWithoutResponse {
            device: self.id.clone(),
            characteristic,
            data,
            reply,
        });
        pending
    }

    pub fn read_descriptor(&self, descriptor: DescriptorId, timeout: Option<Duration>) -> Pending<Descriptor> {
        let (tx, pending) = Pending::channel();
        self.submit(Request::ReadDescriptor { descriptor }, timeout, Completion::Descriptor(tx));
        pending
    }

    pub fn write_descriptor(&self, descriptor: DescriptorId, data: Vec<u8>, timeout: Option<Duration>) -> Pending<Descriptor> {
        let (tx, pending) = Pending::channel();
        self.submit(
            Request::WriteDescriptor { descriptor, data },
            timeout,
            Completion::Descriptor(tx),
        );
        pending
    }

    // ------------------------------------------------------------------------
    // Signal Strength
    // ------------------------------------------------------------------------

    /// Read the current signal strength; `None` when the stack has no reading
    pub fn read_rssi(&self, timeout: Option<Duration>) -> Pending<Option<i16>> {
        let (tx, pending) = Pending::channel();
        self.submit(Request::ReadRssi, timeout, Completion::Rssi(tx));
        pending
    }

    /// Read the signal strength every `interval` until stopped or the link ends
    pub fn start_rssi_polling(&self, interval: Option<Duration>) -> RssiUpdates {
        let (updates, stream) = Updates::channel();
        self.central.send(Command::StartRssiPolling {
            device: self.id.clone(),
            interval: interval.unwrap_or(defaults::RSSI_POLL_INTERVAL),
            updates,
        });
        stream
    }

    pub fn stop_rssi_polling(&self) {
        self.central.send(Command::StopRssiPolling {
            device: self.id.clone(),
        });
    }

    fn submit(&self, request: Request, timeout: Option<Duration>, completion: Completion) {
        self.central.send(Command::Operation {
            device: self.id.clone(),
            request,
            timeout,
            completion,
        });
    }
}
