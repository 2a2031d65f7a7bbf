//! The central's execution context: the one task that owns all connection,
//! routing and timer state

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::scan::{matches_filter, NearbyPeripherals, PeripheralSnapshot};
use super::{Command, Request};
use crate::attributes::GattTree;
use crate::config::{defaults, ScanSettings};
use crate::error::{BleError, BleResult, TransportError};
use crate::pending::Disconnection;
use crate::router::{Completion, OperationKey, OperationRouter, Outcome};
use crate::timer::{TimerTick, WatchdogPool};
use crate::transport::{normalize_rssi, Advertisement, BleTransport, TransportEvent};
use crate::types::{
    AdapterState, CharacteristicId, ConnectOptions, DeviceId, PeripheralState, WriteType,
};

// ----------------------------------------------------------------------------
// Timer Keys
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerBucket {
    Connect,
    Disconnect,
    Operation(OperationKey),
    PollRssi,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey {
    device: DeviceId,
    bucket: TimerBucket,
}

impl TimerKey {
    fn new(device: &DeviceId, bucket: TimerBucket) -> Self {
        Self {
            device: device.clone(),
            bucket,
        }
    }
}

// ----------------------------------------------------------------------------
// Per-device State
// ----------------------------------------------------------------------------

/// Operation state of one peripheral; created on first use and kept for the
/// lifetime of the context
struct PeripheralSlot {
    router: OperationRouter,
    timers: WatchdogPool<TimerKey>,
    gatt: GattTree,
    rssi: Option<i16>,
    rssi_updates: Option<mpsc::UnboundedSender<BleResult<Option<i16>>>>,
}

impl PeripheralSlot {
    fn new(ticks: mpsc::UnboundedSender<TimerTick<TimerKey>>) -> Self {
        Self {
            router: OperationRouter::new(),
            timers: WatchdogPool::new(ticks),
            gatt: GattTree::default(),
            rssi: None,
            rssi_updates: None,
        }
    }
}

/// Registered connect/disconnect continuations for one device
#[derive(Default)]
struct ConnectionSlot {
    /// Caller of an in-flight connect, with the future it receives on success
    connecting: Option<(oneshot::Sender<BleResult<Disconnection>>, Disconnection)>,
    /// Fires when an established connection ends
    disconnected: Option<oneshot::Sender<Option<BleError>>>,
    /// Callers of disconnect waiting for the link to go down
    disconnect_waiters: Vec<oneshot::Sender<BleResult<()>>>,
    /// Set while the connect is held back behind the teardown of an
    /// abandoned link; the transport has not seen it yet
    deferred: Option<ConnectOptions>,
}

struct ScanState {
    settings: ScanSettings,
    updates: mpsc::UnboundedSender<Vec<PeripheralSnapshot>>,
}

// ----------------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------------

pub(crate) struct CentralContext {
    transport: Arc<dyn BleTransport>,
    peripherals: HashMap<DeviceId, PeripheralSlot>,
    connections: HashMap<DeviceId, ConnectionSlot>,
    /// Disconnected events still owed for cancels issued after a timeout
    abandoned: HashMap<DeviceId, usize>,
    ticks_tx: mpsc::UnboundedSender<TimerTick<TimerKey>>,
    ticks_rx: mpsc::UnboundedReceiver<TimerTick<TimerKey>>,
    states: watch::Sender<AdapterState>,
    nearby: NearbyPeripherals,
    scan: Option<ScanState>,
}

impl CentralContext {
    pub(crate) fn new(
        transport: Arc<dyn BleTransport>,
        states: watch::Sender<AdapterState>,
        nearby: NearbyPeripherals,
    ) -> Self {
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            peripherals: HashMap::new(),
            connections: HashMap::new(),
            abandoned: HashMap::new(),
            ticks_tx,
            ticks_rx,
            states,
            nearby,
            scan: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(tick) = self.ticks_rx.recv() => self.handle_tick(tick),
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        info!("Central manager shutting down");
        if self.scan.take().is_some() {
            self.transport.stop_scan();
        }
        for device in self.known_devices() {
            self.notify_disconnect(&device, Some(BleError::CentralNotReady));
        }
    }

    fn known_devices(&self) -> Vec<DeviceId> {
        let devices: BTreeSet<DeviceId> = self
            .connections
            .keys()
            .chain(self.peripherals.keys())
            .cloned()
            .collect();
        devices.into_iter().collect()
    }

    fn peripheral_slot(&mut self, device: &DeviceId) -> &mut PeripheralSlot {
        let ticks = self.ticks_tx.clone();
        self.peripherals
            .entry(device.clone())
            .or_insert_with(|| PeripheralSlot::new(ticks))
    }

    /// Run `f` against the device's attribute cache, or against a throwaway
    /// cache when the device has no slot
    fn with_gatt<R>(&mut self, device: &DeviceId, f: impl FnOnce(&mut GattTree) -> R) -> R {
        match self.peripherals.get_mut(device) {
            Some(slot) => f(&mut slot.gatt),
            None => f(&mut GattTree::default()),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                device,
                options,
                timeout,
                reply,
            } => self.connect(device, options, timeout, reply),
            Command::Disconnect {
                device,
                timeout,
                reply,
            } => self.disconnect(device, timeout, reply),
            Command::Operation {
                device,
                request,
                timeout,
                completion,
            } => self.start_operation(device, request, timeout, completion),
            Command::WriteWithoutResponse {
                device,
                characteristic,
                data,
                reply,
            } => self.write_without_response(device, characteristic, data, reply),
            Command::Services { device, reply } => {
                let services = self
                    .peripherals
                    .get(&device)
                    .map(|slot| slot.gatt.services().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(Ok(services));
            }
            Command::StartRssiPolling {
                device,
                interval,
                updates,
            } => self.start_rssi_polling(device, interval, updates),
            Command::StopRssiPolling { device } => {
                if let Some(slot) = self.peripherals.get_mut(&device) {
                    slot.timers.cancel(&TimerKey::new(&device, TimerBucket::PollRssi));
                    slot.rssi_updates = None;
                }
            }
            Command::StartScan { settings, updates } => self.start_scan(settings, updates),
            Command::StopScan => self.stop_scan(),
            Command::Shutdown => {}
        }
    }

    fn can_attempt_operation(&self, device: &DeviceId) -> BleResult<()> {
        if !self.transport.adapter_state().is_powered_on() {
            return Err(BleError::CentralNotReady);
        }
        if self.transport.peripheral_state(device) != PeripheralState::Connected {
            return Err(BleError::NotConnected);
        }
        Ok(())
    }

    fn connect(
        &mut self,
        device: DeviceId,
        options: ConnectOptions,
        timeout: Option<Duration>,
        reply: oneshot::Sender<BleResult<Disconnection>>,
    ) {
        debug!(device = %device, "Connecting");
        if !self.transport.adapter_state().is_powered_on() {
            let _ = reply.send(Err(BleError::CentralNotReady));
            return;
        }

        if let Some(existing) = self.connections.get(&device) {
            let reason = if existing.connecting.is_some() {
                "a connection attempt is already in progress"
            } else {
                "the peripheral is already connected"
            };
            let _ = reply.send(Err(BleError::invalid_param("device", reason)));
            return;
        }

        let Some(handle) = self.transport.resolve(&device) else {
            let _ = reply.send(Err(BleError::ConnectionFailed(Some(TransportError::new(
                "peripheral is not known to the transport",
            )))));
            return;
        };

        let deferred = self.abandoned.contains_key(&device).then(|| options.clone());
        let held_back = deferred.is_some();
        let (disconnected, disconnection) = Disconnection::channel();
        self.connections.insert(
            device.clone(),
            ConnectionSlot {
                connecting: Some((reply, disconnection)),
                disconnected: Some(disconnected),
                disconnect_waiters: Vec::new(),
                deferred,
            },
        );

        let slot = self.peripheral_slot(&device);
        slot.timers.start(TimerKey::new(&device, TimerBucket::Connect), timeout);
        if held_back {
            debug!(device = %device, "Waiting for the previous link to be torn down");
        } else {
            self.transport.connect(&handle, &options);
        }
    }

    fn disconnect(
        &mut self,
        device: DeviceId,
        timeout: Option<Duration>,
        reply: oneshot::Sender<BleResult<()>>,
    ) {
        debug!(device = %device, "Disconnecting");
        if !self.transport.adapter_state().is_powered_on() {
            self.notify_disconnect(&device, Some(BleError::CentralNotReady));
            let _ = reply.send(Err(BleError::CentralNotReady));
            return;
        }

        if self.is_held_back(&device) {
            debug!(device = %device, "Dropping a connect that never reached the transport");
            self.notify_disconnect(&device, None);
            let _ = reply.send(Ok(()));
            return;
        }

        if !self.connections.contains_key(&device)
            && self.transport.peripheral_state(&device) == PeripheralState::Disconnected
        {
            let _ = reply.send(Ok(()));
            return;
        }

        self.connections
            .entry(device.clone())
            .or_default()
            .disconnect_waiters
            .push(reply);

        let slot = self.peripheral_slot(&device);
        slot.timers.start(TimerKey::new(&device, TimerBucket::Disconnect), timeout);

        match self.transport.resolve(&device) {
            Some(handle) => self.transport.cancel_connection(&handle),
            None => {
                debug!(device = %device, "Peripheral no longer resolvable, treating as disconnected");
                self.notify_disconnect(&device, None);
            }
        }
    }

    /// The common primitive-operation path: precondition, register, arm the
    /// watchdog, then hand the request to the transport
    fn start_operation(
        &mut self,
        device: DeviceId,
        request: Request,
        timeout: Option<Duration>,
        completion: Completion,
    ) {
        let key = request.key();
        debug!(device = %device, "Starting {}", key);

        if let Err(err) = self.can_attempt_operation(&device) {
            debug!(device = %device, "Cannot {}: {}", key, err);
            completion.fail(err);
            return;
        }

        let slot = self.peripheral_slot(&device);
        if let Err(completion) = slot.router.register(key, completion) {
            completion.fail(BleError::invalid_param(
                "operation",
                format!("{} is already pending", key),
            ));
            return;
        }
        slot.timers.start(TimerKey::new(&device, TimerBucket::Operation(key)), timeout);

        if let Request::SetNotify {
            characteristic,
            enabled,
            listener,
        } = &request
        {
            match (enabled, listener) {
                (true, Some(listener)) => slot.router.set_listener(*characteristic, listener.clone()),
                (false, _) => {
                    slot.router.remove_listener(characteristic);
                }
                (true, None) => {}
            }
        }

        self.submit(&device, request);
    }

    fn submit(&self, device: &DeviceId, request: Request) {
        let transport = &self.transport;
        match request {
            Request::DiscoverServices { filter } => transport.discover_services(device, filter.as_deref()),
            Request::DiscoverIncludedServices { service, filter } => {
                transport.discover_included_services(device, service, filter.as_deref())
            }
            Request::DiscoverCharacteristics { service, filter } => {
                transport.discover_characteristics(device, service, filter.as_deref())
            }
            Request::DiscoverDescriptors { characteristic } => {
                transport.discover_descriptors(device, characteristic)
            }
            Request::SetNotify {
                characteristic,
                enabled,
                ..
            } => transport.set_notify(device, characteristic, enabled),
            Request::ReadCharacteristic { characteristic } => {
                transport.read_characteristic(device, characteristic)
            }
            Request::WriteCharacteristic { characteristic, data } => {
                transport.write_characteristic(device, characteristic, &data, WriteType::WithResponse)
            }
            Request::ReadDescriptor { descriptor } => transport.read_descriptor(device, descriptor),
            Request::WriteDescriptor { descriptor, data } => {
                transport.write_descriptor(device, descriptor, &data)
            }
            Request::ReadRssi => transport.read_rssi(device),
        }
    }

    /// The single terminal path of every primitive operation
    fn finish_operation(&mut self, device: &DeviceId, key: OperationKey, result: BleResult<Outcome>) {
        let Some(slot) = self.peripherals.get_mut(device) else {
            debug!(device = %device, "No operation state for {}, dropping result", key);
            return;
        };

        slot.timers.cancel(&TimerKey::new(device, TimerBucket::Operation(key)));
        let Some(pending) = slot.router.take(&key) else {
            debug!(device = %device, "No pending {}, dropping result", key);
            return;
        };

        match &result {
            Ok(_) => debug!(
                device = %device,
                elapsed = ?pending.registered_at.elapsed(),
                "Finished {}",
                key
            ),
            Err(err) => debug!(device = %device, "{} failed: {}", key, err),
        }

        if let (OperationKey::SetNotify(characteristic), Err(_)) = (&key, &result) {
            slot.router.remove_listener(characteristic);
        }

        if !pending.completion.deliver(result) {
            trace!(device = %device, "Caller of {} is no longer waiting", key);
        }
    }

    fn write_without_response(
        &mut self,
        device: DeviceId,
        characteristic: CharacteristicId,
        data: Vec<u8>,
        reply: oneshot::Sender<BleResult<crate::attributes::Characteristic>>,
    ) {
        if let Err(err) = self.can_attempt_operation(&device) {
            let _ = reply.send(Err(err));
            return;
        }

        self.transport
            .write_characteristic(&device, characteristic, &data, WriteType::WithoutResponse);
        let node = self.with_gatt(&device, |gatt| gatt.characteristic_snapshot(&characteristic));
        let _ = reply.send(Ok(node));
    }

    fn start_rssi_polling(
        &mut self,
        device: DeviceId,
        interval: Duration,
        updates: mpsc::UnboundedSender<BleResult<Option<i16>>>,
    ) {
        if interval.is_zero() {
            let _ = updates.send(Err(BleError::invalid_param("interval", "must be greater than zero")));
            return;
        }
        if let Err(err) = self.can_attempt_operation(&device) {
            let _ = updates.send(Err(err));
            return;
        }

        debug!(device = %device, "Polling RSSI every {:?}", interval);
        let slot = self.peripheral_slot(&device);
        slot.rssi_updates = Some(updates);
        slot.timers
            .start_repeating(TimerKey::new(&device, TimerBucket::PollRssi), interval);
    }

    fn poll_rssi(&mut self, device: &DeviceId) {
        let precondition = self.can_attempt_operation(device);
        let Some(slot) = self.peripherals.get_mut(device) else {
            return;
        };
        let poll_key = TimerKey::new(device, TimerBucket::PollRssi);

        let updates = match &slot.rssi_updates {
            Some(updates) if !updates.is_closed() => updates.clone(),
            _ => {
                slot.timers.cancel(&poll_key);
                slot.rssi_updates = None;
                return;
            }
        };

        if let Err(err) = precondition {
            let _ = updates.send(Err(err));
            slot.timers.cancel(&poll_key);
            slot.rssi_updates = None;
            return;
        }

        if slot.router.is_pending(&OperationKey::ReadRssi) {
            trace!(device = %device, "Previous RSSI read still pending, skipping poll");
            return;
        }

        self.start_operation(
            device.clone(),
            Request::ReadRssi,
            Some(defaults::OPERATION_TIMEOUT),
            Completion::RssiUpdates(updates),
        );
    }

    fn start_scan(
        &mut self,
        settings: ScanSettings,
        updates: mpsc::UnboundedSender<Vec<PeripheralSnapshot>>,
    ) {
        if self.scan.is_some() {
            self.transport.stop_scan();
        }
        self.nearby.clear();

        if self.transport.adapter_state().is_powered_on() {
            info!("Starting scan");
            self.transport
                .start_scan(settings.service_uuids.as_deref(), settings.allow_duplicates);
        } else {
            info!("Adapter is not powered on, scan will start once it is");
        }
        self.scan = Some(ScanState { settings, updates });
    }

    fn stop_scan(&mut self) {
        if self.scan.take().is_some() {
            info!("Stopping scan");
            self.transport.stop_scan();
        }
    }

    // ------------------------------------------------------------------------
    // Connection Lifecycle
    // ------------------------------------------------------------------------

    /// Resolve every continuation registered for `device` exactly once and
    /// tear down its operation state
    fn notify_disconnect(&mut self, device: &DeviceId, error: Option<BleError>) {
        if let Some(slot) = self.connections.remove(device) {
            match &error {
                Some(err) => info!(device = %device, "Disconnected: {}", err),
                None => info!(device = %device, "Disconnected"),
            }

            if let Some((reply, _)) = slot.connecting {
                let err = error.clone().unwrap_or(BleError::ConnectionFailed(None));
                let _ = reply.send(Err(err));
            }
            if let Some(disconnected) = slot.disconnected {
                let _ = disconnected.send(error.clone());
            }
            for waiter in slot.disconnect_waiters {
                let _ = waiter.send(match &error {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                });
            }
        }

        self.cleanup_after_disconnect(device, error.as_ref());
    }

    fn cleanup_after_disconnect(&mut self, device: &DeviceId, error: Option<&BleError>) {
        let Some(slot) = self.peripherals.get_mut(device) else {
            return;
        };

        let pending_error = match error {
            Some(BleError::CentralNotReady) => BleError::CentralNotReady,
            Some(BleError::Disconnected(cause)) | Some(BleError::ConnectionFailed(cause)) => {
                BleError::Disconnected(cause.clone())
            }
            _ => BleError::Disconnected(None),
        };

        slot.timers.cancel_all();
        let failed = slot.router.clear_all(&pending_error);
        if failed > 0 {
            debug!(device = %device, "Resolved {} pending operations with {}", failed, pending_error);
        }
        slot.gatt.clear();
        slot.rssi = None;
        slot.rssi_updates = None;
    }

    fn connect_timed_out(&mut self, device: &DeviceId) {
        warn!(device = %device, "Connect timed out");
        let held_back = self.is_held_back(device);
        self.notify_disconnect(device, Some(BleError::Timeout));
        if held_back {
            // Nothing was submitted; stop waiting on the earlier teardown
            self.abandoned.remove(device);
        } else {
            self.abandon_link(device, 1);
        }
    }

    fn disconnect_timed_out(&mut self, device: &DeviceId) {
        warn!(device = %device, "Disconnect timed out");
        self.notify_disconnect(device, Some(BleError::Timeout));
        // Owed: the original cancel and the reissued one
        self.abandon_link(device, 2);
    }

    /// Reissue the cancel for a link that was given up on and expect
    /// `owed` Disconnected events for it
    fn abandon_link(&mut self, device: &DeviceId, owed: usize) {
        if self.cancel_connection(device) {
            *self.abandoned.entry(device.clone()).or_default() += owed;
        }
    }

    /// Handles go stale across adapter restarts, so always re-resolve
    fn cancel_connection(&self, device: &DeviceId) -> bool {
        match self.transport.resolve(device) {
            Some(handle) => {
                self.transport.cancel_connection(&handle);
                true
            }
            None => false,
        }
    }

    fn is_held_back(&self, device: &DeviceId) -> bool {
        self.connections
            .get(device)
            .is_some_and(|slot| slot.deferred.is_some())
    }

    /// Consume a Disconnected owed to an abandoned link. Once the last one
    /// arrives, a connect held back behind it goes to the transport.
    fn absorb_teardown(&mut self, device: &DeviceId) -> bool {
        let Some(owed) = self.abandoned.get_mut(device) else {
            return false;
        };
        *owed = owed.saturating_sub(1);
        if *owed > 0 {
            trace!(device = %device, "Abandoned link still owes {} teardowns", owed);
            return true;
        }
        self.abandoned.remove(device);
        debug!(device = %device, "Abandoned link torn down");

        let Some(options) = self
            .connections
            .get_mut(device)
            .and_then(|slot| slot.deferred.take())
        else {
            return true;
        };
        match self.transport.resolve(device) {
            Some(handle) => self.transport.connect(&handle, &options),
            None => self.notify_disconnect(
                device,
                Some(BleError::ConnectionFailed(Some(TransportError::new(
                    "peripheral is not known to the transport",
                )))),
            ),
        }
        true
    }

    fn adapter_state_changed(&mut self, state: AdapterState) {
        info!("Adapter state changed to {}", state);
        self.states.send_replace(state);

        if state.is_powered_on() {
            if let Some(scan) = &self.scan {
                info!("Resuming scan");
                self.transport
                    .start_scan(scan.settings.service_uuids.as_deref(), scan.settings.allow_duplicates);
            }
        } else {
            self.abandoned.clear();
            for device in self.known_devices() {
                self.notify_disconnect(&device, Some(BleError::CentralNotReady));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: TransportEvent) {
        trace!("Transport event: {:?}", event);
        match event {
            TransportEvent::AdapterStateChanged(state) => self.adapter_state_changed(state),
            TransportEvent::Advertisement(adv) => self.advertisement(adv),
            TransportEvent::Connected { device } => self.connected(device),
            TransportEvent::ConnectFailed { device, error } => {
                if self.is_held_back(&device) {
                    debug!(device = %device, "Late failure of an abandoned connect, ignoring");
                    return;
                }
                self.notify_disconnect(&device, Some(BleError::ConnectionFailed(error)));
            }
            TransportEvent::Disconnected { device, error } => {
                if self.absorb_teardown(&device) {
                    return;
                }
                let error = error.map(|cause| BleError::Disconnected(Some(cause)));
                self.notify_disconnect(&device, error);
            }
            TransportEvent::ServicesDiscovered { device, result } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|services| {
                    self.with_gatt(&device, |gatt| gatt.replace_services(&services));
                    Outcome::Services(services)
                });
                self.finish_operation(&device, OperationKey::DiscoverServices, outcome);
            }
            TransportEvent::IncludedServicesDiscovered {
                device,
                service,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|included| {
                    self.with_gatt(&device, |gatt| gatt.replace_included_services(&service, &included));
                    Outcome::Services(included)
                });
                self.finish_operation(&device, OperationKey::DiscoverIncludedServices(service), outcome);
            }
            TransportEvent::CharacteristicsDiscovered {
                device,
                service,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|characteristics| {
                    self.with_gatt(&device, |gatt| gatt.replace_characteristics(&service, &characteristics));
                    Outcome::Characteristics(characteristics)
                });
                self.finish_operation(&device, OperationKey::DiscoverCharacteristics(service), outcome);
            }
            TransportEvent::DescriptorsDiscovered {
                device,
                characteristic,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|descriptors| {
                    self.with_gatt(&device, |gatt| gatt.replace_descriptors(&characteristic, &descriptors));
                    Outcome::Descriptors(descriptors)
                });
                self.finish_operation(&device, OperationKey::DiscoverDescriptors(characteristic), outcome);
            }
            TransportEvent::NotifyStateUpdated {
                device,
                characteristic,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|enabled| {
                    Outcome::Characteristic(
                        self.with_gatt(&device, |gatt| gatt.update_notifying(&characteristic, enabled)),
                    )
                });
                self.finish_operation(&device, OperationKey::SetNotify(characteristic), outcome);
            }
            TransportEvent::CharacteristicValueUpdated {
                device,
                characteristic,
                result,
            } => self.characteristic_value_updated(device, characteristic, result),
            TransportEvent::CharacteristicWritten {
                device,
                characteristic,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|()| {
                    Outcome::Characteristic(
                        self.with_gatt(&device, |gatt| gatt.characteristic_snapshot(&characteristic)),
                    )
                });
                self.finish_operation(&device, OperationKey::WriteCharacteristic(characteristic), outcome);
            }
            TransportEvent::DescriptorValueUpdated {
                device,
                descriptor,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|value| {
                    Outcome::Descriptor(
                        self.with_gatt(&device, |gatt| gatt.update_descriptor_value(&descriptor, Some(value))),
                    )
                });
                self.finish_operation(&device, OperationKey::ReadDescriptor(descriptor), outcome);
            }
            TransportEvent::DescriptorWritten {
                device,
                descriptor,
                result,
            } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|()| {
                    Outcome::Descriptor(
                        self.with_gatt(&device, |gatt| gatt.update_descriptor_value(&descriptor, None)),
                    )
                });
                self.finish_operation(&device, OperationKey::WriteDescriptor(descriptor), outcome);
            }
            TransportEvent::RssiRead { device, result } => {
                let outcome = result.map_err(BleError::OperationFailed).map(|raw| {
                    let rssi = normalize_rssi(raw);
                    if let Some(slot) = self.peripherals.get_mut(&device) {
                        slot.rssi = rssi;
                    }
                    Outcome::Rssi(rssi)
                });
                self.finish_operation(&device, OperationKey::ReadRssi, outcome);
            }
        }
    }

    fn connected(&mut self, device: DeviceId) {
        let Some(slot) = self.connections.get_mut(&device) else {
            debug!(device = %device, "Connected without a registered connect, ignoring");
            return;
        };
        if slot.deferred.is_some() {
            debug!(device = %device, "Late connect of an abandoned attempt, ignoring");
            return;
        }
        let Some((reply, disconnection)) = slot.connecting.take() else {
            debug!(device = %device, "Duplicate connected event, ignoring");
            return;
        };

        info!(device = %device, "Connected");
        let peripheral = self.peripheral_slot(&device);
        peripheral.timers.cancel(&TimerKey::new(&device, TimerBucket::Connect));
        peripheral.gatt.clear();

        if reply.send(Ok(disconnection)).is_err() {
            debug!(device = %device, "Connect caller went away before the link came up");
        }
    }

    /// Value updates feed both the persistent notification listener and a
    /// pending read, if either exists
    fn characteristic_value_updated(
        &mut self,
        device: DeviceId,
        characteristic: CharacteristicId,
        result: Result<Vec<u8>, TransportError>,
    ) {
        let result = result.map_err(BleError::OperationFailed);
        if let Some(slot) = self.peripherals.get_mut(&device) {
            slot.router.notify_listener(&characteristic, result.clone());
        }

        let outcome = result.map(|value| {
            Outcome::Characteristic(
                self.with_gatt(&device, |gatt| gatt.update_characteristic_value(&characteristic, value)),
            )
        });
        self.finish_operation(&device, OperationKey::ReadCharacteristic(characteristic), outcome);
    }

    fn advertisement(&mut self, adv: Advertisement) {
        let Some(scan) = &self.scan else {
            trace!(device = %adv.device, "Advertisement outside of a scan, ignoring");
            return;
        };
        if !matches_filter(&scan.settings, &adv) {
            return;
        }

        let device = adv.device.clone();
        let nearby = self.nearby.record(adv);
        let delivered = scan.updates.send(nearby).is_ok();
        self.peripheral_slot(&device);

        if !delivered {
            debug!("Scan listener went away, stopping scan");
            self.stop_scan();
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn handle_tick(&mut self, tick: TimerTick<TimerKey>) {
        let device = tick.key.device.clone();
        let Some(slot) = self.peripherals.get_mut(&device) else {
            return;
        };
        if !slot.timers.accept(&tick) {
            trace!(device = %device, "Ignoring stale timer {:?}", tick.key.bucket);
            return;
        }

        match tick.key.bucket {
            TimerBucket::Connect => self.connect_timed_out(&device),
            TimerBucket::Disconnect => self.disconnect_timed_out(&device),
            TimerBucket::Operation(key) => {
                debug!(device = %device, "{} timed out", key);
                self.finish_operation(&device, key, Err(BleError::Timeout));
            }
            TimerBucket::PollRssi => self.poll_rssi(&device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Characteristic, CharacteristicProperties, Service};
    use crate::mock::{MockBehavior, MockOp, MockTransport};
    use crate::uuids::{characteristics, services};

    fn battery_level() -> CharacteristicId {
        CharacteristicId::new(services::BATTERY, characteristics::BATTERY_LEVEL)
    }

    /// A context driven by hand, with the device connected and writes left
    /// for the test to answer
    async fn connected_context() -> (CentralContext, DeviceId) {
        let device = DeviceId::new("AA:BB:CC:DD:EE:01");
        let mock = MockTransport::new();
        mock.add_device(
            device.clone(),
            vec![Service::new(services::BATTERY).with_characteristic(Characteristic::new(
                services::BATTERY,
                characteristics::BATTERY_LEVEL,
                CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            ))],
        );
        mock.script(&device, MockOp::WriteCharacteristic(battery_level()), MockBehavior::Ignore);

        let transport: Arc<dyn BleTransport> = Arc::new(mock);
        let (states, _) = watch::channel(transport.adapter_state());
        let mut context = CentralContext::new(transport, states, NearbyPeripherals::default());

        let (reply, connected) = oneshot::channel();
        context.handle_command(Command::Connect {
            device: device.clone(),
            options: ConnectOptions::default(),
            timeout: None,
            reply,
        });
        // Let the mock move its link state to connected
        tokio::time::sleep(Duration::from_millis(20)).await;
        context.handle_event(TransportEvent::Connected { device: device.clone() });
        assert!(connected.await.unwrap().is_ok());

        (context, device)
    }

    fn start_write(
        context: &mut CentralContext,
        device: &DeviceId,
    ) -> oneshot::Receiver<BleResult<Characteristic>> {
        let (tx, rx) = oneshot::channel();
        context.handle_command(Command::Operation {
            device: device.clone(),
            request: Request::WriteCharacteristic {
                characteristic: battery_level(),
                data: vec![1],
            },
            timeout: Some(Duration::from_secs(1)),
            completion: Completion::Characteristic(tx),
        });
        rx
    }

    fn written(device: &DeviceId) -> TransportEvent {
        TransportEvent::CharacteristicWritten {
            device: device.clone(),
            characteristic: battery_level(),
            result: Ok(()),
        }
    }

    /// Nothing registered and no watchdog armed for the write
    fn write_settled(context: &CentralContext, device: &DeviceId) -> bool {
        let key = OperationKey::WriteCharacteristic(battery_level());
        let slot = &context.peripherals[device];
        !slot.router.is_pending(&key)
            && !slot
                .timers
                .is_armed(&TimerKey::new(device, TimerBucket::Operation(key)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_after_timeout_is_dropped() {
        let (mut context, device) = connected_context().await;
        let mut write = start_write(&mut context, &device);

        let tick = context.ticks_rx.recv().await.unwrap();
        context.handle_tick(tick);
        assert!(matches!(write.try_recv(), Ok(Err(BleError::Timeout))));
        assert!(write_settled(&context, &device));

        context.handle_event(written(&device));
        assert!(write_settled(&context, &device));
        assert_eq!(context.peripherals[&device].router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_posted_before_answer_is_dropped() {
        let (mut context, device) = connected_context().await;
        let mut write = start_write(&mut context, &device);

        // The watchdog has expired and its tick is queued, but the answer
        // is handled first
        tokio::time::sleep(Duration::from_millis(1001)).await;
        context.handle_event(written(&device));
        assert!(matches!(write.try_recv(), Ok(Ok(_))));

        let tick = context.ticks_rx.recv().await.unwrap();
        context.handle_tick(tick);
        assert!(write_settled(&context, &device));
        assert_eq!(context.peripherals[&device].router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_of_abandoned_link_is_absorbed() {
        let (mut context, device) = connected_context().await;
        context.abandoned.insert(device.clone(), 1);

        assert!(context.absorb_teardown(&device));
        assert!(!context.abandoned.contains_key(&device));
        assert!(!context.absorb_teardown(&device));
    }
}
