//! btleplug-backed BLE transport
//!
//! btleplug exposes an async API, while [`BleTransport`] requests are
//! fire-and-forget. Every request is spawned as a task on the runtime that
//! created the transport, and its outcome is reported through the central's
//! [`EventSink`].
//!
//! btleplug discovers the whole attribute tree in one pass, so the
//! per-level discovery requests are answered from that tree.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use btleplug::api::{
    Central, CentralEvent, Characteristic as PlatformCharacteristic, Descriptor as PlatformDescriptor,
    Manager as _, Peripheral as _, ScanFilter, WriteType as PlatformWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use gattkit_core::{
    AdapterState, BleTransport, Characteristic, CharacteristicId, ConnectOptions, Descriptor,
    DescriptorId, DeviceId, EventSink, PeripheralHandle, PeripheralState, Service, TransportError,
    TransportEvent, WriteType, RSSI_UNAVAILABLE,
};

mod convert;

use convert::platform_error;

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct Shared {
    sink: Mutex<Option<EventSink>>,
    adapter_state: Mutex<AdapterState>,
    generation: AtomicU64,
    peripherals: Mutex<HashMap<DeviceId, PlatformPeripheral>>,
    states: Mutex<HashMap<DeviceId, PeripheralState>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        match lock(&self.sink).as_ref() {
            Some(sink) => {
                if !sink.emit(event) {
                    trace!("Central is gone, dropping transport event");
                }
            }
            None => trace!("No central attached, dropping transport event"),
        }
    }

    fn peripheral(&self, device: &DeviceId) -> Option<PlatformPeripheral> {
        lock(&self.peripherals).get(device).cloned()
    }

    fn set_state(&self, device: &DeviceId, state: PeripheralState) {
        lock(&self.states).insert(device.clone(), state);
    }

    fn state(&self, device: &DeviceId) -> PeripheralState {
        lock(&self.states)
            .get(device)
            .copied()
            .unwrap_or(PeripheralState::Disconnected)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Record and report a power change. Leaving the powered-on state drops
    /// every link and invalidates handed-out handles.
    fn update_adapter_state(&self, state: AdapterState) {
        let previous = std::mem::replace(&mut *lock(&self.adapter_state), state);
        if previous == state {
            return;
        }
        if previous.is_powered_on() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            lock(&self.states).clear();
        }
        self.emit(TransportEvent::AdapterStateChanged(state));
    }

    /// The adapter event stream ended: every handle and link is gone
    fn adapter_lost(&self) {
        warn!("BLE adapter event stream ended");
        self.update_adapter_state(AdapterState::PoweredOff);
    }
}

fn unknown_device(device: &DeviceId) -> TransportError {
    TransportError::new(format!("unknown peripheral {}", device))
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// [`BleTransport`] over the platform's Bluetooth stack
#[derive(Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    shared: Arc<Shared>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter of the system.
    ///
    /// Must be called from within a tokio runtime; request tasks are spawned
    /// onto that runtime.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new("no Bluetooth adapters found"))?;

        Self::with_adapter(adapter).await
    }

    pub async fn with_adapter(adapter: Adapter) -> Result<Self, TransportError> {
        match adapter.adapter_info().await {
            Ok(info) => info!("Using BLE adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let state = match adapter.adapter_state().await {
            Ok(state) => convert::adapter_state(state),
            Err(e) => {
                // btleplug only hands out adapters it can drive
                debug!("Adapter state unavailable, assuming powered on: {}", e);
                AdapterState::PoweredOn
            }
        };
        info!("BLE adapter is {}", state);

        let transport = Self {
            adapter,
            runtime: Handle::current(),
            shared: Arc::new(Shared {
                sink: Mutex::new(None),
                adapter_state: Mutex::new(state),
                generation: AtomicU64::new(1),
                peripherals: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
            }),
        };
        transport.load_known_peripherals().await;
        Ok(transport)
    }

    /// Peripherals the stack already knows, e.g. bonded devices
    async fn load_known_peripherals(&self) {
        let known = match self.adapter.peripherals().await {
            Ok(known) => known,
            Err(e) => {
                debug!("Could not list known peripherals: {}", e);
                return;
            }
        };

        for peripheral in known {
            let device = convert::device_id(&peripheral.id());
            let connected = peripheral.is_connected().await.unwrap_or(false);
            if connected {
                self.shared.set_state(&device, PeripheralState::Connected);
            }
            lock(&self.shared.peripherals).insert(device, peripheral);
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    /// Run `request` against the platform peripheral for `device` and emit
    /// the event it produces
    fn request<F, Fut>(&self, device: &DeviceId, request: F)
    where
        F: FnOnce(Result<PlatformPeripheral, TransportError>) -> Fut + Send + 'static,
        Fut: Future<Output = TransportEvent> + Send + 'static,
    {
        let shared = self.shared.clone();
        let peripheral = shared.peripheral(device).ok_or_else(|| unknown_device(device));
        self.spawn(async move {
            let event = request(peripheral).await;
            shared.emit(event);
        });
    }
}

impl BleTransport for BtleplugTransport {
    fn attach(&self, sink: EventSink) {
        *lock(&self.shared.sink) = Some(sink);
        self.spawn(pump_adapter_events(self.shared.clone(), self.adapter.clone()));
    }

    fn adapter_state(&self) -> AdapterState {
        *lock(&self.shared.adapter_state)
    }

    fn peripheral_state(&self, device: &DeviceId) -> PeripheralState {
        self.shared.state(device)
    }

    fn resolve(&self, device: &DeviceId) -> Option<PeripheralHandle> {
        self.shared
            .peripheral(device)
            .map(|_| PeripheralHandle::new(device.clone(), self.shared.generation()))
    }

    fn connect(&self, handle: &PeripheralHandle, options: &ConnectOptions) {
        let device = handle.device().clone();
        if options.enable_auto_reconnect {
            debug!("Auto-reconnect is not supported by btleplug, ignoring");
        }

        let peripheral = if handle.token() != self.shared.generation() {
            Err(TransportError::new("stale peripheral handle"))
        } else {
            self.shared.peripheral(&device).ok_or_else(|| unknown_device(&device))
        };

        self.shared.set_state(&device, PeripheralState::Connecting);
        let shared = self.shared.clone();
        let runtime = self.runtime.clone();
        self.spawn(async move {
            let outcome = match peripheral {
                Ok(peripheral) => {
                    let connected = peripheral.connect().await;
                    connected.map(|()| peripheral).map_err(platform_error)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(peripheral) => {
                    if shared.state(&device) != PeripheralState::Connecting {
                        // Cancelled while the platform was still connecting
                        debug!("Connect to {} completed after cancel", device);
                        if let Err(e) = peripheral.disconnect().await {
                            warn!("Failed to drop cancelled link to {}: {}", device, e);
                        }
                        return;
                    }
                    shared.set_state(&device, PeripheralState::Connected);
                    info!("Connected to {}", device);
                    shared.emit(TransportEvent::Connected {
                        device: device.clone(),
                    });
                    runtime.spawn(pump_notifications(shared, device, peripheral));
                }
                Err(e) if shared.state(&device) != PeripheralState::Connecting => {
                    debug!("Connect to {} failed after cancel: {}", device, e);
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", device, e);
                    shared.set_state(&device, PeripheralState::Disconnected);
                    shared.emit(TransportEvent::ConnectFailed {
                        device,
                        error: Some(e),
                    });
                }
            }
        });
    }

    fn cancel_connection(&self, handle: &PeripheralHandle) {
        let device = handle.device().clone();
        let peripheral = self.shared.peripheral(&device).ok_or_else(|| unknown_device(&device));
        self.shared.set_state(&device, PeripheralState::Disconnecting);
        let shared = self.shared.clone();
        self.spawn(async move {
            let result = match peripheral {
                Ok(peripheral) => peripheral.disconnect().await.map_err(platform_error),
                Err(e) => Err(e),
            };
            shared.set_state(&device, PeripheralState::Disconnected);
            match &result {
                Ok(()) => info!("Disconnected from {}", device),
                Err(e) => warn!("Disconnect from {} failed: {}", device, e),
            }
            shared.emit(TransportEvent::Disconnected {
                device,
                error: result.err(),
            });
        });
    }

    fn discover_services(&self, device: &DeviceId, filter: Option<&[Uuid]>) {
        let id = device.clone();
        let filter = filter.map(<[Uuid]>::to_vec);
        self.request(device, move |peripheral| async move {
            TransportEvent::ServicesDiscovered {
                device: id,
                result: discover_services(peripheral, filter).await,
            }
        });
    }

    fn discover_included_services(&self, device: &DeviceId, service: Uuid, _filter: Option<&[Uuid]>) {
        let id = device.clone();
        self.request(device, move |peripheral| async move {
            // btleplug does not surface included services
            let result = peripheral.map(|_| Vec::new());
            TransportEvent::IncludedServicesDiscovered {
                device: id,
                service,
                result,
            }
        });
    }

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, filter: Option<&[Uuid]>) {
        let id = device.clone();
        let filter = filter.map(<[Uuid]>::to_vec);
        self.request(device, move |peripheral| async move {
            TransportEvent::CharacteristicsDiscovered {
                device: id,
                service,
                result: discover_characteristics(peripheral, service, filter).await,
            }
        });
    }

    fn discover_descriptors(&self, device: &DeviceId, characteristic: CharacteristicId) {
        let id = device.clone();
        self.request(device, move |peripheral| async move {
            TransportEvent::DescriptorsDiscovered {
                device: id,
                characteristic,
                result: discover_descriptors(peripheral, characteristic).await,
            }
        });
    }

    fn set_notify(&self, device: &DeviceId, characteristic: CharacteristicId, enabled: bool) {
        let id = device.clone();
        self.request(device, move |peripheral| async move {
            TransportEvent::NotifyStateUpdated {
                device: id,
                characteristic,
                result: set_notify(peripheral, characteristic, enabled).await,
            }
        });
    }

    fn read_characteristic(&self, device: &DeviceId, characteristic: CharacteristicId) {
        let id = device.clone();
        self.request(device, move |peripheral| async move {
            TransportEvent::CharacteristicValueUpdated {
                device: id,
                characteristic,
                result: read_characteristic(peripheral, characteristic).await,
            }
        });
    }

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) {
        let id = device.clone();
        let data = data.to_vec();
        match write_type {
            WriteType::WithResponse => self.request(device, move |peripheral| async move {
                TransportEvent::CharacteristicWritten {
                    device: id,
                    characteristic,
                    result: write_characteristic(peripheral, characteristic, data, PlatformWriteType::WithResponse)
                        .await,
                }
            }),
            WriteType::WithoutResponse => {
                // Nothing is reported back for unacknowledged writes
                let peripheral = self.shared.peripheral(device).ok_or_else(|| unknown_device(device));
                self.spawn(async move {
                    if let Err(e) =
                        write_characteristic(peripheral, characteristic, data, PlatformWriteType::WithoutResponse)
                            .await
                    {
                        warn!("Write without response to {} on {} failed: {}", characteristic, id, e);
                    }
                });
            }
        }
    }

    fn read_descriptor(&self, device: &DeviceId, descriptor: DescriptorId) {
        let id = device.clone();
        self.request(device, move |peripheral| async move {
            TransportEvent::DescriptorValueUpdated {
                device: id,
                descriptor,
                result: read_descriptor(peripheral, descriptor).await,
            }
        });
    }

    fn write_descriptor(&self, device: &DeviceId, descriptor: DescriptorId, data: &[u8]) {
        let id = device.clone();
        let data = data.to_vec();
        self.request(device, move |peripheral| async move {
            TransportEvent::DescriptorWritten {
                device: id,
                descriptor,
                result: write_descriptor(peripheral, descriptor, data).await,
            }
        });
    }

    fn read_rssi(&self, device: &DeviceId) {
        let id = device.clone();
        self.request(device, move |peripheral| async move {
            TransportEvent::RssiRead {
                device: id,
                result: read_rssi(peripheral).await,
            }
        });
    }

    fn start_scan(&self, services: Option<&[Uuid]>, allow_duplicates: bool) {
        let filter = ScanFilter {
            services: services.map(<[Uuid]>::to_vec).unwrap_or_default(),
        };
        // btleplug reports every advertisement as DeviceUpdated anyway
        trace!("Starting scan (duplicates: {})", allow_duplicates);
        let adapter = self.adapter.clone();
        self.spawn(async move {
            match adapter.start_scan(filter).await {
                Ok(()) => info!("Started BLE scanning"),
                Err(e) => error!("Failed to start scanning: {}", e),
            }
        });
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();
        self.spawn(async move {
            match adapter.stop_scan().await {
                Ok(()) => info!("Stopped BLE scanning"),
                Err(e) => warn!("Failed to stop scanning: {}", e),
            }
        });
    }
}

// ----------------------------------------------------------------------------
// Background Pumps
// ----------------------------------------------------------------------------

/// Turn adapter events into advertisements and link-loss reports
async fn pump_adapter_events(shared: Arc<Shared>, adapter: Adapter) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to subscribe to adapter events: {}", e);
            shared.adapter_lost();
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                advertise(&shared, &adapter, &id).await;
            }
            CentralEvent::DeviceDisconnected(id) => link_lost(&shared, &id),
            CentralEvent::StateUpdate(state) => {
                let state = convert::adapter_state(state);
                info!("BLE adapter is now {}", state);
                shared.update_adapter_state(state);
            }
            other => trace!("Ignoring adapter event: {:?}", other),
        }
    }

    shared.adapter_lost();
}

async fn advertise(shared: &Shared, adapter: &Adapter, id: &PeripheralId) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            debug!("Advertising peripheral vanished: {}", e);
            return;
        }
    };
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        Ok(None) => return,
        Err(e) => {
            debug!("Failed to read advertisement properties: {}", e);
            return;
        }
    };

    let device = convert::device_id(id);
    lock(&shared.peripherals).insert(device.clone(), peripheral);
    shared.emit(TransportEvent::Advertisement(convert::advertisement(device, props)));
}

fn link_lost(shared: &Shared, id: &PeripheralId) {
    let device = convert::device_id(id);
    match shared.state(&device) {
        PeripheralState::Connected => {
            warn!("Lost connection to {}", device);
            shared.set_state(&device, PeripheralState::Disconnected);
            shared.emit(TransportEvent::Disconnected {
                device,
                error: Some(TransportError::new("connection lost")),
            });
        }
        // A requested disconnect reports itself once the platform call returns
        PeripheralState::Disconnecting => trace!("{} went down during disconnect", device),
        _ => trace!("{} disconnected while not connected", device),
    }
}

/// Forward notifications and indications of a connected peripheral
async fn pump_notifications(shared: Arc<Shared>, device: DeviceId, peripheral: PlatformPeripheral) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to open notification stream for {}: {}", device, e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        let characteristic = peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == notification.uuid)
            .map(|c| CharacteristicId::new(c.service_uuid, c.uuid));
        let Some(characteristic) = characteristic else {
            trace!("Notification for unknown characteristic {}", notification.uuid);
            continue;
        };
        shared.emit(TransportEvent::CharacteristicValueUpdated {
            device: device.clone(),
            characteristic,
            result: Ok(notification.value),
        });
    }

    debug!("Notification stream for {} ended", device);
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

async fn ensure_discovered(peripheral: &PlatformPeripheral) -> Result<(), TransportError> {
    if peripheral.services().is_empty() {
        peripheral.discover_services().await.map_err(platform_error)?;
    }
    Ok(())
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    id: &CharacteristicId,
) -> Result<PlatformCharacteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| convert::matches_characteristic(c, id))
        .ok_or_else(|| TransportError::new(format!("characteristic {} not found", id)))
}

fn find_descriptor(peripheral: &PlatformPeripheral, id: &DescriptorId) -> Result<PlatformDescriptor, TransportError> {
    let characteristic = find_characteristic(peripheral, &id.characteristic_id())?;
    characteristic
        .descriptors
        .into_iter()
        .find(|d| convert::matches_descriptor(d, id))
        .ok_or_else(|| TransportError::new(format!("descriptor {} not found", id)))
}

async fn discover_services(
    peripheral: Result<PlatformPeripheral, TransportError>,
    filter: Option<Vec<Uuid>>,
) -> Result<Vec<Service>, TransportError> {
    let peripheral = peripheral?;
    peripheral.discover_services().await.map_err(platform_error)?;
    Ok(peripheral
        .services()
        .iter()
        .filter(|s| convert::passes(filter.as_deref(), &s.uuid))
        .map(convert::service)
        .collect())
}

async fn discover_characteristics(
    peripheral: Result<PlatformPeripheral, TransportError>,
    service: Uuid,
    filter: Option<Vec<Uuid>>,
) -> Result<Vec<Characteristic>, TransportError> {
    let peripheral = peripheral?;
    ensure_discovered(&peripheral).await?;
    let services = peripheral.services();
    let found = services
        .iter()
        .find(|s| s.uuid == service)
        .ok_or_else(|| TransportError::new(format!("service {} not found", service)))?;
    Ok(found
        .characteristics
        .iter()
        .filter(|c| convert::passes(filter.as_deref(), &c.uuid))
        .map(convert::characteristic)
        .collect())
}

async fn discover_descriptors(
    peripheral: Result<PlatformPeripheral, TransportError>,
    characteristic: CharacteristicId,
) -> Result<Vec<Descriptor>, TransportError> {
    let peripheral = peripheral?;
    ensure_discovered(&peripheral).await?;
    let found = find_characteristic(&peripheral, &characteristic)?;
    Ok(found.descriptors.iter().map(convert::descriptor).collect())
}

async fn set_notify(
    peripheral: Result<PlatformPeripheral, TransportError>,
    characteristic: CharacteristicId,
    enabled: bool,
) -> Result<bool, TransportError> {
    let peripheral = peripheral?;
    let target = find_characteristic(&peripheral, &characteristic)?;
    if enabled {
        peripheral.subscribe(&target).await.map_err(platform_error)?;
    } else {
        peripheral.unsubscribe(&target).await.map_err(platform_error)?;
    }
    Ok(enabled)
}

async fn read_characteristic(
    peripheral: Result<PlatformPeripheral, TransportError>,
    characteristic: CharacteristicId,
) -> Result<Vec<u8>, TransportError> {
    let peripheral = peripheral?;
    let target = find_characteristic(&peripheral, &characteristic)?;
    peripheral.read(&target).await.map_err(platform_error)
}

async fn write_characteristic(
    peripheral: Result<PlatformPeripheral, TransportError>,
    characteristic: CharacteristicId,
    data: Vec<u8>,
    write_type: PlatformWriteType,
) -> Result<(), TransportError> {
    let peripheral = peripheral?;
    let target = find_characteristic(&peripheral, &characteristic)?;
    peripheral.write(&target, &data, write_type).await.map_err(platform_error)
}

async fn read_descriptor(
    peripheral: Result<PlatformPeripheral, TransportError>,
    descriptor: DescriptorId,
) -> Result<Vec<u8>, TransportError> {
    let peripheral = peripheral?;
    let target = find_descriptor(&peripheral, &descriptor)?;
    peripheral.read_descriptor(&target).await.map_err(platform_error)
}

async fn write_descriptor(
    peripheral: Result<PlatformPeripheral, TransportError>,
    descriptor: DescriptorId,
    data: Vec<u8>,
) -> Result<(), TransportError> {
    let peripheral = peripheral?;
    let target = find_descriptor(&peripheral, &descriptor)?;
    peripheral.write_descriptor(&target, &data).await.map_err(platform_error)
}

async fn read_rssi(peripheral: Result<PlatformPeripheral, TransportError>) -> Result<i16, TransportError> {
    let peripheral = peripheral?;
    let props = peripheral.properties().await.map_err(platform_error)?;
    Ok(props.and_then(|p| p.rssi).unwrap_or(RSSI_UNAVAILABLE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn shared() -> (Shared, mpsc::UnboundedReceiver<TransportEvent>) {
        let (sink, events) = EventSink::channel();
        let shared = Shared {
            sink: Mutex::new(Some(sink)),
            adapter_state: Mutex::new(AdapterState::PoweredOn),
            generation: AtomicU64::new(1),
            peripherals: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        };
        (shared, events)
    }

    #[test]
    fn test_power_changes_are_reported() {
        let (shared, mut events) = shared();
        let device = DeviceId::new("hci0/dev_00_11_22_33_44_55");
        shared.set_state(&device, PeripheralState::Connected);

        shared.update_adapter_state(AdapterState::PoweredOff);
        assert_eq!(shared.generation(), 2);
        assert_eq!(shared.state(&device), PeripheralState::Disconnected);
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::AdapterStateChanged(AdapterState::PoweredOff))
        ));

        // Repeats are not reported
        shared.update_adapter_state(AdapterState::PoweredOff);
        assert!(events.try_recv().is_err());

        shared.update_adapter_state(AdapterState::PoweredOn);
        assert_eq!(shared.generation(), 2);
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn))
        ));
        assert_eq!(*lock(&shared.adapter_state), AdapterState::PoweredOn);
    }
}
