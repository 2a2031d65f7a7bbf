//! Scriptable in-memory transport
//!
//! Simulates a set of peripherals with full attribute trees. Every request is
//! recorded, and each kind of request can be scripted per attribute to answer
//! after a delay, fail, or never answer at all. Answers are delivered from
//! spawned tasks so they are never synchronous with the request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;
use uuid::Uuid;

use crate::attributes::Service;
use crate::error::TransportError;
use crate::transport::{Advertisement, BleTransport, EventSink, TransportEvent};
use crate::types::{
    AdapterState, CharacteristicId, ConnectOptions, DescriptorId, DeviceId, PeripheralHandle,
    PeripheralState, WriteType,
};

/// Request kinds that can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    CancelConnection,
    DiscoverServices,
    DiscoverIncludedServices(Uuid),
    DiscoverCharacteristics(Uuid),
    DiscoverDescriptors(CharacteristicId),
    SetNotify(CharacteristicId),
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic(CharacteristicId),
    ReadDescriptor(DescriptorId),
    WriteDescriptor(DescriptorId),
    ReadRssi,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Answer successfully after the delay
    Respond { after: Duration },
    /// Answer with an error after the delay
    Fail { after: Duration, error: TransportError },
    /// Never answer
    Ignore,
}

/// Request as received by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId, Option<Vec<Uuid>>),
    DiscoverIncludedServices(DeviceId, Uuid),
    DiscoverCharacteristics(DeviceId, Uuid, Option<Vec<Uuid>>),
    DiscoverDescriptors(DeviceId, CharacteristicId),
    SetNotify(DeviceId, CharacteristicId, bool),
    ReadCharacteristic(DeviceId, CharacteristicId),
    WriteCharacteristic(DeviceId, CharacteristicId, Vec<u8>, WriteType),
    ReadDescriptor(DeviceId, DescriptorId),
    WriteDescriptor(DeviceId, DescriptorId, Vec<u8>),
    ReadRssi(DeviceId),
    StartScan(Option<Vec<Uuid>>, bool),
    StopScan,
}

impl MockCall {
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Connect(d)
            | Self::CancelConnection(d)
            | Self::DiscoverServices(d, _)
            | Self::DiscoverIncludedServices(d, _)
            | Self::DiscoverCharacteristics(d, _, _)
            | Self::DiscoverDescriptors(d, _)
            | Self::SetNotify(d, _, _)
            | Self::ReadCharacteristic(d, _)
            | Self::WriteCharacteristic(d, _, _, _)
            | Self::ReadDescriptor(d, _)
            | Self::WriteDescriptor(d, _, _)
            | Self::ReadRssi(d) => Some(d),
            Self::StartScan(..) | Self::StopScan => None,
        }
    }
}

struct MockDevice {
    services: Vec<Service>,
    state: PeripheralState,
    connect_attempt: u64,
    values: HashMap<CharacteristicId, Vec<u8>>,
    descriptor_values: HashMap<DescriptorId, Vec<u8>>,
    rssi: i16,
}

impl MockDevice {
    fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }
}

struct MockState {
    sink: Option<EventSink>,
    adapter: AdapterState,
    epoch: u64,
    latency: Duration,
    devices: HashMap<DeviceId, MockDevice>,
    behaviors: HashMap<(DeviceId, MockOp), MockBehavior>,
    calls: Vec<MockCall>,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Powered-on adapter, no peripherals, 10 ms answer latency
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                sink: None,
                adapter: AdapterState::PoweredOn,
                epoch: 1,
                latency: Duration::from_millis(10),
                devices: HashMap::new(),
                behaviors: HashMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Add a peripheral with its complete attribute tree
    pub fn add_device(&self, device: impl Into<DeviceId>, services: Vec<Service>) {
        self.lock().devices.insert(
            device.into(),
            MockDevice {
                services,
                state: PeripheralState::Disconnected,
                connect_attempt: 0,
                values: HashMap::new(),
                descriptor_values: HashMap::new(),
                rssi: -60,
            },
        );
    }

    /// Remove a peripheral; it no longer resolves
    pub fn forget(&self, device: &DeviceId) {
        self.lock().devices.remove(device);
    }

    pub fn set_value(&self, device: &DeviceId, characteristic: CharacteristicId, value: impl Into<Vec<u8>>) {
        if let Some(d) = self.lock().devices.get_mut(device) {
            d.values.insert(characteristic, value.into());
        }
    }

    pub fn value(&self, device: &DeviceId, characteristic: &CharacteristicId) -> Option<Vec<u8>> {
        self.lock().devices.get(device)?.values.get(characteristic).cloned()
    }

    pub fn set_descriptor_value(&self, device: &DeviceId, descriptor: DescriptorId, value: impl Into<Vec<u8>>) {
        if let Some(d) = self.lock().devices.get_mut(device) {
            d.descriptor_values.insert(descriptor, value.into());
        }
    }

    pub fn set_rssi(&self, device: &DeviceId, rssi: i16) {
        if let Some(d) = self.lock().devices.get_mut(device) {
            d.rssi = rssi;
        }
    }

    pub fn script(&self, device: &DeviceId, op: MockOp, behavior: MockBehavior) {
        self.lock().behaviors.insert((device.clone(), op), behavior);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(*call)).count()
    }

    // ------------------------------------------------------------------------
    // Unsolicited Events
    // ------------------------------------------------------------------------

    /// Change adapter power. Leaving the powered-on state drops every link
    /// silently and invalidates previously resolved handles.
    pub fn set_adapter_state(&self, adapter: AdapterState) {
        let sink = {
            let mut state = self.lock();
            state.adapter = adapter;
            if !adapter.is_powered_on() {
                state.epoch += 1;
                for device in state.devices.values_mut() {
                    device.state = PeripheralState::Disconnected;
                    device.connect_attempt += 1;
                }
            }
            state.sink.clone()
        };
        emit(&sink, TransportEvent::AdapterStateChanged(adapter));
    }

    /// Drop the link as if the peripheral went out of range
    pub fn drop_link(&self, device: &DeviceId, error: Option<TransportError>) {
        let sink = {
            let mut state = self.lock();
            if let Some(d) = state.devices.get_mut(device) {
                d.state = PeripheralState::Disconnected;
                d.connect_attempt += 1;
            }
            state.sink.clone()
        };
        emit(
            &sink,
            TransportEvent::Disconnected {
                device: device.clone(),
                error,
            },
        );
    }

    /// Push a notification for `characteristic`
    pub fn notify(&self, device: &DeviceId, characteristic: CharacteristicId, value: impl Into<Vec<u8>>) {
        let value = value.into();
        let sink = {
            let mut state = self.lock();
            if let Some(d) = state.devices.get_mut(device) {
                d.values.insert(characteristic, value.clone());
            }
            state.sink.clone()
        };
        emit(
            &sink,
            TransportEvent::CharacteristicValueUpdated {
                device: device.clone(),
                characteristic,
                result: Ok(value),
            },
        );
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        let sink = self.lock().sink.clone();
        emit(&sink, TransportEvent::Advertisement(advertisement));
    }

    // ------------------------------------------------------------------------
    // Answering
    // ------------------------------------------------------------------------

    /// Record `call` and schedule the answer for `op` according to its script.
    ///
    /// `success` builds the event from the simulated device at answer time.
    fn answer<S, F>(&self, call: MockCall, device: &DeviceId, op: MockOp, success: S, failure: F)
    where
        S: FnOnce(&mut MockState) -> Option<TransportEvent> + Send + 'static,
        F: FnOnce(TransportError) -> TransportEvent + Send + 'static,
    {
        let behavior = {
            let mut state = self.lock();
            trace!("Mock transport received {:?}", call);
            state.calls.push(call);
            state
                .behaviors
                .get(&(device.clone(), op))
                .cloned()
                .unwrap_or(MockBehavior::Respond { after: state.latency })
        };

        let shared = self.state.clone();
        match behavior {
            MockBehavior::Respond { after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let (sink, event) = {
                        let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
                        let event = success(&mut *state);
                        (state.sink.clone(), event)
                    };
                    if let Some(event) = event {
                        emit(&sink, event);
                    }
                });
            }
            MockBehavior::Fail { after, error } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let sink = shared.lock().unwrap_or_else(|p| p.into_inner()).sink.clone();
                    emit(&sink, failure(error));
                });
            }
            MockBehavior::Ignore => {}
        }
    }
}

fn emit(sink: &Option<EventSink>, event: TransportEvent) {
    if let Some(sink) = sink {
        sink.emit(event);
    }
}

fn unknown_device(device: &DeviceId) -> TransportError {
    TransportError::new(format!("unknown peripheral {}", device))
}

impl BleTransport for MockTransport {
    fn attach(&self, sink: EventSink) {
        self.lock().sink = Some(sink);
    }

    fn adapter_state(&self) -> AdapterState {
        self.lock().adapter
    }

    fn peripheral_state(&self, device: &DeviceId) -> PeripheralState {
        self.lock()
            .devices
            .get(device)
            .map(|d| d.state)
            .unwrap_or(PeripheralState::Disconnected)
    }

    fn resolve(&self, device: &DeviceId) -> Option<PeripheralHandle> {
        let state = self.lock();
        state
            .devices
            .contains_key(device)
            .then(|| PeripheralHandle::new(device.clone(), state.epoch))
    }

    fn connect(&self, peripheral: &PeripheralHandle, _options: &ConnectOptions) {
        let device = peripheral.device().clone();
        let (stale, attempt) = {
            let mut state = self.lock();
            let stale = peripheral.token() != state.epoch;
            let attempt = match state.devices.get_mut(&device) {
                Some(d) if !stale => {
                    d.state = PeripheralState::Connecting;
                    d.connect_attempt += 1;
                    d.connect_attempt
                }
                _ => 0,
            };
            (stale, attempt)
        };

        let (key, failed_device) = (device.clone(), device.clone());
        self.answer(
            MockCall::Connect(device.clone()),
            &key,
            MockOp::Connect,
            move |state| {
                let d = state.devices.get_mut(&device)?;
                if stale {
                    return Some(TransportEvent::ConnectFailed {
                        device,
                        error: Some(TransportError::new("stale peripheral handle")),
                    });
                }
                if d.connect_attempt != attempt {
                    return None;
                }
                d.state = PeripheralState::Connected;
                Some(TransportEvent::Connected { device })
            },
            move |error| {
                TransportEvent::ConnectFailed {
                    device: failed_device,
                    error: Some(error),
                }
            },
        );
    }

    fn cancel_connection(&self, peripheral: &PeripheralHandle) {
        let device = peripheral.device().clone();
        let (key, failed_device) = (device.clone(), device.clone());
        self.answer(
            MockCall::CancelConnection(device.clone()),
            &key,
            MockOp::CancelConnection,
            move |state| {
                let d = state.devices.get_mut(&device)?;
                d.state = PeripheralState::Disconnected;
                d.connect_attempt += 1;
                Some(TransportEvent::Disconnected { device, error: None })
            },
            move |error| TransportEvent::Disconnected {
                device: failed_device,
                error: Some(error),
            },
        );
    }

    fn discover_services(&self, device: &DeviceId, filter: Option<&[Uuid]>) {
        let filter = filter.map(<[Uuid]>::to_vec);
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::DiscoverServices(device.clone(), filter.clone()),
            device,
            MockOp::DiscoverServices,
            move |state| {
                let result = match state.devices.get(&id) {
                    Some(d) => Ok(d
                        .services
                        .iter()
                        .filter(|s| filter.as_ref().map_or(true, |f| f.contains(&s.uuid)))
                        .map(Service::shallow)
                        .collect()),
                    None => Err(unknown_device(&id)),
                };
                Some(TransportEvent::ServicesDiscovered { device: id, result })
            },
            move |error| TransportEvent::ServicesDiscovered {
                device: failed,
                result: Err(error),
            },
        );
    }

    fn discover_included_services(&self, device: &DeviceId, service: Uuid, _filter: Option<&[Uuid]>) {
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::DiscoverIncludedServices(device.clone(), service),
            device,
            MockOp::DiscoverIncludedServices(service),
            move |state| {
                let result = state
                    .devices
                    .get(&id)
                    .and_then(|d| d.service(&service))
                    .map(|s| s.included_services.iter().map(Service::shallow).collect())
                    .ok_or_else(|| TransportError::new(format!("unknown service {}", service)));
                Some(TransportEvent::IncludedServicesDiscovered {
                    device: id,
                    service,
                    result,
                })
            },
            move |error| TransportEvent::IncludedServicesDiscovered {
                device: failed,
                service,
                result: Err(error),
            },
        );
    }

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, filter: Option<&[Uuid]>) {
        let filter = filter.map(<[Uuid]>::to_vec);
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::DiscoverCharacteristics(device.clone(), service, filter.clone()),
            device,
            MockOp::DiscoverCharacteristics(service),
            move |state| {
                let result = state
                    .devices
                    .get(&id)
                    .and_then(|d| d.service(&service))
                    .map(|s| {
                        s.characteristics
                            .iter()
                            .filter(|c| filter.as_ref().map_or(true, |f| f.contains(&c.uuid)))
                            .map(|c| c.shallow())
                            .collect()
                    })
                    .ok_or_else(|| TransportError::new(format!("unknown service {}", service)));
                Some(TransportEvent::CharacteristicsDiscovered {
                    device: id,
                    service,
                    result,
                })
            },
            move |error| TransportEvent::CharacteristicsDiscovered {
                device: failed,
                service,
                result: Err(error),
            },
        );
    }

    fn discover_descriptors(&self, device: &DeviceId, characteristic: CharacteristicId) {
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::DiscoverDescriptors(device.clone(), characteristic),
            device,
            MockOp::DiscoverDescriptors(characteristic),
            move |state| {
                let result = state
                    .devices
                    .get(&id)
                    .and_then(|d| d.service(&characteristic.service))
                    .and_then(|s| s.characteristic(&characteristic.characteristic))
                    .map(|c| c.descriptors.clone())
                    .ok_or_else(|| TransportError::new(format!("unknown characteristic {}", characteristic)));
                Some(TransportEvent::DescriptorsDiscovered {
                    device: id,
                    characteristic,
                    result,
                })
            },
            move |error| TransportEvent::DescriptorsDiscovered {
                device: failed,
                characteristic,
                result: Err(error),
            },
        );
    }

    fn set_notify(&self, device: &DeviceId, characteristic: CharacteristicId, enabled: bool) {
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::SetNotify(device.clone(), characteristic, enabled),
            device,
            MockOp::SetNotify(characteristic),
            move |_| {
                Some(TransportEvent::NotifyStateUpdated {
                    device: id,
                    characteristic,
                    result: Ok(enabled),
                })
            },
            move |error| TransportEvent::NotifyStateUpdated {
                device: failed,
                characteristic,
                result: Err(error),
            },
        );
    }

    fn read_characteristic(&self, device: &DeviceId, characteristic: CharacteristicId) {
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::ReadCharacteristic(device.clone(), characteristic),
            device,
            MockOp::ReadCharacteristic(characteristic),
            move |state| {
                let value = state
                    .devices
                    .get(&id)
                    .and_then(|d| d.values.get(&characteristic).cloned())
                    .unwrap_or_default();
                Some(TransportEvent::CharacteristicValueUpdated {
                    device: id,
                    characteristic,
                    result: Ok(value),
                })
            },
            move |error| TransportEvent::CharacteristicValueUpdated {
                device: failed,
                characteristic,
                result: Err(error),
            },
        );
    }

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) {
        let call = MockCall::WriteCharacteristic(device.clone(), characteristic, data.to_vec(), write_type);
        if write_type == WriteType::WithoutResponse {
            let mut state = self.lock();
            state.calls.push(call);
            if let Some(d) = state.devices.get_mut(device) {
                d.values.insert(characteristic, data.to_vec());
            }
            return;
        }

        let data = data.to_vec();
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            call,
            device,
            MockOp::WriteCharacteristic(characteristic),
            move |state| {
                if let Some(d) = state.devices.get_mut(&id) {
                    d.values.insert(characteristic, data);
                }
                Some(TransportEvent::CharacteristicWritten {
                    device: id,
                    characteristic,
                    result: Ok(()),
                })
            },
            move |error| TransportEvent::CharacteristicWritten {
                device: failed,
                characteristic,
                result: Err(error),
            },
        );
    }

    fn read_descriptor(&self, device: &DeviceId, descriptor: DescriptorId) {
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::ReadDescriptor(device.clone(), descriptor),
            device,
            MockOp::ReadDescriptor(descriptor),
            move |state| {
                let value = state
                    .devices
                    .get(&id)
                    .and_then(|d| d.descriptor_values.get(&descriptor).cloned())
                    .unwrap_or_default();
                Some(TransportEvent::DescriptorValueUpdated {
                    device: id,
                    descriptor,
                    result: Ok(value),
                })
            },
            move |error| TransportEvent::DescriptorValueUpdated {
                device: failed,
                descriptor,
                result: Err(error),
            },
        );
    }

    fn write_descriptor(&self, device: &DeviceId, descriptor: DescriptorId, data: &[u8]) {
        let data = data.to_vec();
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::WriteDescriptor(device.clone(), descriptor, data.clone()),
            device,
            MockOp::WriteDescriptor(descriptor),
            move |state| {
                if let Some(d) = state.devices.get_mut(&id) {
                    d.descriptor_values.insert(descriptor, data);
                }
                Some(TransportEvent::DescriptorWritten {
                    device: id,
                    descriptor,
                    result: Ok(()),
                })
            },
            move |error| TransportEvent::DescriptorWritten {
                device: failed,
                descriptor,
                result: Err(error),
            },
        );
    }

    fn read_rssi(&self, device: &DeviceId) {
        let (id, failed) = (device.clone(), device.clone());
        self.answer(
            MockCall::ReadRssi(device.clone()),
            device,
            MockOp::ReadRssi,
            move |state| {
                let result = state
                    .devices
                    .get(&id)
                    .map(|d| d.rssi)
                    .ok_or_else(|| unknown_device(&id));
                Some(TransportEvent::RssiRead { device: id, result })
            },
            move |error| TransportEvent::RssiRead {
                device: failed,
                result: Err(error),
            },
        );
    }

    fn start_scan(&self, services: Option<&[Uuid]>, allow_duplicates: bool) {
        self.lock()
            .calls
            .push(MockCall::StartScan(services.map(<[Uuid]>::to_vec), allow_duplicates));
    }

    fn stop_scan(&self) {
        self.lock().calls.push(MockCall::StopScan);
    }
}
