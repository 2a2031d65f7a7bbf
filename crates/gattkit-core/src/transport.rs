//! BLE transport abstraction
//!
//! The orchestration layer never talks to a Bluetooth stack directly. It
//! drives a [`BleTransport`], whose methods only *submit* requests, and
//! receives every result as a [`TransportEvent`] through the [`EventSink`]
//! handed over in [`BleTransport::attach`].
//!
//! ## Contract
//!
//! - Request methods must not block and must not emit events synchronously
//!   from inside the call.
//! - Every request eventually produces at most one matching event, or none at
//!   all when the stack silently drops it (the watchdogs cover that case).
//! - Unsolicited events (disconnects, notifications, adapter power changes,
//!   advertisements) may arrive at any time.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::attributes::{Characteristic, Descriptor, Service};
use crate::error::TransportError;
use crate::types::{
    AdapterState, CharacteristicId, ConnectOptions, DescriptorId, DeviceId, PeripheralHandle,
    PeripheralState, WriteType,
};

/// Signal strength value some stacks report when no reading is available
pub const RSSI_UNAVAILABLE: i16 = 127;

/// Map a raw signal-strength reading, treating the sentinel as missing
pub fn normalize_rssi(raw: i16) -> Option<i16> {
    (raw != RSSI_UNAVAILABLE).then_some(raw)
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Advertisement observed while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub device: DeviceId,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub is_connectable: bool,
    pub received_at: Instant,
}

impl Advertisement {
    pub fn new(device: DeviceId, rssi: i16) -> Self {
        Self {
            device,
            local_name: None,
            rssi,
            service_uuids: Vec::new(),
            manufacturer_data: HashMap::new(),
            is_connectable: true,
            received_at: Instant::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }
}

/// Everything a transport reports back to the central
#[derive(Debug, Clone)]
pub enum TransportEvent {
    AdapterStateChanged(AdapterState),
    Advertisement(Advertisement),
    Connected {
        device: DeviceId,
    },
    ConnectFailed {
        device: DeviceId,
        error: Option<TransportError>,
    },
    Disconnected {
        device: DeviceId,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        device: DeviceId,
        result: Result<Vec<Service>, TransportError>,
    },
    IncludedServicesDiscovered {
        device: DeviceId,
        service: Uuid,
        result: Result<Vec<Service>, TransportError>,
    },
    CharacteristicsDiscovered {
        device: DeviceId,
        service: Uuid,
        result: Result<Vec<Characteristic>, TransportError>,
    },
    DescriptorsDiscovered {
        device: DeviceId,
        characteristic: CharacteristicId,
        result: Result<Vec<Descriptor>, TransportError>,
    },
    NotifyStateUpdated {
        device: DeviceId,
        characteristic: CharacteristicId,
        result: Result<bool, TransportError>,
    },
    /// Result of a read, or an unsolicited notification/indication
    CharacteristicValueUpdated {
        device: DeviceId,
        characteristic: CharacteristicId,
        result: Result<Vec<u8>, TransportError>,
    },
    CharacteristicWritten {
        device: DeviceId,
        characteristic: CharacteristicId,
        result: Result<(), TransportError>,
    },
    DescriptorValueUpdated {
        device: DeviceId,
        descriptor: DescriptorId,
        result: Result<Vec<u8>, TransportError>,
    },
    DescriptorWritten {
        device: DeviceId,
        descriptor: DescriptorId,
        result: Result<(), TransportError>,
    },
    RssiRead {
        device: DeviceId,
        result: Result<i16, TransportError>,
    },
}

impl TransportEvent {
    /// Peripheral the event concerns, if any
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::AdapterStateChanged(_) => None,
            Self::Advertisement(adv) => Some(&adv.device),
            Self::Connected { device }
            | Self::ConnectFailed { device, .. }
            | Self::Disconnected { device, .. }
            | Self::ServicesDiscovered { device, .. }
            | Self::IncludedServicesDiscovered { device, .. }
            | Self::CharacteristicsDiscovered { device, .. }
            | Self::DescriptorsDiscovered { device, .. }
            | Self::NotifyStateUpdated { device, .. }
            | Self::CharacteristicValueUpdated { device, .. }
            | Self::CharacteristicWritten { device, .. }
            | Self::DescriptorValueUpdated { device, .. }
            | Self::DescriptorWritten { device, .. }
            | Self::RssiRead { device, .. } => Some(device),
        }
    }
}

/// Channel through which a transport reports events to the central
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post an event. Returns `false` once the central has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Request side of a BLE central stack
pub trait BleTransport: Send + Sync + 'static {
    /// Install the sink that receives every subsequent event
    fn attach(&self, sink: EventSink);

    fn adapter_state(&self) -> AdapterState;

    fn peripheral_state(&self, device: &DeviceId) -> PeripheralState;

    /// Look up a fresh handle for `device`; `None` when the stack does not
    /// know the device (anymore)
    fn resolve(&self, device: &DeviceId) -> Option<PeripheralHandle>;

    fn connect(&self, peripheral: &PeripheralHandle, options: &ConnectOptions);

    fn cancel_connection(&self, peripheral: &PeripheralHandle);

    fn discover_services(&self, device: &DeviceId, filter: Option<&[Uuid]>);

    fn discover_included_services(&self, device: &DeviceId, service: Uuid, filter: Option<&[Uuid]>);

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, filter: Option<&[Uuid]>);

    fn discover_descriptors(&self, device: &DeviceId, characteristic: CharacteristicId);

    fn set_notify(&self, device: &DeviceId, characteristic: CharacteristicId, enabled: bool);

    fn read_characteristic(&self, device: &DeviceId, characteristic: CharacteristicId);

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    );

    fn read_descriptor(&self, device: &DeviceId, descriptor: DescriptorId);

    fn write_descriptor(&self, device: &DeviceId, descriptor: DescriptorId, data: &[u8]);

    fn read_rssi(&self, device: &DeviceId);

    fn start_scan(&self, services: Option<&[Uuid]>, allow_duplicates: bool);

    fn stop_scan(&self);
}
