//! gattkit core
//!
//! Orchestration layer for a Bluetooth Low Energy central: every GATT
//! primitive becomes a timed, exactly-once asynchronous operation, and
//! sessions and scripted operations are built on top of them. The Bluetooth
//! stack itself sits behind the [`BleTransport`] trait.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod attributes;
pub mod central;
pub mod config;
pub mod error;
pub mod mock;
pub mod operation;
pub mod pending;
pub mod peripheral;
pub mod router;
pub mod session;
pub mod timer;
pub mod transport;
pub mod types;
pub mod uuids;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use attributes::{Attribute, AttributeKind, Characteristic, CharacteristicProperties, Descriptor, Service};
pub use central::{CentralManager, NearbyPeripherals, PeripheralSnapshot, ScanUpdates};
pub use config::{defaults, ScanSettings, SessionConfiguration};
pub use error::{BleError, BleResult, ErrorKind, TransportError};
pub use operation::{run_operation, PeripheralOperation};
pub use pending::{Disconnection, Notifications, Pending, RssiUpdates};
pub use peripheral::Peripheral;
pub use session::{ErrorPolicy, PeripheralSession, SessionNotifications, SessionState};
pub use transport::{Advertisement, BleTransport, EventSink, TransportEvent, RSSI_UNAVAILABLE};
pub use types::{
    AdapterState, CharacteristicId, ConnectOptions, DescriptorId, DeviceId, PeripheralHandle,
    PeripheralState, WriteType,
};
