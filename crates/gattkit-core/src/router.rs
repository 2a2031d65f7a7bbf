//! Routes asynchronous transport completions back to the operation that is
//! waiting for them
//!
//! Each pending operation is registered under an [`OperationKey`] and removed
//! by whichever terminal trigger arrives first (transport event, watchdog
//! expiry or teardown). Removal is the only way to reach the completion, which
//! is what guarantees exactly-once delivery. Notification listeners are kept
//! separately: they are persistent and fire on every value update.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::attributes::{Characteristic, Descriptor, Service};
use crate::error::{BleError, BleResult, TransportError};
use crate::types::{CharacteristicId, DescriptorId};

// ----------------------------------------------------------------------------
// Keys and Outcomes
// ----------------------------------------------------------------------------

/// Identifies one in-flight primitive operation on a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKey {
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

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiscoverServices => write!(f, "discover services"),
            Self::DiscoverIncludedServices(s) => write!(f, "discover included services of {}", s),
            Self::DiscoverCharacteristics(s) => write!(f, "discover characteristics of {}", s),
            Self::DiscoverDescriptors(c) => write!(f, "discover descriptors of {}", c),
            Self::SetNotify(c) => write!(f, "set notify on {}", c),
            Self::ReadCharacteristic(c) => write!(f, "read {}", c),
            Self::WriteCharacteristic(c) => write!(f, "write {}", c),
            Self::ReadDescriptor(d) => write!(f, "read descriptor {}", d),
            Self::WriteDescriptor(d) => write!(f, "write descriptor {}", d),
            Self::ReadRssi => write!(f, "read rssi"),
        }
    }
}

/// Successful result of a primitive operation
#[derive(Debug, Clone)]
pub enum Outcome {
    Services(Vec<Service>),
    Characteristics(Vec<Characteristic>),
    Descriptors(Vec<Descriptor>),
    Characteristic(Characteristic),
    Descriptor(Descriptor),
    Rssi(Option<i16>),
}

// ----------------------------------------------------------------------------
// Completions
// ----------------------------------------------------------------------------

/// Typed continuation of a pending operation
#[derive(Debug)]
pub enum Completion {
    Services(oneshot::Sender<BleResult<Vec<Service>>>),
    Characteristics(oneshot::Sender<BleResult<Vec<Characteristic>>>),
    Descriptors(oneshot::Sender<BleResult<Vec<Descriptor>>>),
    Characteristic(oneshot::Sender<BleResult<Characteristic>>),
    Descriptor(oneshot::Sender<BleResult<Descriptor>>),
    Rssi(oneshot::Sender<BleResult<Option<i16>>>),
    /// Signal strength reads issued by the polling timer
    RssiUpdates(mpsc::UnboundedSender<BleResult<Option<i16>>>),
}

impl Completion {
    /// Deliver a terminal result.
    ///
    /// Returns `false` when the waiting side has already gone away.
    pub fn deliver(self, result: BleResult<Outcome>) -> bool {
        match result {
            Err(err) => self.fail(err),
            Ok(outcome) => match (self, outcome) {
                (Self::Services(tx), Outcome::Services(v)) => tx.send(Ok(v)).is_ok(),
                (Self::Characteristics(tx), Outcome::Characteristics(v)) => tx.send(Ok(v)).is_ok(),
                (Self::Descriptors(tx), Outcome::Descriptors(v)) => tx.send(Ok(v)).is_ok(),
                (Self::Characteristic(tx), Outcome::Characteristic(v)) => tx.send(Ok(v)).is_ok(),
                (Self::Descriptor(tx), Outcome::Descriptor(v)) => tx.send(Ok(v)).is_ok(),
                (Self::Rssi(tx), Outcome::Rssi(v)) => tx.send(Ok(v)).is_ok(),
                (Self::RssiUpdates(tx), Outcome::Rssi(v)) => tx.send(Ok(v)).is_ok(),
                (completion, outcome) => {
                    debug!("Mismatched outcome {:?} for completion {:?}", outcome, completion);
                    completion.fail(BleError::OperationFailed(TransportError::new(
                        "transport reported an unexpected result kind",
                    )))
                }
            },
        }
    }

    pub fn fail(self, err: BleError) -> bool {
        match self {
            Self::Services(tx) => tx.send(Err(err)).is_ok(),
            Self::Characteristics(tx) => tx.send(Err(err)).is_ok(),
            Self::Descriptors(tx) => tx.send(Err(err)).is_ok(),
            Self::Characteristic(tx) => tx.send(Err(err)).is_ok(),
            Self::Descriptor(tx) => tx.send(Err(err)).is_ok(),
            Self::Rssi(tx) => tx.send(Err(err)).is_ok(),
            Self::RssiUpdates(tx) => tx.send(Err(err)).is_ok(),
        }
    }
}

#[derive(Debug)]
pub struct PendingOperation {
    pub completion: Completion,
    pub registered_at: Instant,
}

/// Sender half of a characteristic notification stream
pub type NotificationSender = mpsc::UnboundedSender<BleResult<Vec<u8>>>;

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct OperationRouter {
    pending: HashMap<OperationKey, PendingOperation>,
    listeners: HashMap<CharacteristicId, NotificationSender>,
}

impl OperationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completion under `key`.
    ///
    /// Fails, handing the completion back, when an operation with the same key
    /// is already pending.
    pub fn register(&mut self, key: OperationKey, completion: Completion) -> Result<(), Completion> {
        if self.pending.contains_key(&key) {
            return Err(completion);
        }
        self.pending.insert(
            key,
            PendingOperation {
                completion,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove the pending operation for `key`, if any. At most one caller can
    /// ever obtain a given registration.
    pub fn take(&mut self, key: &OperationKey) -> Option<PendingOperation> {
        self.pending.remove(key)
    }

    pub fn is_pending(&self, key: &OperationKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn set_listener(&mut self, characteristic: CharacteristicId, listener: NotificationSender) {
        self.listeners.insert(characteristic, listener);
    }

    pub fn remove_listener(&mut self, characteristic: &CharacteristicId) -> bool {
        self.listeners.remove(characteristic).is_some()
    }

    pub fn has_listener(&self, characteristic: &CharacteristicId) -> bool {
        self.listeners.contains_key(characteristic)
    }

    /// Forward a value update to the persistent listener, dropping the
    /// listener once its stream has been closed.
    pub fn notify_listener(&mut self, characteristic: &CharacteristicId, value: BleResult<Vec<u8>>) -> bool {
        let Some(listener) = self.listeners.get(characteristic) else {
            return false;
        };

        if listener.send(value).is_err() {
            debug!("Notification listener for {} went away", characteristic);
            self.listeners.remove(characteristic);
            return false;
        }
        true
    }

    /// Fail every pending operation with `err` and drop all listeners
    pub fn clear_all(&mut self, err: &BleError) -> usize {
        let count = self.pending.len();
        for (key, pending) in self.pending.drain() {
            debug!("Failing pending {} with {}", key, err);
            pending.completion.fail(err.clone());
        }
        self.listeners.clear();
        count
    }
}
