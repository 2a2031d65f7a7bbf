//! Peripheral sessions
//!
//! A session connects to one peripheral, walks its attribute tree and then
//! offers reads, writes and notification listening by characteristic UUID.
//! Every fallible step takes an [`ErrorPolicy`] that decides whether an error
//! ends the session (fatal) or is merely returned to the caller.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attributes::{Characteristic, Descriptor, Service};
use crate::config::SessionConfiguration;
use crate::error::{BleError, BleResult};
use crate::peripheral::Peripheral;
use crate::pending::{Disconnection, Notifications};
use crate::types::CharacteristicId;

// ----------------------------------------------------------------------------
// Error Policy
// ----------------------------------------------------------------------------

/// Decides whether an error ends the session
#[derive(Clone)]
pub struct ErrorPolicy(Arc<dyn Fn(&BleError) -> bool + Send + Sync>);

impl ErrorPolicy {
    pub fn new(is_fatal: impl Fn(&BleError) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(is_fatal))
    }

    /// Every error ends the session
    pub fn fatal() -> Self {
        Self::new(|_| true)
    }

    /// Errors are returned but the session stays up
    pub fn recoverable() -> Self {
        Self::new(|_| false)
    }

    pub fn is_fatal(&self, err: &BleError) -> bool {
        (self.0)(err)
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::fatal()
    }
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorPolicy")
    }
}

// ----------------------------------------------------------------------------
// Integer Encoding
// ----------------------------------------------------------------------------

/// Integers exchanged with peripherals in little-endian byte order
pub trait LeInteger: Copy + Send + Sized {
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
    fn to_le_vec(self) -> Vec<u8>;
}

macro_rules! impl_le_integer {
    ($($ty:ty),*) => {
        $(
            impl LeInteger for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    let bytes: [u8; std::mem::size_of::<$ty>()] = bytes.get(..Self::SIZE)?.try_into().ok()?;
                    Some(<$ty>::from_le_bytes(bytes))
                }

                fn to_le_vec(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_le_integer!(u8, u16, u32, u64, i8, i16, i32, i64);

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Ended,
}

pub struct PeripheralSession {
    peripheral: Peripheral,
    configuration: SessionConfiguration,
    state: SessionState,
    discovered_services: Vec<Service>,
    discovered_characteristics: HashMap<Uuid, Vec<Characteristic>>,
    discovered_descriptors: HashMap<CharacteristicId, Vec<Descriptor>>,
    disconnection: Option<Disconnection>,
    link_error: Option<BleError>,
    end_error: Arc<Mutex<Option<BleError>>>,
}

impl PeripheralSession {
    pub fn new(peripheral: Peripheral, configuration: SessionConfiguration) -> Self {
        Self {
            peripheral,
            configuration,
            state: SessionState::Idle,
            discovered_services: Vec::new(),
            discovered_characteristics: HashMap::new(),
            discovered_descriptors: HashMap::new(),
            disconnection: None,
            link_error: None,
            end_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    pub fn configuration(&self) -> &SessionConfiguration {
        &self.configuration
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn discovered_services(&self) -> &[Service] {
        &self.discovered_services
    }

    pub fn discovered_characteristics(&self) -> &HashMap<Uuid, Vec<Characteristic>> {
        &self.discovered_characteristics
    }

    pub fn discovered_descriptors(&self) -> &HashMap<CharacteristicId, Vec<Descriptor>> {
        &self.discovered_descriptors
    }

    /// First discovered characteristic with the given UUID, in service order
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.discovered_services
            .iter()
            .filter_map(|service| self.discovered_characteristics.get(&service.uuid))
            .flatten()
            .find(|c| c.uuid == *uuid)
    }

    /// The error that ended (or will end) the session, if any
    pub fn end_error(&self) -> Option<BleError> {
        lock(&self.end_error).clone()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect and discover the attribute tree.
    ///
    /// Services are walked first (characteristics of each, in FIFO order) and
    /// only then characteristics (descriptors of each). Any failure ends the
    /// session and is returned.
    pub async fn start(&mut self) -> BleResult<()> {
        if self.state != SessionState::Idle {
            return Err(BleError::invalid_param("session", "session has already been started"));
        }

        info!(device = %self.peripheral.id(), "Starting session");
        match self.peripheral.connect(self.configuration.connect_timeout).await {
            Ok(disconnection) => self.disconnection = Some(disconnection),
            Err(err) => {
                warn!(device = %self.peripheral.id(), "Session connect failed: {}", err);
                record_first(&self.end_error, err.clone());
                self.state = SessionState::Ended;
                return Err(err);
            }
        }
        self.state = SessionState::Active;

        if let Err(err) = self.discover_attributes().await {
            warn!(device = %self.peripheral.id(), "Session discovery failed: {}", err);
            self.end(Some(err.clone())).await;
            return Err(err);
        }

        info!(
            device = %self.peripheral.id(),
            services = self.discovered_services.len(),
            characteristics = self.discovered_descriptors.len(),
            "Session started"
        );
        Ok(())
    }

    async fn discover_attributes(&mut self) -> BleResult<()> {
        let services = self
            .peripheral
            .discover_services(
                self.configuration.services_to_discover.clone(),
                self.configuration.service_discovery_timeout,
            )
            .await?;
        self.discovered_services = services.clone();

        let mut service_queue: VecDeque<Service> = services.into();
        let mut characteristic_queue: VecDeque<CharacteristicId> = VecDeque::new();

        while let Some(service) = service_queue.pop_front() {
            let characteristics = self
                .peripheral
                .discover_characteristics(
                    service.uuid,
                    self.configuration.characteristics_for(&service.uuid),
                    self.configuration.characteristic_discovery_timeout,
                )
                .await?;
            debug!(
                device = %self.peripheral.id(),
                "Service {} has {} characteristics",
                service.uuid,
                characteristics.len()
            );
            characteristic_queue.extend(characteristics.iter().map(Characteristic::id));
            self.discovered_characteristics.insert(service.uuid, characteristics);
        }

        while let Some(characteristic) = characteristic_queue.pop_front() {
            let descriptors = self
                .peripheral
                .discover_descriptors(characteristic, self.configuration.descriptor_discovery_timeout)
                .await?;
            self.discovered_descriptors.insert(characteristic, descriptors);
        }

        Ok(())
    }

    /// End the session, disconnecting if the link is still up.
    ///
    /// Returns the error the session ended with: an error passed here or
    /// recorded earlier takes precedence over the disconnect outcome.
    pub async fn end(&mut self, error: Option<BleError>) -> Option<BleError> {
        if let Some(err) = error {
            record_first(&self.end_error, err);
        }
        if self.state == SessionState::Ended {
            return self.end_error().or_else(|| self.link_error.clone());
        }
        self.state = SessionState::Ended;

        if let Some(mut disconnection) = self.disconnection.take() {
            self.link_error = match disconnection.try_ended() {
                Some(cause) => cause,
                None => {
                    if let Err(err) = self.peripheral.disconnect(self.configuration.disconnect_timeout).await {
                        debug!(device = %self.peripheral.id(), "Disconnect finished with {}", err);
                    }
                    disconnection.await
                }
            };
        }

        let result = self.end_error().or_else(|| self.link_error.clone());
        match &result {
            Some(err) => info!(device = %self.peripheral.id(), "Session ended: {}", err),
            None => info!(device = %self.peripheral.id(), "Session ended"),
        }
        result
    }

    /// Wait until the link ends on its own, returning the disconnect cause
    pub async fn closed(&mut self) -> Option<BleError> {
        if let Some(disconnection) = self.disconnection.as_mut() {
            self.link_error = disconnection.await;
            self.disconnection = None;
        }
        self.link_error.clone()
    }

    // ------------------------------------------------------------------------
    // Interaction
    // ------------------------------------------------------------------------

    pub async fn read(&mut self, characteristic: Uuid, policy: ErrorPolicy) -> BleResult<Option<Vec<u8>>> {
        let result = match self.require(&characteristic) {
            Ok(id) => self
                .peripheral
                .read_value(id, self.configuration.read_timeout)
                .await
                .map(|c| c.value),
            Err(err) => Err(err),
        };
        self.apply(result, &policy).await
    }

    pub async fn write(
        &mut self,
        data: Vec<u8>,
        characteristic: Uuid,
        with_response: bool,
        policy: ErrorPolicy,
    ) -> BleResult<()> {
        let result = match self.require(&characteristic) {
            Ok(id) if with_response => self
                .peripheral
                .write_value(id, data, self.configuration.write_timeout)
                .await
                .map(|_| ()),
            Ok(id) => self.peripheral.write_value_without_response(id, data).await.map(|_| ()),
            Err(err) => Err(err),
        };
        self.apply(result, &policy).await
    }

    /// Enable notifications; errors carried by the returned stream are judged
    /// by the same policy
    pub async fn start_listening(&mut self, characteristic: Uuid, policy: ErrorPolicy) -> BleResult<SessionNotifications> {
        let result = match self.require(&characteristic) {
            Ok(id) => {
                let (enabled, notifications) = self.peripheral.subscribe(id, self.configuration.notify_timeout);
                enabled.await.map(|_| notifications)
            }
            Err(err) => Err(err),
        };

        let notifications = self.apply(result, &policy).await?;
        Ok(SessionNotifications {
            inner: notifications,
            policy,
            peripheral: self.peripheral.clone(),
            configuration: self.configuration.clone(),
            end_error: self.end_error.clone(),
            terminated: false,
        })
    }

    pub async fn stop_listening(&mut self, characteristic: Uuid, policy: ErrorPolicy) -> BleResult<()> {
        let result = match self.require(&characteristic) {
            Ok(id) => self
                .peripheral
                .unsubscribe(id, self.configuration.notify_timeout)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        self.apply(result, &policy).await
    }

    // ------------------------------------------------------------------------
    // Typed Helpers
    // ------------------------------------------------------------------------

    /// Read a UTF-8 string, dropping trailing NUL padding
    pub async fn read_utf8(&mut self, characteristic: Uuid) -> BleResult<Option<String>> {
        let value = self.read(characteristic, ErrorPolicy::default()).await?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string()))
    }

    pub async fn read_integer<T: LeInteger>(&mut self, characteristic: Uuid) -> BleResult<Option<T>> {
        let Some(bytes) = self.read(characteristic, ErrorPolicy::default()).await? else {
            return Ok(None);
        };

        match T::from_le_slice(&bytes) {
            Some(value) => Ok(Some(value)),
            None => {
                let err = BleError::invalid_param(
                    "value",
                    format!("expected {} bytes, received {}", T::SIZE, bytes.len()),
                );
                self.apply(Err(err), &ErrorPolicy::default()).await
            }
        }
    }

    pub async fn read_u8(&mut self, characteristic: Uuid) -> BleResult<Option<u8>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_u16(&mut self, characteristic: Uuid) -> BleResult<Option<u16>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_u32(&mut self, characteristic: Uuid) -> BleResult<Option<u32>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_u64(&mut self, characteristic: Uuid) -> BleResult<Option<u64>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_i8(&mut self, characteristic: Uuid) -> BleResult<Option<i8>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_i16(&mut self, characteristic: Uuid) -> BleResult<Option<i16>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_i32(&mut self, characteristic: Uuid) -> BleResult<Option<i32>> {
        self.read_integer(characteristic).await
    }

    pub async fn read_i64(&mut self, characteristic: Uuid) -> BleResult<Option<i64>> {
        self.read_integer(characteristic).await
    }

    pub async fn write_utf8(&mut self, value: &str, characteristic: Uuid, with_response: bool) -> BleResult<()> {
        self.write(value.as_bytes().to_vec(), characteristic, with_response, ErrorPolicy::default())
            .await
    }

    pub async fn write_integer<T: LeInteger>(&mut self, value: T, characteristic: Uuid, with_response: bool) -> BleResult<()> {
        self.write(value.to_le_vec(), characteristic, with_response, ErrorPolicy::default())
            .await
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn require(&self, characteristic: &Uuid) -> BleResult<CharacteristicId> {
        if self.state != SessionState::Active {
            return Err(BleError::NotConnected);
        }
        self.characteristic(characteristic)
            .map(Characteristic::id)
            .ok_or_else(|| {
                BleError::invalid_param(
                    "characteristic",
                    format!("characteristic {} was not discovered", characteristic),
                )
            })
    }

    async fn apply<T>(&mut self, result: BleResult<T>, policy: &ErrorPolicy) -> BleResult<T> {
        if let Err(err) = &result {
            if policy.is_fatal(err) {
                warn!(device = %self.peripheral.id(), "Fatal session error: {}", err);
                self.end(Some(err.clone())).await;
            } else {
                debug!(device = %self.peripheral.id(), "Recoverable session error: {}", err);
            }
        }
        result
    }
}

impl fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("device", self.peripheral.id())
            .field("state", &self.state)
            .field("services", &self.discovered_services.len())
            .finish()
    }
}

fn lock(cell: &Mutex<Option<BleError>>) -> std::sync::MutexGuard<'_, Option<BleError>> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record_first(cell: &Mutex<Option<BleError>>, err: BleError) {
    let mut slot = lock(cell);
    if slot.is_none() {
        *slot = Some(err);
    }
}

// ----------------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------------

/// Notification stream of a session.
///
/// A fatal error item records the session's end error, requests a disconnect
/// and terminates the stream after yielding the error.
pub struct SessionNotifications {
    inner: Notifications,
    policy: ErrorPolicy,
    peripheral: Peripheral,
    configuration: SessionConfiguration,
    end_error: Arc<Mutex<Option<BleError>>>,
    terminated: bool,
}

impl SessionNotifications {
    pub async fn recv(&mut self) -> Option<BleResult<Vec<u8>>> {
        self.next().await
    }
}

impl Stream for SessionNotifications {
    type Item = BleResult<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Err(err))) => {
                if this.policy.is_fatal(&err) {
                    warn!(device = %this.peripheral.id(), "Fatal notification error: {}", err);
                    record_first(&this.end_error, err.clone());
                    // Dispatched on call; the outcome is observed by the session
                    let _ = this.peripheral.disconnect(this.configuration.disconnect_timeout);
                    this.terminated = true;
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.terminated = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
