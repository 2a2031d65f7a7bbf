//! Nearby-peripheral bookkeeping for scanning

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::pending::Updates;
use crate::transport::{normalize_rssi, Advertisement};
use crate::types::DeviceId;

/// Stream of nearby-peripheral lists produced by a scan
pub type ScanUpdates = Updates<Vec<PeripheralSnapshot>>;

/// What is known about a peripheral from its advertisements
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralSnapshot {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub is_connectable: bool,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub advertisement_count: u64,
}

impl PeripheralSnapshot {
    fn from_advertisement(adv: Advertisement) -> Self {
        Self {
            id: adv.device,
            name: adv.local_name,
            rssi: normalize_rssi(adv.rssi),
            service_uuids: adv.service_uuids,
            manufacturer_data: adv.manufacturer_data,
            is_connectable: adv.is_connectable,
            first_seen: adv.received_at,
            last_seen: adv.received_at,
            advertisement_count: 1,
        }
    }

    fn merge(&mut self, adv: Advertisement) {
        if adv.local_name.is_some() {
            self.name = adv.local_name;
        }
        if let Some(rssi) = normalize_rssi(adv.rssi) {
            self.rssi = Some(rssi);
        }
        for uuid in adv.service_uuids {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
        self.manufacturer_data.extend(adv.manufacturer_data);
        self.is_connectable = adv.is_connectable;
        self.last_seen = adv.received_at;
        self.advertisement_count += 1;
    }

    pub fn time_since_last_update(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// Peripherals observed by the current scan, shared between the execution
/// context (writer) and presentation code (readers)
#[derive(Debug, Clone, Default)]
pub struct NearbyPeripherals {
    inner: Arc<Mutex<HashMap<DeviceId, PeripheralSnapshot>>>,
}

impl NearbyPeripherals {
    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, PeripheralSnapshot>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Record an advertisement and return the updated list
    pub(crate) fn record(&self, adv: Advertisement) -> Vec<PeripheralSnapshot> {
        let mut nearby = self.lock();
        match nearby.get_mut(&adv.device) {
            Some(existing) => existing.merge(adv),
            None => {
                nearby.insert(adv.device.clone(), PeripheralSnapshot::from_advertisement(adv));
            }
        }
        sort_by_signal(nearby.values().cloned().collect())
    }

    pub fn get(&self, device: &DeviceId) -> Option<PeripheralSnapshot> {
        self.lock().get(device).cloned()
    }

    pub fn sorted(&self) -> Vec<PeripheralSnapshot> {
        sort_by_signal(self.lock().values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Strongest signal first; peripherals without a reading go last
fn sort_by_signal(mut peripherals: Vec<PeripheralSnapshot>) -> Vec<PeripheralSnapshot> {
    peripherals.sort_by(|a, b| {
        b.rssi
            .unwrap_or(i16::MIN)
            .cmp(&a.rssi.unwrap_or(i16::MIN))
            .then_with(|| a.id.cmp(&b.id))
    });
    peripherals
}

/// Whether an advertisement passes the scan's service filter
pub(crate) fn matches_filter(settings: &ScanSettings, adv: &Advertisement) -> bool {
    match settings.service_uuids.as_deref() {
        None | Some([]) => true,
        Some(filter) => adv.service_uuids.iter().any(|uuid| filter.contains(uuid)),
    }
}
