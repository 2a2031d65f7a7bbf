//! Shared fixtures for the integration tests
//!
//! Builds a central on top of [`MockTransport`] with a small, known attribute
//! tree so tests can reason about exactly which requests are issued.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use gattkit_core::mock::{MockCall, MockTransport};
use gattkit_core::uuids::{self, characteristics, descriptors, services};
use gattkit_core::{
    CentralManager, Characteristic, CharacteristicId, CharacteristicProperties, DescriptorId,
    DeviceId, Disconnection, Peripheral, Service,
};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Attribute Tree
// ----------------------------------------------------------------------------

pub const SERVICE_A: Uuid = uuids::from_u16(0xFFA0);
pub const SERVICE_B: Uuid = uuids::from_u16(0xFFB0);

pub const CHAR_A1: Uuid = uuids::from_u16(0xFFA1);
pub const CHAR_A2: Uuid = uuids::from_u16(0xFFA2);
pub const CHAR_A3: Uuid = uuids::from_u16(0xFFA3);
pub const CHAR_B1: Uuid = uuids::from_u16(0xFFB1);

pub fn device() -> DeviceId {
    DeviceId::new("AA:BB:CC:DD:EE:01")
}

pub fn char_id(service: Uuid, characteristic: Uuid) -> CharacteristicId {
    CharacteristicId::new(service, characteristic)
}

pub fn battery_level() -> CharacteristicId {
    char_id(services::BATTERY, characteristics::BATTERY_LEVEL)
}

pub fn battery_cccd() -> DescriptorId {
    DescriptorId::new(battery_level(), descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
}

pub fn heart_rate_measurement() -> CharacteristicId {
    char_id(services::HEART_RATE, characteristics::HEART_RATE_MEASUREMENT)
}

/// Two services: A with three characteristics, B with one. Descriptors sit on
/// A1 and B1 only.
pub fn two_service_tree() -> Vec<Service> {
    let rw = CharacteristicProperties::READ | CharacteristicProperties::WRITE;
    vec![
        Service::new(SERVICE_A)
            .with_characteristic(
                Characteristic::new(SERVICE_A, CHAR_A1, rw)
                    .with_descriptor(descriptors::CHARACTERISTIC_USER_DESCRIPTION),
            )
            .with_characteristic(Characteristic::new(SERVICE_A, CHAR_A2, rw))
            .with_characteristic(Characteristic::new(SERVICE_A, CHAR_A3, CharacteristicProperties::READ)),
        Service::new(SERVICE_B).with_characteristic(
            Characteristic::new(SERVICE_B, CHAR_B1, CharacteristicProperties::NOTIFY)
                .with_descriptor(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
        ),
    ]
}

/// Battery, heart rate and device information services
pub fn sensor_tree() -> Vec<Service> {
    vec![
        Service::new(services::BATTERY).with_characteristic(
            Characteristic::new(
                services::BATTERY,
                characteristics::BATTERY_LEVEL,
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            )
            .with_descriptor(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
        ),
        Service::new(services::HEART_RATE)
            .with_characteristic(
                Characteristic::new(
                    services::HEART_RATE,
                    characteristics::HEART_RATE_MEASUREMENT,
                    CharacteristicProperties::NOTIFY,
                )
                .with_descriptor(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
            )
            .with_characteristic(Characteristic::new(
                services::HEART_RATE,
                characteristics::BODY_SENSOR_LOCATION,
                CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            )),
        Service::new(services::DEVICE_INFORMATION)
            .with_characteristic(Characteristic::new(
                services::DEVICE_INFORMATION,
                characteristics::MANUFACTURER_NAME,
                CharacteristicProperties::READ,
            ))
            .with_characteristic(Characteristic::new(
                services::DEVICE_INFORMATION,
                characteristics::SERIAL_NUMBER,
                CharacteristicProperties::READ,
            )),
    ]
}

// ----------------------------------------------------------------------------
// Central Setup
// ----------------------------------------------------------------------------

pub fn mock_with(tree: Vec<Service>) -> MockTransport {
    let mock = MockTransport::new();
    mock.add_device(device(), tree);
    mock
}

pub fn central(mock: &MockTransport) -> CentralManager {
    CentralManager::new(Arc::new(mock.clone()))
}

/// Central, peripheral handle and the disconnection future of an
/// established link
pub async fn connected(mock: &MockTransport) -> (CentralManager, Peripheral, Disconnection) {
    let central = central(mock);
    let peripheral = central.peripheral(device());
    let disconnection = peripheral
        .connect(Some(Duration::from_secs(5)))
        .await
        .expect("connect should succeed");
    (central, peripheral, disconnection)
}

/// Let the execution context and mock answers run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn is_cancel(call: &MockCall) -> bool {
    matches!(call, MockCall::CancelConnection(_))
}

pub fn is_descriptor_discovery(call: &MockCall) -> bool {
    matches!(call, MockCall::DiscoverDescriptors(..))
}

pub fn is_characteristic_discovery(call: &MockCall) -> bool {
    matches!(call, MockCall::DiscoverCharacteristics(..))
}

/// Paused time advances in whole timer ticks, so allow a little slack
pub fn assert_elapsed(started: Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected about {:?}, took {:?}",
        expected,
        elapsed
    );
}
