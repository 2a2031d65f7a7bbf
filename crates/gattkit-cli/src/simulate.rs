//! Simulated heart-rate sensor for `--simulate`
//!
//! Runs every command against [`MockTransport`] so the CLI can be tried
//! without Bluetooth hardware.

use std::time::Duration;

use tokio::task::JoinHandle;

use gattkit_core::mock::MockTransport;
use gattkit_core::uuids::{characteristics, descriptors, services};
use gattkit_core::{
    Advertisement, Characteristic, CharacteristicId, CharacteristicProperties, DeviceId, Service,
};

pub const DEVICE_NAME: &str = "gattkit HRM";

pub fn device_id() -> DeviceId {
    DeviceId::new("SIM:00:00:00:00:01")
}

fn heart_rate_measurement() -> CharacteristicId {
    CharacteristicId::new(services::HEART_RATE, characteristics::HEART_RATE_MEASUREMENT)
}

fn attribute_tree() -> Vec<Service> {
    let read = CharacteristicProperties::READ;
    let info = |uuid| Characteristic::new(services::DEVICE_INFORMATION, uuid, read);

    vec![
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
                read | CharacteristicProperties::WRITE,
            )),
        Service::new(services::BATTERY).with_characteristic(
            Characteristic::new(
                services::BATTERY,
                characteristics::BATTERY_LEVEL,
                read | CharacteristicProperties::NOTIFY,
            )
            .with_descriptor(descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
        ),
        Service::new(services::DEVICE_INFORMATION)
            .with_characteristic(info(characteristics::MANUFACTURER_NAME))
            .with_characteristic(info(characteristics::MODEL_NUMBER))
            .with_characteristic(info(characteristics::SERIAL_NUMBER))
            .with_characteristic(info(characteristics::FIRMWARE_REVISION))
            .with_characteristic(info(characteristics::SYSTEM_ID)),
    ]
}

/// Mock transport holding one powered-on heart-rate sensor
pub fn demo_transport() -> MockTransport {
    let mock = MockTransport::new();
    let device = device_id();
    mock.add_device(device.clone(), attribute_tree());
    mock.set_rssi(&device, -58);

    let values: [(_, _, &[u8]); 7] = [
        (services::BATTERY, characteristics::BATTERY_LEVEL, &[87]),
        (services::HEART_RATE, characteristics::BODY_SENSOR_LOCATION, &[1]),
        (services::DEVICE_INFORMATION, characteristics::MANUFACTURER_NAME, b"gattkit"),
        (services::DEVICE_INFORMATION, characteristics::MODEL_NUMBER, b"HRM-1"),
        (services::DEVICE_INFORMATION, characteristics::SERIAL_NUMBER, b"0001\0\0"),
        (services::DEVICE_INFORMATION, characteristics::FIRMWARE_REVISION, b"1.0.3"),
        (services::DEVICE_INFORMATION, characteristics::SYSTEM_ID, &[1, 2, 3, 4, 5, 6, 7, 8]),
    ];
    for (service, characteristic, value) in values {
        mock.set_value(&device, CharacteristicId::new(service, characteristic), value);
    }
    mock
}

/// Advertise the sensor and stream heart-rate measurements once a second
pub fn spawn_activity(mock: MockTransport) -> JoinHandle<()> {
    tokio::spawn(async move {
        let device = device_id();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut beat: u8 = 0;

        loop {
            ticker.tick().await;
            let rssi = -50 - i16::from(beat % 15);
            mock.advertise(
                Advertisement::new(device.clone(), rssi)
                    .with_name(DEVICE_NAME)
                    .with_service(services::HEART_RATE),
            );
            mock.set_rssi(&device, rssi);

            // Flags byte 0: 8-bit beats per minute
            let bpm = 60 + beat % 30;
            mock.notify(&device, heart_rate_measurement(), vec![0x00, bpm]);
            beat = beat.wrapping_add(1);
        }
    })
}
