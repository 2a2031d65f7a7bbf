//! Mapping between btleplug's attribute types and gattkit's

use btleplug::api::{
    CentralState, CharPropFlags, Characteristic as PlatformCharacteristic,
    Descriptor as PlatformDescriptor, PeripheralProperties, Service as PlatformService,
};
use btleplug::platform::PeripheralId;
use uuid::Uuid;

use gattkit_core::{
    AdapterState, Advertisement, Characteristic, CharacteristicId, CharacteristicProperties, Descriptor,
    DescriptorId, DeviceId, Service, TransportError, RSSI_UNAVAILABLE,
};

/// Opaque device id derived from the platform peripheral id
pub fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{:?}", id))
}

pub fn platform_error(err: btleplug::Error) -> TransportError {
    TransportError::new(err.to_string())
}

pub fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

pub fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    // Both sides use the Bluetooth core bit layout for the low byte
    CharacteristicProperties::from_bits_truncate(u16::from(flags.bits()))
}

pub fn service(service: &PlatformService) -> Service {
    if service.primary {
        Service::new(service.uuid)
    } else {
        Service::secondary(service.uuid)
    }
}

pub fn characteristic(characteristic: &PlatformCharacteristic) -> Characteristic {
    Characteristic::new(
        characteristic.service_uuid,
        characteristic.uuid,
        properties(characteristic.properties),
    )
}

pub fn descriptor(descriptor: &PlatformDescriptor) -> Descriptor {
    Descriptor::new(
        CharacteristicId::new(descriptor.service_uuid, descriptor.characteristic_uuid),
        descriptor.uuid,
    )
}

pub fn matches_characteristic(candidate: &PlatformCharacteristic, id: &CharacteristicId) -> bool {
    candidate.service_uuid == id.service && candidate.uuid == id.characteristic
}

pub fn matches_descriptor(candidate: &PlatformDescriptor, id: &DescriptorId) -> bool {
    candidate.service_uuid == id.service
        && candidate.characteristic_uuid == id.characteristic
        && candidate.uuid == id.descriptor
}

pub fn passes(filter: Option<&[Uuid]>, uuid: &Uuid) -> bool {
    filter.map_or(true, |wanted| wanted.contains(uuid))
}

pub fn advertisement(device: DeviceId, props: PeripheralProperties) -> Advertisement {
    let mut adv = Advertisement::new(device, props.rssi.unwrap_or(RSSI_UNAVAILABLE));
    adv.local_name = props.local_name;
    adv.service_uuids = props.services;
    adv.manufacturer_data = props.manufacturer_data.into_iter().collect();
    adv
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattkit_core::uuids::services;

    #[test]
    fn test_property_bits_line_up() {
        let flags = CharPropFlags::READ | CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE;
        let mapped = properties(flags);
        assert!(mapped.can_read());
        assert!(mapped.can_notify());
        assert!(mapped.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE));
        assert!(!mapped.contains(CharacteristicProperties::WRITE));

        assert_eq!(properties(CharPropFlags::INDICATE), CharacteristicProperties::INDICATE);
        assert_eq!(properties(CharPropFlags::empty()), CharacteristicProperties::empty());
    }

    #[test]
    fn test_adapter_state() {
        assert_eq!(adapter_state(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(adapter_state(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(adapter_state(CentralState::Unknown), AdapterState::Unknown);
    }

    #[test]
    fn test_filter() {
        assert!(passes(None, &services::BATTERY));
        assert!(passes(Some(&[services::BATTERY]), &services::BATTERY));
        assert!(!passes(Some(&[services::HEART_RATE]), &services::BATTERY));
        assert!(!passes(Some(&[]), &services::BATTERY));
    }
}
