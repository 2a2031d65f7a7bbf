//! Bluetooth SIG assigned numbers and UUID helpers

use uuid::Uuid;

use crate::error::{BleError, BleResult};

/// Bluetooth base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number against the Bluetooth base UUID
pub const fn from_u16(short: u16) -> Uuid {
    from_u32(short as u32)
}

/// Expand a 32-bit assigned number against the Bluetooth base UUID
pub const fn from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Recover the 16-bit assigned number when `uuid` sits on the base UUID
pub fn to_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & ((1u128 << 96) - 1) != BASE_UUID || value >> 112 != 0 {
        return None;
    }
    Some((value >> 96) as u16)
}

/// Parse either a short assigned number ("180A", "0x180a", "0000180a") or a
/// full 128-bit UUID string.
pub fn parse(input: &str) -> BleResult<Uuid> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match hex_part.len() {
        4 => u16::from_str_radix(hex_part, 16).map(from_u16).ok(),
        8 => u32::from_str_radix(hex_part, 16).map(from_u32).ok(),
        _ => Uuid::parse_str(trimmed).ok(),
    }
    .ok_or_else(|| BleError::invalid_param("uuid", format!("`{}` is not a valid UUID", input)))
}

/// Render a UUID in its shortest conventional form
pub fn short_string(uuid: &Uuid) -> String {
    match to_u16(uuid) {
        Some(short) => format!("{:04X}", short),
        None => uuid.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Well-known Attributes
// ----------------------------------------------------------------------------

pub mod services {
    use super::from_u16;
    use uuid::Uuid;

    pub const GENERIC_ACCESS: Uuid = from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = from_u16(0x1801);
    pub const IMMEDIATE_ALERT: Uuid = from_u16(0x1802);
    pub const LINK_LOSS: Uuid = from_u16(0x1803);
    pub const TX_POWER: Uuid = from_u16(0x1804);
    pub const CURRENT_TIME: Uuid = from_u16(0x1805);
    pub const HEALTH_THERMOMETER: Uuid = from_u16(0x1809);
    pub const DEVICE_INFORMATION: Uuid = from_u16(0x180A);
    pub const HEART_RATE: Uuid = from_u16(0x180D);
    pub const BATTERY: Uuid = from_u16(0x180F);
    pub const BLOOD_PRESSURE: Uuid = from_u16(0x1810);
    pub const HUMAN_INTERFACE_DEVICE: Uuid = from_u16(0x1812);
    pub const CYCLING_SPEED_AND_CADENCE: Uuid = from_u16(0x1816);
    pub const ENVIRONMENTAL_SENSING: Uuid = from_u16(0x181A);
}

pub mod characteristics {
    use super::from_u16;
    use uuid::Uuid;

    pub const DEVICE_NAME: Uuid = from_u16(0x2A00);
    pub const APPEARANCE: Uuid = from_u16(0x2A01);
    pub const PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS: Uuid = from_u16(0x2A04);
    pub const SERVICE_CHANGED: Uuid = from_u16(0x2A05);
    pub const ALERT_LEVEL: Uuid = from_u16(0x2A06);
    pub const TX_POWER_LEVEL: Uuid = from_u16(0x2A07);
    pub const BATTERY_LEVEL: Uuid = from_u16(0x2A19);
    pub const SYSTEM_ID: Uuid = from_u16(0x2A23);
    pub const MODEL_NUMBER: Uuid = from_u16(0x2A24);
    pub const SERIAL_NUMBER: Uuid = from_u16(0x2A25);
    pub const FIRMWARE_REVISION: Uuid = from_u16(0x2A26);
    pub const HARDWARE_REVISION: Uuid = from_u16(0x2A27);
    pub const SOFTWARE_REVISION: Uuid = from_u16(0x2A28);
    pub const MANUFACTURER_NAME: Uuid = from_u16(0x2A29);
    pub const PNP_ID: Uuid = from_u16(0x2A50);
    pub const HEART_RATE_MEASUREMENT: Uuid = from_u16(0x2A37);
    pub const BODY_SENSOR_LOCATION: Uuid = from_u16(0x2A38);
    pub const TEMPERATURE: Uuid = from_u16(0x2A6E);
    pub const HUMIDITY: Uuid = from_u16(0x2A6F);
}

pub mod descriptors {
    use super::from_u16;
    use uuid::Uuid;

    pub const CHARACTERISTIC_EXTENDED_PROPERTIES: Uuid = from_u16(0x2900);
    pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = from_u16(0x2901);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2902);
    pub const SERVER_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2903);
    pub const CHARACTERISTIC_PRESENTATION_FORMAT: Uuid = from_u16(0x2904);
    pub const CHARACTERISTIC_AGGREGATE_FORMAT: Uuid = from_u16(0x2905);
    pub const VALID_RANGE: Uuid = from_u16(0x2906);
}

/// Human-readable name for well-known service, characteristic and descriptor UUIDs
pub fn common_name(uuid: &Uuid) -> Option<&'static str> {
    let name = match to_u16(uuid)? {
        0x1800 => "Generic Access",
        0x1801 => "Generic Attribute",
        0x1802 => "Immediate Alert",
        0x1803 => "Link Loss",
        0x1804 => "Tx Power",
        0x1805 => "Current Time",
        0x1809 => "Health Thermometer",
        0x180A => "Device Information",
        0x180D => "Heart Rate",
        0x180F => "Battery",
        0x1810 => "Blood Pressure",
        0x1812 => "Human Interface Device",
        0x1816 => "Cycling Speed and Cadence",
        0x181A => "Environmental Sensing",
        0x2900 => "Characteristic Extended Properties",
        0x2901 => "Characteristic User Description",
        0x2902 => "Client Characteristic Configuration",
        0x2903 => "Server Characteristic Configuration",
        0x2904 => "Characteristic Presentation Format",
        0x2905 => "Characteristic Aggregate Format",
        0x2906 => "Valid Range",
        0x2A00 => "Device Name",
        0x2A01 => "Appearance",
        0x2A04 => "Peripheral Preferred Connection Parameters",
        0x2A05 => "Service Changed",
        0x2A06 => "Alert Level",
        0x2A07 => "Tx Power Level",
        0x2A19 => "Battery Level",
        0x2A23 => "System ID",
        0x2A24 => "Model Number String",
        0x2A25 => "Serial Number String",
        0x2A26 => "Firmware Revision String",
        0x2A27 => "Hardware Revision String",
        0x2A28 => "Software Revision String",
        0x2A29 => "Manufacturer Name String",
        0x2A37 => "Heart Rate Measurement",
        0x2A38 => "Body Sensor Location",
        0x2A50 => "PnP ID",
        0x2A6E => "Temperature",
        0x2A6F => "Humidity",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            services::DEVICE_INFORMATION.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(to_u16(&services::BATTERY), Some(0x180F));
        assert_eq!(to_u16(&Uuid::new_v4()), None);
    }

    #[test]
    fn test_parse_short_and_long_forms() {
        assert_eq!(parse("180a").unwrap(), services::DEVICE_INFORMATION);
        assert_eq!(parse("0x2A19").unwrap(), characteristics::BATTERY_LEVEL);
        assert_eq!(
            parse("00002902-0000-1000-8000-00805f9b34fb").unwrap(),
            descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION
        );
        assert!(matches!(
            parse("not-a-uuid"),
            Err(BleError::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_common_names() {
        assert_eq!(common_name(&services::BATTERY), Some("Battery"));
        assert_eq!(
            common_name(&characteristics::MANUFACTURER_NAME),
            Some("Manufacturer Name String")
        );
        assert_eq!(common_name(&from_u16(0xFFF0)), None);
        assert_eq!(short_string(&services::HEART_RATE), "180D");
    }
}
