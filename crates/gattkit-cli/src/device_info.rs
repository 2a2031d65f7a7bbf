//! Device Information Service (0x180A) reader

use std::fmt;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use gattkit_core::uuids::{characteristics, services};
use gattkit_core::{BleResult, ErrorPolicy, PeripheralOperation, PeripheralSession, SessionConfiguration};

/// Whatever subset of the device information service the peripheral exposes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub manufacturer_name: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_revision: Option<String>,
    pub firmware_revision: Option<String>,
    pub software_revision: Option<String>,
    /// Hex encoded
    pub system_id: Option<String>,
}

impl fmt::Display for DeviceInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("Manufacturer", &self.manufacturer_name),
            ("Model", &self.model_number),
            ("Serial number", &self.serial_number),
            ("Hardware revision", &self.hardware_revision),
            ("Firmware revision", &self.firmware_revision),
            ("Software revision", &self.software_revision),
            ("System ID", &self.system_id),
        ];
        for (label, value) in rows {
            writeln!(f, "{:<18} {}", label, value.as_deref().unwrap_or("-"))?;
        }
        Ok(())
    }
}

pub struct ReadDeviceInformation {
    configuration: SessionConfiguration,
}

impl ReadDeviceInformation {
    /// Uses the timeouts of `base`, discovering only the information service
    pub fn new(base: SessionConfiguration) -> Self {
        Self {
            configuration: base.with_services(vec![services::DEVICE_INFORMATION]),
        }
    }

    async fn read_string(session: &mut PeripheralSession, uuid: Uuid) -> BleResult<Option<String>> {
        if session.characteristic(&uuid).is_none() {
            debug!("Device does not expose {}", uuid);
            return Ok(None);
        }
        session.read_utf8(uuid).await
    }
}

#[async_trait]
impl PeripheralOperation for ReadDeviceInformation {
    type Output = DeviceInformation;

    fn configuration(&self) -> SessionConfiguration {
        self.configuration.clone()
    }

    async fn execute(&mut self, session: &mut PeripheralSession) -> BleResult<DeviceInformation> {
        let system_id = if session.characteristic(&characteristics::SYSTEM_ID).is_some() {
            session
                .read(characteristics::SYSTEM_ID, ErrorPolicy::default())
                .await?
                .map(hex::encode)
        } else {
            None
        };

        Ok(DeviceInformation {
            manufacturer_name: Self::read_string(session, characteristics::MANUFACTURER_NAME).await?,
            model_number: Self::read_string(session, characteristics::MODEL_NUMBER).await?,
            serial_number: Self::read_string(session, characteristics::SERIAL_NUMBER).await?,
            hardware_revision: Self::read_string(session, characteristics::HARDWARE_REVISION).await?,
            firmware_revision: Self::read_string(session, characteristics::FIRMWARE_REVISION).await?,
            software_revision: Self::read_string(session, characteristics::SOFTWARE_REVISION).await?,
            system_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate;
    use gattkit_core::mock::{MockCall, MockOp};
    use gattkit_core::{run_operation, BleError, CentralManager, CharacteristicId};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_reads_exposed_fields() {
        let mock = simulate::demo_transport();
        let central = CentralManager::new(Arc::new(mock.clone()));
        let peripheral = central.peripheral(simulate::device_id());

        let info = run_operation(&peripheral, &mut ReadDeviceInformation::new(SessionConfiguration::default()))
            .await
            .unwrap();

        assert_eq!(info.manufacturer_name.as_deref(), Some("gattkit"));
        assert_eq!(info.model_number.as_deref(), Some("HRM-1"));
        assert_eq!(info.system_id.as_deref(), Some("0102030405060708"));
        // Not exposed by the simulated sensor
        assert_eq!(info.hardware_revision, None);
        assert!(!peripheral.is_connected());

        // Only the information service is walked
        let characteristic_discoveries: Vec<_> = mock
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::DiscoverCharacteristics(..)))
            .collect();
        assert_eq!(characteristic_discoveries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_aborts() {
        let mock = simulate::demo_transport();
        mock.script(
            &simulate::device_id(),
            MockOp::ReadCharacteristic(CharacteristicId::new(
                services::DEVICE_INFORMATION,
                characteristics::SERIAL_NUMBER,
            )),
            gattkit_core::mock::MockBehavior::Ignore,
        );
        let central = CentralManager::new(Arc::new(mock));
        let peripheral = central.peripheral(simulate::device_id());

        let mut operation = ReadDeviceInformation::new(
            SessionConfiguration::default().with_operation_timeout(Some(std::time::Duration::from_secs(2))),
        );
        assert_eq!(run_operation(&peripheral, &mut operation).await, Err(BleError::Timeout));
    }

    #[test]
    fn test_display_marks_missing_fields() {
        let info = DeviceInformation {
            manufacturer_name: Some("Acme".to_string()),
            ..Default::default()
        };
        let text = info.to_string();
        assert!(text.contains("Acme"));
        assert!(text.lines().any(|line| line.starts_with("Model") && line.ends_with('-')));
    }
}
