//! Peripheral operations behind the CLI commands
//!
//! Each command that talks to one device is a [`PeripheralOperation`], so
//! connecting, discovery and disconnecting are handled by
//! [`gattkit_core::run_operation`].

use std::str::FromStr;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use gattkit_core::{
    BleResult, ErrorPolicy, PeripheralOperation, PeripheralSession, Service, SessionConfiguration,
};

use crate::cli::ValueFormat;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Value Encoding
// ----------------------------------------------------------------------------

fn parse_number<T: FromStr>(input: &str) -> Result<T> {
    input
        .trim()
        .parse()
        .map_err(|_| CliError::InvalidValue(format!("`{}` does not fit the requested integer type", input)))
}

/// Encode command-line input as it goes over the air; integers are little-endian
pub fn encode_value(input: &str, format: ValueFormat) -> Result<Vec<u8>> {
    let bytes = match format {
        ValueFormat::Hex => hex::decode(input.trim().trim_start_matches("0x"))?,
        ValueFormat::Utf8 => input.as_bytes().to_vec(),
        ValueFormat::U8 => parse_number::<u8>(input)?.to_le_bytes().to_vec(),
        ValueFormat::U16 => parse_number::<u16>(input)?.to_le_bytes().to_vec(),
        ValueFormat::U32 => parse_number::<u32>(input)?.to_le_bytes().to_vec(),
        ValueFormat::U64 => parse_number::<u64>(input)?.to_le_bytes().to_vec(),
        ValueFormat::I8 => parse_number::<i8>(input)?.to_le_bytes().to_vec(),
        ValueFormat::I16 => parse_number::<i16>(input)?.to_le_bytes().to_vec(),
        ValueFormat::I32 => parse_number::<i32>(input)?.to_le_bytes().to_vec(),
        ValueFormat::I64 => parse_number::<i64>(input)?.to_le_bytes().to_vec(),
    };
    Ok(bytes)
}

/// Render a raw value received outside the typed session helpers
pub fn render_value(bytes: &[u8], format: ValueFormat) -> String {
    fn le<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
        bytes.get(..N).and_then(|prefix| prefix.try_into().ok())
    }

    let rendered = match format {
        ValueFormat::Hex => Some(hex::encode(bytes)),
        ValueFormat::Utf8 => Some(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()),
        ValueFormat::U8 => le::<1>(bytes).map(|b| u8::from_le_bytes(b).to_string()),
        ValueFormat::U16 => le::<2>(bytes).map(|b| u16::from_le_bytes(b).to_string()),
        ValueFormat::U32 => le::<4>(bytes).map(|b| u32::from_le_bytes(b).to_string()),
        ValueFormat::U64 => le::<8>(bytes).map(|b| u64::from_le_bytes(b).to_string()),
        ValueFormat::I8 => le::<1>(bytes).map(|b| i8::from_le_bytes(b).to_string()),
        ValueFormat::I16 => le::<2>(bytes).map(|b| i16::from_le_bytes(b).to_string()),
        ValueFormat::I32 => le::<4>(bytes).map(|b| i32::from_le_bytes(b).to_string()),
        ValueFormat::I64 => le::<8>(bytes).map(|b| i64::from_le_bytes(b).to_string()),
    };
    rendered.unwrap_or_else(|| format!("{} (too short for {:?})", hex::encode(bytes), format))
}

// ----------------------------------------------------------------------------
// Inspect
// ----------------------------------------------------------------------------

/// Discover the attribute tree and hand it back assembled
pub struct InspectTree {
    pub configuration: SessionConfiguration,
}

#[async_trait]
impl PeripheralOperation for InspectTree {
    type Output = Vec<Service>;

    fn configuration(&self) -> SessionConfiguration {
        self.configuration.clone()
    }

    async fn execute(&mut self, session: &mut PeripheralSession) -> BleResult<Vec<Service>> {
        let characteristics = session.discovered_characteristics();
        let descriptors = session.discovered_descriptors();

        let tree = session
            .discovered_services()
            .iter()
            .map(|service| {
                let mut node = service.shallow();
                for characteristic in characteristics.get(&service.uuid).into_iter().flatten() {
                    let mut leaf = characteristic.shallow();
                    leaf.descriptors = descriptors.get(&characteristic.id()).cloned().unwrap_or_default();
                    node.characteristics.push(leaf);
                }
                node
            })
            .collect();
        Ok(tree)
    }
}

// ----------------------------------------------------------------------------
// Read / Write
// ----------------------------------------------------------------------------

pub struct ReadValue {
    pub configuration: SessionConfiguration,
    pub characteristic: Uuid,
    pub format: ValueFormat,
}

#[async_trait]
impl PeripheralOperation for ReadValue {
    /// Rendered value; `None` when the peripheral returned no value
    type Output = Option<String>;

    fn configuration(&self) -> SessionConfiguration {
        self.configuration.clone()
    }

    async fn execute(&mut self, session: &mut PeripheralSession) -> BleResult<Option<String>> {
        let uuid = self.characteristic;
        let rendered = match self.format {
            ValueFormat::Hex => session.read(uuid, ErrorPolicy::default()).await?.map(hex::encode),
            ValueFormat::Utf8 => session.read_utf8(uuid).await?,
            ValueFormat::U8 => session.read_u8(uuid).await?.map(|v| v.to_string()),
            ValueFormat::U16 => session.read_u16(uuid).await?.map(|v| v.to_string()),
            ValueFormat::U32 => session.read_u32(uuid).await?.map(|v| v.to_string()),
            ValueFormat::U64 => session.read_u64(uuid).await?.map(|v| v.to_string()),
            ValueFormat::I8 => session.read_i8(uuid).await?.map(|v| v.to_string()),
            ValueFormat::I16 => session.read_i16(uuid).await?.map(|v| v.to_string()),
            ValueFormat::I32 => session.read_i32(uuid).await?.map(|v| v.to_string()),
            ValueFormat::I64 => session.read_i64(uuid).await?.map(|v| v.to_string()),
        };
        Ok(rendered)
    }
}

pub struct WriteValue {
    pub configuration: SessionConfiguration,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub with_response: bool,
}

#[async_trait]
impl PeripheralOperation for WriteValue {
    type Output = ();

    fn configuration(&self) -> SessionConfiguration {
        self.configuration.clone()
    }

    async fn execute(&mut self, session: &mut PeripheralSession) -> BleResult<()> {
        session
            .write(self.data.clone(), self.characteristic, self.with_response, ErrorPolicy::default())
            .await
    }
}

// ----------------------------------------------------------------------------
// Listen
// ----------------------------------------------------------------------------

/// Print notifications until the count is reached, the link ends or Ctrl+C
pub struct Listen {
    pub configuration: SessionConfiguration,
    pub characteristic: Uuid,
    pub count: Option<usize>,
    pub format: ValueFormat,
}

#[async_trait]
impl PeripheralOperation for Listen {
    /// Number of notifications received
    type Output = usize;

    fn configuration(&self) -> SessionConfiguration {
        self.configuration.clone()
    }

    async fn execute(&mut self, session: &mut PeripheralSession) -> BleResult<usize> {
        let mut notifications = session
            .start_listening(self.characteristic, ErrorPolicy::default())
            .await?;
        info!("Listening to {}, press Ctrl+C to stop", self.characteristic);

        let mut received = 0;
        while self.count.map_or(true, |limit| received < limit) {
            tokio::select! {
                item = notifications.recv() => match item {
                    Some(Ok(value)) => {
                        received += 1;
                        println!("[{}] {}", received, render_value(&value, self.format));
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        if let Err(e) = session
            .stop_listening(self.characteristic, ErrorPolicy::recoverable())
            .await
        {
            warn!("Failed to disable notifications: {}", e);
        }
        Ok(received)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_value() {
        assert_eq!(encode_value("0x01ff", ValueFormat::Hex).unwrap(), vec![0x01, 0xFF]);
        assert_eq!(encode_value("hi", ValueFormat::Utf8).unwrap(), b"hi".to_vec());
        assert_eq!(encode_value("513", ValueFormat::U16).unwrap(), vec![0x01, 0x02]);
        assert_eq!(encode_value("-2", ValueFormat::I16).unwrap(), vec![0xFE, 0xFF]);

        assert!(matches!(encode_value("256", ValueFormat::U8), Err(CliError::InvalidValue(_))));
        assert!(matches!(encode_value("zz", ValueFormat::Hex), Err(CliError::HexDecoding(_))));
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&[0x00, 0x48], ValueFormat::Hex), "0048");
        assert_eq!(render_value(b"Polar\0\0", ValueFormat::Utf8), "Polar");
        assert_eq!(render_value(&[0x01, 0x02, 0x03], ValueFormat::U16), "513");
        assert_eq!(render_value(&[0xFF], ValueFormat::I8), "-1");
        assert_eq!(render_value(&[0x01], ValueFormat::U32), "01 (too short for U32)");
    }
}
