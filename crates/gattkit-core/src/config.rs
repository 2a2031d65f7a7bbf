//! Timeouts, session configuration and scan settings

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

pub mod defaults {
    use std::time::Duration;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
    pub const RSSI_POLL_INTERVAL: Duration = Duration::from_secs(1);
}

/// Serde adapter for optional timeouts expressed in seconds.
///
/// Zero or negative values disable the timeout. Values too large for a
/// [`Duration`] are rejected.
pub mod timeout_secs {
    use std::time::{Duration, TryFromFloatSecsError};

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.map(|d| d.as_secs_f64()).unwrap_or(0.0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        from_seconds(seconds).map_err(|e| D::Error::custom(format!("timeout of {} seconds: {}", seconds, e)))
    }

    pub fn from_seconds(seconds: f64) -> Result<Option<Duration>, TryFromFloatSecsError> {
        // NaN fails this comparison too
        if !(seconds > 0.0) {
            return Ok(None);
        }
        Duration::try_from_secs_f64(seconds).map(Some)
    }
}

fn default_connect_timeout() -> Option<Duration> {
    Some(defaults::CONNECT_TIMEOUT)
}

fn default_disconnect_timeout() -> Option<Duration> {
    Some(defaults::DISCONNECT_TIMEOUT)
}

fn default_operation_timeout() -> Option<Duration> {
    Some(defaults::OPERATION_TIMEOUT)
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// What a [`PeripheralSession`](crate::session::PeripheralSession) discovers
/// and how long each step may take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    /// Services to discover; `None` discovers all of them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services_to_discover: Option<Vec<Uuid>>,
    #[serde(with = "timeout_secs", default = "default_connect_timeout")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_disconnect_timeout")]
    pub disconnect_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_operation_timeout")]
    pub service_discovery_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_operation_timeout")]
    pub characteristic_discovery_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_operation_timeout")]
    pub descriptor_discovery_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_operation_timeout")]
    pub read_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_operation_timeout")]
    pub write_timeout: Option<Duration>,
    #[serde(with = "timeout_secs", default = "default_operation_timeout")]
    pub notify_timeout: Option<Duration>,
    /// Per-service characteristic filters; services without an entry discover all
    #[serde(default)]
    pub characteristics_to_discover: HashMap<Uuid, Vec<Uuid>>,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            services_to_discover: None,
            characteristics_to_discover: HashMap::new(),
            connect_timeout: default_connect_timeout(),
            disconnect_timeout: default_disconnect_timeout(),
            service_discovery_timeout: default_operation_timeout(),
            characteristic_discovery_timeout: default_operation_timeout(),
            descriptor_discovery_timeout: default_operation_timeout(),
            read_timeout: default_operation_timeout(),
            write_timeout: default_operation_timeout(),
            notify_timeout: default_operation_timeout(),
        }
    }
}

impl SessionConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict service discovery to the given services
    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services_to_discover = Some(services);
        self
    }

    /// Restrict characteristic discovery within one service
    pub fn with_characteristics(mut self, service: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.characteristics_to_discover.insert(service, characteristics);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Apply one timeout to every discovery, read, write and notify step
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.service_discovery_timeout = timeout;
        self.characteristic_discovery_timeout = timeout;
        self.descriptor_discovery_timeout = timeout;
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self.notify_timeout = timeout;
        self
    }

    pub fn characteristics_for(&self, service: &Uuid) -> Option<Vec<Uuid>> {
        self.characteristics_to_discover.get(service).cloned()
    }
}

// ----------------------------------------------------------------------------
// Scan Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Only report peripherals advertising one of these services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_uuids: Option<Vec<Uuid>>,
    /// Report every advertisement instead of coalescing repeats
    #[serde(default)]
    pub allow_duplicates: bool,
}

impl ScanSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.service_uuids = Some(services);
        self
    }

    pub fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuids::services;

    #[test]
    fn test_defaults() {
        let config = SessionConfiguration::default();
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.disconnect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(10)));
        assert!(config.services_to_discover.is_none());
    }

    #[test]
    fn test_timeout_seconds_mapping() {
        assert_eq!(timeout_secs::from_seconds(2.5), Ok(Some(Duration::from_millis(2500))));
        assert_eq!(timeout_secs::from_seconds(0.0), Ok(None));
        assert_eq!(timeout_secs::from_seconds(-1.0), Ok(None));
        assert_eq!(timeout_secs::from_seconds(f64::NAN), Ok(None));
        assert!(timeout_secs::from_seconds(1e30).is_err());
        assert!(timeout_secs::from_seconds(f64::INFINITY).is_err());
    }

    #[test]
    fn test_oversized_timeout_is_a_parse_error() {
        let parsed = toml::from_str::<SessionConfiguration>("read_timeout = 1e30\n");
        let err = parsed.unwrap_err().to_string();
        assert!(err.contains("timeout of"), "unexpected error: {}", err);
    }

    #[test]
    fn test_toml_round_trip_keeps_disabled_timeouts() {
        let config = SessionConfiguration::new()
            .with_services(vec![services::BATTERY])
            .with_connect_timeout(Some(Duration::from_secs(3)))
            .with_disconnect_timeout(None);

        let text = toml::to_string(&config).unwrap();
        let parsed: SessionConfiguration = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: SessionConfiguration = toml::from_str("connect_timeout = 0\nread_timeout = 4.0\n").unwrap();
        assert_eq!(parsed.connect_timeout, None);
        assert_eq!(parsed.read_timeout, Some(Duration::from_secs(4)));
        assert_eq!(parsed.write_timeout, Some(defaults::OPERATION_TIMEOUT));
    }
}
