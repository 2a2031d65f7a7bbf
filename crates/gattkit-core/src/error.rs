//! Error types for central and peripheral operations

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Raw failure reported by a BLE transport.
///
/// Never surfaced to callers directly; the orchestration layer always wraps it
/// in a [`BleError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}{}", code_suffix(.code))]
pub struct TransportError {
    code: Option<i64>,
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|code| format!(" (code {})", code)).unwrap_or_default()
}

// ----------------------------------------------------------------------------
// Domain Errors
// ----------------------------------------------------------------------------

/// Errors delivered by every central, peripheral and session operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BleError {
    #[error("operation timed out")]
    Timeout,

    #[error("peripheral is not connected")]
    NotConnected,

    #[error("operation failed: {0}")]
    OperationFailed(#[source] TransportError),

    #[error("connection failed{}", cause_suffix(.0))]
    ConnectionFailed(#[source] Option<TransportError>),

    #[error("peripheral disconnected{}", cause_suffix(.0))]
    Disconnected(#[source] Option<TransportError>),

    #[error("invalid parameter `{param}`: {reason}")]
    InvalidParam { param: String, reason: String },

    #[error("central manager is not ready")]
    CentralNotReady,
}

fn cause_suffix(cause: &Option<TransportError>) -> String {
    match cause {
        Some(err) => format!(": {}", err),
        None => String::new(),
    }
}

/// Discriminant of [`BleError`], useful for matching without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    NotConnected,
    OperationFailed,
    ConnectionFailed,
    Disconnected,
    InvalidParam,
    CentralNotReady,
}

impl BleError {
    pub fn invalid_param(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            param: param.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::Timeout,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::OperationFailed(_) => ErrorKind::OperationFailed,
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::InvalidParam { .. } => ErrorKind::InvalidParam,
            Self::CentralNotReady => ErrorKind::CentralNotReady,
        }
    }

    /// Stable numeric code for logs and external reporting
    pub fn code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Timeout => 1,
            ErrorKind::NotConnected => 2,
            ErrorKind::OperationFailed => 3,
            ErrorKind::ConnectionFailed => 4,
            ErrorKind::Disconnected => 5,
            ErrorKind::InvalidParam => 6,
            ErrorKind::CentralNotReady => 7,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Timeout => "Make sure the peripheral is powered on and in range, then retry",
            ErrorKind::NotConnected => "Connect to the peripheral before attempting this operation",
            ErrorKind::OperationFailed => "Inspect the underlying transport error for details",
            ErrorKind::ConnectionFailed => "Retry the connection, or power cycle the peripheral",
            ErrorKind::Disconnected => "Reconnect to the peripheral",
            ErrorKind::InvalidParam => "Check the arguments passed to the operation",
            ErrorKind::CentralNotReady => "Make sure Bluetooth is enabled and permitted",
        }
    }

    /// The raw transport cause, when one exists
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::OperationFailed(err) => Some(err),
            Self::ConnectionFailed(cause) | Self::Disconnected(cause) => cause.as_ref(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<TransportError> for BleError {
    fn from(err: TransportError) -> Self {
        Self::OperationFailed(err)
    }
}

/// Result type for central and peripheral operations
pub type BleResult<T> = Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_wrapped() {
        let raw = TransportError::with_code(14, "attribute not found");
        let err: BleError = raw.clone().into();

        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert_eq!(err.transport_error(), Some(&raw));
        assert_eq!(
            err.to_string(),
            "operation failed: attribute not found (code 14)"
        );
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            BleError::Timeout,
            BleError::NotConnected,
            BleError::OperationFailed(TransportError::new("x")),
            BleError::ConnectionFailed(None),
            BleError::Disconnected(None),
            BleError::invalid_param("service", "missing"),
            BleError::CentralNotReady,
        ];

        let codes: Vec<u8> = errors.iter().map(BleError::code).collect();
        assert_eq!(codes, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_disconnect_display() {
        assert_eq!(
            BleError::Disconnected(None).to_string(),
            "peripheral disconnected"
        );
        assert_eq!(
            BleError::Disconnected(Some(TransportError::new("link lost"))).to_string(),
            "peripheral disconnected: link lost"
        );
    }
}
