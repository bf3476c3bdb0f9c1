//! Error module for sensorrelay
//!
//! This module defines the error type and numeric error codes shared by the
//! broker, the publisher and the subscriber.

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Numeric error code, grouped by category in the high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Protocol errors (0x0001-0x00FF)
    MalformedEnvelope = 0x0001,
    UnknownEvent = 0x0002,

    // Application errors (0x0101-0x01FF)
    UnknownSensor = 0x0101,
    UnknownSubscription = 0x0102,

    // System errors (0x0301-0x03FF)
    InternalServerError = 0x0301,
    ConfigInvalid = 0x0302,

    // Client errors (0x0401-0x04FF)
    ConnectionFailed = 0x0401,
    SendFailed = 0x0402,
    NotConnected = 0x0403,
    TransportClosed = 0x0404,
    RetriesExhausted = 0x0405,
}

impl ErrorCode {
    /// Get the error code as a u16
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the error code category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() >> 8 {
            0x00 => ErrorCategory::Protocol,
            0x01 => ErrorCategory::Application,
            0x03 => ErrorCategory::System,
            0x04 => ErrorCategory::Client,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Try to convert a u16 to an ErrorCode
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::MalformedEnvelope),
            0x0002 => Some(Self::UnknownEvent),
            0x0101 => Some(Self::UnknownSensor),
            0x0102 => Some(Self::UnknownSubscription),
            0x0301 => Some(Self::InternalServerError),
            0x0302 => Some(Self::ConfigInvalid),
            0x0401 => Some(Self::ConnectionFailed),
            0x0402 => Some(Self::SendFailed),
            0x0403 => Some(Self::NotConnected),
            0x0404 => Some(Self::TransportClosed),
            0x0405 => Some(Self::RetriesExhausted),
            _ => None,
        }
    }

    /// Get a human-readable description of the error code
    pub fn description(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope => "Envelope is not valid JSON or lacks required fields",
            Self::UnknownEvent => "Unknown event name",
            Self::UnknownSensor => "Sensor has never been registered",
            Self::UnknownSubscription => "No such subscription or callback",
            Self::InternalServerError => "Unexpected server error",
            Self::ConfigInvalid => "Invalid configuration",
            Self::ConnectionFailed => "Failed to connect to broker",
            Self::SendFailed => "Failed to send message",
            Self::NotConnected => "Not connected",
            Self::TransportClosed => "Transport closed",
            Self::RetriesExhausted => "Gave up after retrying",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MalformedEnvelope => "MALFORMED_ENVELOPE",
            Self::UnknownEvent => "UNKNOWN_EVENT",
            Self::UnknownSensor => "UNKNOWN_SENSOR",
            Self::UnknownSubscription => "UNKNOWN_SUBSCRIPTION",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::SendFailed => "SEND_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::RetriesExhausted => "RETRIES_EXHAUSTED",
        };
        write!(f, "{} (0x{:04X})", name, self.as_u16())
    }
}

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Protocol,
    Application,
    System,
    Client,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => write!(f, "Protocol"),
            Self::Application => write!(f, "Application"),
            Self::System => write!(f, "System"),
            Self::Client => write!(f, "Client"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Main error type for sensorrelay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{code}: {message}")]
    Standard { code: ErrorCode, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl RelayError {
    /// Create a new standard error with the given code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Standard {
            code,
            message: message.into(),
        }
    }

    /// Get the error code if this is a standard error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Standard { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Standard { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    /// Whether the underlying transport is gone and a reconnect may help.
    pub fn is_transport_closed(&self) -> bool {
        match self {
            Self::Standard { code, .. } => {
                matches!(code, ErrorCode::TransportClosed | ErrorCode::NotConnected)
            }
            Self::Io(_) => true,
            Self::WebSocket(e) => matches!(
                e,
                tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Io(_)
                    | tungstenite::Error::Protocol(
                        tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
                    )
            ),
            _ => false,
        }
    }
}

/// Result type alias for sensorrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl From<String> for RelayError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl From<&str> for RelayError {
    fn from(message: &str) -> Self {
        Self::Other(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u16() {
        for code in [
            ErrorCode::MalformedEnvelope,
            ErrorCode::UnknownSensor,
            ErrorCode::ConfigInvalid,
            ErrorCode::RetriesExhausted,
        ] {
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0xBEEF), None);
    }

    #[test]
    fn categories_follow_high_byte() {
        assert_eq!(ErrorCode::UnknownEvent.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::UnknownSubscription.category(), ErrorCategory::Application);
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::System);
        assert_eq!(ErrorCode::TransportClosed.category(), ErrorCategory::Client);
    }

    #[test]
    fn transport_closed_classification() {
        assert!(RelayError::new(ErrorCode::TransportClosed, "gone").is_transport_closed());
        assert!(RelayError::WebSocket(tungstenite::Error::ConnectionClosed).is_transport_closed());
        assert!(!RelayError::new(ErrorCode::UnknownSensor, "x").is_transport_closed());
        assert!(!RelayError::new(ErrorCode::RetriesExhausted, "x").is_transport_closed());
    }

    #[test]
    fn display_includes_code_name() {
        let err = RelayError::new(ErrorCode::UnknownSensor, "CE7238J");
        assert_eq!(err.to_string(), "UNKNOWN_SENSOR (0x0101): CE7238J");
        assert_eq!(err.code(), Some(ErrorCode::UnknownSensor));
        assert_eq!(err.message(), "CE7238J");
    }
}
