use log::error;

use crate::error::{ErrorCode, RelayError};

/// Event names carried in the `event` field of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Subscriber lifecycle
    ClientConnect,
    ClientDisconnect,

    // Publisher
    SensorConnect,
    NewSensorData,

    // Subscriber requests
    SensorConnectionStatus,
    SubscribeSensor,
    UnsubscribeSensor,
}

impl EventType {
    /// Resolve a wire name to an EventType
    pub fn from_name(name: &str) -> Result<Self, RelayError> {
        match name {
            "client_connect" => Ok(Self::ClientConnect),
            "client_disconnect" => Ok(Self::ClientDisconnect),
            "sensor_connect" => Ok(Self::SensorConnect),
            "new_sensor_data" => Ok(Self::NewSensorData),
            "sensor_connection_status" => Ok(Self::SensorConnectionStatus),
            "subscribe_sensor" => Ok(Self::SubscribeSensor),
            "unsubscribe_sensor" => Ok(Self::UnsubscribeSensor),
            _ => {
                error!("Unknown event name: {:?}", name);
                Err(RelayError::new(
                    ErrorCode::UnknownEvent,
                    format!("Unknown event: {}", name),
                ))
            }
        }
    }

    /// Wire name of this event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientConnect => "client_connect",
            Self::ClientDisconnect => "client_disconnect",
            Self::SensorConnect => "sensor_connect",
            Self::NewSensorData => "new_sensor_data",
            Self::SensorConnectionStatus => "sensor_connection_status",
            Self::SubscribeSensor => "subscribe_sensor",
            Self::UnsubscribeSensor => "unsubscribe_sensor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve_both_ways() {
        for ty in [
            EventType::ClientConnect,
            EventType::ClientDisconnect,
            EventType::SensorConnect,
            EventType::NewSensorData,
            EventType::SensorConnectionStatus,
            EventType::SubscribeSensor,
            EventType::UnsubscribeSensor,
        ] {
            assert_eq!(EventType::from_name(ty.as_str()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = EventType::from_name("sensor_disconnect").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownEvent));
    }
}
