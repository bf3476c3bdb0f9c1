use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorCode, RelayError};
use crate::protocol::types::EventType;
use crate::sensorrelay::types::{Reading, SensorId};

/// Raw `{event, data}` frame as it travels over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
struct SensorRef {
    sensor_id: SensorId,
}

#[derive(Deserialize)]
struct StatusData {
    sensor_id: SensorId,
    #[serde(default)]
    connected: Option<bool>,
}

/// A decoded envelope. Every frame is decoded exactly once into one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ClientConnect,
    ClientDisconnect,
    SensorConnect { sensor_id: SensorId },
    NewSensorData(Reading),
    /// `sensor_connection_status` without `connected`
    StatusQuery { sensor_id: SensorId },
    /// `sensor_connection_status` with `connected`
    StatusReply { sensor_id: SensorId, connected: bool },
    Subscribe { sensor_id: SensorId },
    Unsubscribe { sensor_id: SensorId },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ClientConnect => EventType::ClientConnect,
            Self::ClientDisconnect => EventType::ClientDisconnect,
            Self::SensorConnect { .. } => EventType::SensorConnect,
            Self::NewSensorData(_) => EventType::NewSensorData,
            Self::StatusQuery { .. } | Self::StatusReply { .. } => {
                EventType::SensorConnectionStatus
            }
            Self::Subscribe { .. } => EventType::SubscribeSensor,
            Self::Unsubscribe { .. } => EventType::UnsubscribeSensor,
        }
    }

    /// Sensor this event refers to, if any
    pub fn sensor_id(&self) -> Option<&str> {
        match self {
            Self::ClientConnect | Self::ClientDisconnect => None,
            Self::NewSensorData(reading) => Some(&reading.sensor_id),
            Self::SensorConnect { sensor_id }
            | Self::StatusQuery { sensor_id }
            | Self::StatusReply { sensor_id, .. }
            | Self::Subscribe { sensor_id }
            | Self::Unsubscribe { sensor_id } => Some(sensor_id),
        }
    }

    /// Parse one text frame
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
            RelayError::new(ErrorCode::MalformedEnvelope, format!("Invalid envelope: {}", e))
        })?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, RelayError> {
        let event_type = EventType::from_name(&envelope.event)?;
        debug!("Decoding {:?} envelope", event_type);

        let event = match event_type {
            EventType::ClientConnect => Self::ClientConnect,
            EventType::ClientDisconnect => Self::ClientDisconnect,
            EventType::SensorConnect => Self::SensorConnect {
                sensor_id: data_field::<SensorRef>(event_type, envelope.data)?.sensor_id,
            },
            EventType::NewSensorData => {
                Self::NewSensorData(data_field::<Reading>(event_type, envelope.data)?)
            }
            EventType::SensorConnectionStatus => {
                let status = data_field::<StatusData>(event_type, envelope.data)?;
                match status.connected {
                    Some(connected) => Self::StatusReply {
                        sensor_id: status.sensor_id,
                        connected,
                    },
                    None => Self::StatusQuery {
                        sensor_id: status.sensor_id,
                    },
                }
            }
            EventType::SubscribeSensor => Self::Subscribe {
                sensor_id: data_field::<SensorRef>(event_type, envelope.data)?.sensor_id,
            },
            EventType::UnsubscribeSensor => Self::Unsubscribe {
                sensor_id: data_field::<SensorRef>(event_type, envelope.data)?.sensor_id,
            },
        };
        Ok(event)
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            // The lifecycle events carry an empty string rather than an object.
            Self::ClientConnect | Self::ClientDisconnect => Value::String(String::new()),
            Self::NewSensorData(reading) => json!({
                "sensor_id": reading.sensor_id,
                "sensor_readings": reading.value,
            }),
            Self::StatusReply {
                sensor_id,
                connected,
            } => json!({ "sensor_id": sensor_id, "connected": connected }),
            Self::SensorConnect { sensor_id }
            | Self::StatusQuery { sensor_id }
            | Self::Subscribe { sensor_id }
            | Self::Unsubscribe { sensor_id } => json!({ "sensor_id": sensor_id }),
        };
        Envelope {
            event: self.event_type().as_str().to_string(),
            data,
        }
    }

    /// Serialize into a text frame
    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(&self.to_envelope())?)
    }
}

fn data_field<T: DeserializeOwned>(event_type: EventType, data: Value) -> Result<T, RelayError> {
    serde_json::from_value(data).map_err(|e| {
        RelayError::new(
            ErrorCode::MalformedEnvelope,
            format!("Bad data for {}: {}", event_type.as_str(), e),
        )
    })
}
