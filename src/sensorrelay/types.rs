use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sensor identifier, opaque and globally unique by convention
pub type SensorId = String;

/// Identifies one accepted broker connection
pub type ConnectionId = Uuid;

/// Mapping: sensor → connections subscribed to it
pub type Subscriptions = DashMap<SensorId, HashSet<ConnectionId>>;

/// One value produced by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: SensorId,
    #[serde(rename = "sensor_readings")]
    pub value: Value,
}

impl Reading {
    pub fn new(sensor_id: impl Into<SensorId>, value: Value) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
        }
    }
}
