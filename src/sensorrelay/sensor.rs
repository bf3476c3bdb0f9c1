//! Stand-in data sources for publishers.
//!
//! A [`Sensor`] refreshes a single-slot buffer on its own timer. Readers see
//! only the newest value: anything not read before the next refresh is lost.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::sensorrelay::types::SensorId;

/// Polling interface a publisher needs from a source
pub trait SensorSource: Send + Sync {
    fn id(&self) -> &str;

    fn has_new_data(&self) -> bool;

    /// Takes the pending value, leaving the buffer empty
    fn read(&self) -> Option<Value>;
}

/// The kinds of values a sensor can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Integer in `1..=100`
    Integer,
    /// 10 random alphanumeric characters
    Text,
}

impl SensorKind {
    pub fn generate(&self) -> Value {
        let mut rng = rand::rng();
        match self {
            Self::Integer => Value::from(rng.random_range(1..=100)),
            Self::Text => Value::from(random_alphanumeric(&mut rng, 10)),
        }
    }
}

/// Random 7-character identifier, used when a sensor is created without one
pub fn random_sensor_id() -> SensorId {
    random_alphanumeric(&mut rand::rng(), 7)
}

fn random_alphanumeric<R: Rng>(rng: &mut R, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A sensor with a newest-wins buffer
pub struct Sensor {
    id: SensorId,
    slot: Mutex<Option<Value>>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl Sensor {
    /// Sensor without a refresh loop; values arrive through [`Sensor::push`].
    pub fn idle(id: impl Into<SensorId>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            slot: Mutex::new(None),
            refresh: Mutex::new(None),
        })
    }

    /// Starts a sensor that stores a fresh `kind` value every `period`,
    /// beginning immediately. Must be called inside a Tokio runtime.
    pub fn spawn(id: Option<SensorId>, kind: SensorKind, period: Duration) -> Arc<Self> {
        let sensor = Self::idle(id.unwrap_or_else(random_sensor_id));

        let weak = Arc::downgrade(&sensor);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Stop once the last owner is gone.
                let Some(sensor) = weak.upgrade() else { break };
                sensor.push(kind.generate());
            }
        });
        *sensor
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        sensor
    }

    /// Stores a value, overwriting any unread one
    pub fn push(&self, value: Value) {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value);
        if previous.is_some() {
            debug!("Sensor {} overwrote an unread value", self.id);
        }
    }

    /// Stops the refresh loop, if any
    pub fn stop(&self) {
        if let Some(handle) = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl SensorSource for Sensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_new_data(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn read(&self) -> Option<Value> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn newest_value_wins() {
        let sensor = Sensor::idle("CE7238J");
        assert!(!sensor.has_new_data());

        sensor.push(json!(1));
        sensor.push(json!(2));
        assert!(sensor.has_new_data());
        assert_eq!(sensor.read(), Some(json!(2)));
        assert!(!sensor.has_new_data());
        assert_eq!(sensor.read(), None);
    }

    #[test]
    fn kinds_generate_expected_shapes() {
        for _ in 0..50 {
            let n = SensorKind::Integer.generate().as_i64().unwrap();
            assert!((1..=100).contains(&n));
        }
        let text = SensorKind::Text.generate();
        let text = text.as_str().unwrap();
        assert_eq!(text.len(), 10);
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_ids_are_seven_chars() {
        let id = random_sensor_id();
        assert_eq!(id.len(), 7);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_fills_the_slot() {
        let sensor = Sensor::spawn(
            Some("CF9382K".into()),
            SensorKind::Text,
            Duration::from_secs(1),
        );
        assert_eq!(sensor.id(), "CF9382K");

        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sensor.has_new_data());
        sensor.read();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!sensor.has_new_data());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(sensor.has_new_data());

        sensor.stop();
    }
}
