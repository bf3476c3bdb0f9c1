use std::collections::HashSet;

use dashmap::DashMap;
use log::{debug, info};

use crate::error::{ErrorCode, RelayError};
use crate::sensorrelay::types::{ConnectionId, SensorId, Subscriptions};

/// Sensor registry: every sensor ever registered, with its subscriber set.
///
/// Entries are created by the first `sensor_connect` for an id and are never
/// removed. A sensor with no subscribers is still "connected".
#[derive(Default)]
pub struct SensorRegistry {
    inner: Subscriptions,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Registers a sensor. Returns `true` if it was not known before.
    pub fn register(&self, sensor_id: &str) -> bool {
        let mut created = false;
        self.inner
            .entry(sensor_id.to_string())
            .or_insert_with(|| {
                created = true;
                HashSet::new()
            });

        if created {
            info!("Registered sensor {}", sensor_id);
        } else {
            debug!("Sensor {} already registered", sensor_id);
        }
        created
    }

    pub fn contains(&self, sensor_id: &str) -> bool {
        self.inner.contains_key(sensor_id)
    }

    /// Adds a subscriber to a registered sensor.
    ///
    /// Subscriptions to unknown sensors are discarded and reported as
    /// `UnknownSensor`; the caller has to subscribe again after registration.
    pub fn subscribe(&self, sensor_id: &str, conn: ConnectionId) -> Result<(), RelayError> {
        match self.inner.get_mut(sensor_id) {
            Some(mut subscribers) => {
                subscribers.insert(conn);
                debug!("Added {} to subscribers of {}", conn, sensor_id);
                Ok(())
            }
            None => Err(RelayError::new(
                ErrorCode::UnknownSensor,
                format!("Cannot subscribe to unregistered sensor {}", sensor_id),
            )),
        }
    }

    /// Removes a subscriber. Removing a non-member is reported, nothing changes.
    pub fn unsubscribe(&self, sensor_id: &str, conn: ConnectionId) -> Result<(), RelayError> {
        let Some(mut subscribers) = self.inner.get_mut(sensor_id) else {
            return Err(RelayError::new(
                ErrorCode::UnknownSensor,
                format!("Cannot unsubscribe from unregistered sensor {}", sensor_id),
            ));
        };

        if subscribers.remove(&conn) {
            debug!("Removed {} from subscribers of {}", conn, sensor_id);
            Ok(())
        } else {
            Err(RelayError::new(
                ErrorCode::UnknownSubscription,
                format!("{} is not subscribed to {}", conn, sensor_id),
            ))
        }
    }

    /// Snapshot of the subscriber set, `None` if the sensor is unknown.
    ///
    /// The shard lock is released before this returns, so callers can send
    /// to the snapshot without blocking other handlers.
    pub fn subscribers(&self, sensor_id: &str) -> Option<Vec<ConnectionId>> {
        self.inner
            .get(sensor_id)
            .map(|entry| entry.iter().copied().collect())
    }

    pub fn is_subscribed(&self, sensor_id: &str, conn: ConnectionId) -> bool {
        self.inner
            .get(sensor_id)
            .is_some_and(|entry| entry.contains(&conn))
    }

    /// Drops a connection from every subscriber set
    pub fn remove_connection(&self, conn: ConnectionId) {
        let mut removed = 0;
        for mut entry in self.inner.iter_mut() {
            if entry.value_mut().remove(&conn) {
                removed += 1;
            }
        }
        debug!("Removed {} from {} subscriber sets", conn, removed);
    }

    pub fn sensor_ids(&self) -> Vec<SensorId> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn register_is_idempotent() {
        let registry = SensorRegistry::new();
        assert!(registry.register("CE7238J"));
        assert!(!registry.register("CE7238J"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscribers("CE7238J"), Some(vec![]));
    }

    #[test]
    fn subscribe_before_registration_is_discarded() {
        let registry = SensorRegistry::new();
        let conn = Uuid::new_v4();

        let err = registry.subscribe("CE7238J", conn).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownSensor));
        assert!(!registry.contains("CE7238J"));

        registry.register("CE7238J");
        assert!(!registry.is_subscribed("CE7238J", conn));

        registry.subscribe("CE7238J", conn).unwrap();
        assert!(registry.is_subscribed("CE7238J", conn));
    }

    #[test]
    fn unsubscribe_non_member_is_reported() {
        let registry = SensorRegistry::new();
        let conn = Uuid::new_v4();
        registry.register("CF9382K");

        let err = registry.unsubscribe("CF9382K", conn).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownSubscription));

        registry.subscribe("CF9382K", conn).unwrap();
        registry.unsubscribe("CF9382K", conn).unwrap();
        assert_eq!(registry.subscribers("CF9382K"), Some(vec![]));
        // sensor stays registered with an empty set
        assert!(registry.contains("CF9382K"));
    }

    #[test]
    fn remove_connection_clears_every_set() {
        let registry = SensorRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for id in ["s1", "s2"] {
            registry.register(id);
            registry.subscribe(id, a).unwrap();
            registry.subscribe(id, b).unwrap();
        }

        registry.remove_connection(a);
        assert_eq!(registry.subscribers("s1"), Some(vec![b]));
        assert_eq!(registry.subscribers("s2"), Some(vec![b]));
        assert_eq!(registry.len(), 2);
    }
}
