use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{ErrorCode, RelayError};
use crate::protocol::Event;
use crate::sensorrelay::client::ClientRegistry;
use crate::sensorrelay::subscriptions::SensorRegistry;
use crate::sensorrelay::types::{ConnectionId, Reading};

/// Broker routing state shared by every connection task
pub struct EventHandler {
    pub sensors: Arc<SensorRegistry>,
    pub clients: Arc<ClientRegistry>,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new(Arc::new(SensorRegistry::new()), Arc::new(ClientRegistry::new()))
    }
}

impl EventHandler {
    pub fn new(sensors: Arc<SensorRegistry>, clients: Arc<ClientRegistry>) -> Self {
        Self { sensors, clients }
    }

    pub fn register_sensor(&self, sensor_id: &str) {
        self.sensors.register(sensor_id);
    }

    /// Fans a reading out to a snapshot of the sensor's subscribers.
    ///
    /// Returns the number of connections that accepted the reading. A reading
    /// for a sensor that was never registered is not routed.
    pub fn route_reading(&self, reading: &Reading) -> Result<usize, RelayError> {
        let Some(subscribers) = self.sensors.subscribers(&reading.sensor_id) else {
            return Err(RelayError::new(
                ErrorCode::UnknownSensor,
                format!("Reading for unregistered sensor {}", reading.sensor_id),
            ));
        };

        debug!(
            "Routing reading of {} to {} subscribers",
            reading.sensor_id,
            subscribers.len()
        );
        let event = Event::NewSensorData(reading.clone());
        Ok(self.clients.send_to(&subscribers, &event))
    }

    pub fn subscribe(&self, sensor_id: &str, conn: ConnectionId) -> Result<(), RelayError> {
        self.sensors.subscribe(sensor_id, conn)?;
        info!("Connection {} subscribed to {}", conn, sensor_id);
        Ok(())
    }

    pub fn unsubscribe(&self, sensor_id: &str, conn: ConnectionId) -> Result<(), RelayError> {
        self.sensors.unsubscribe(sensor_id, conn)?;
        info!("Connection {} unsubscribed from {}", conn, sensor_id);
        Ok(())
    }

    /// `true` iff the sensor has been registered, whatever its subscriber count
    pub fn connection_status(&self, sensor_id: &str) -> bool {
        self.sensors.contains(sensor_id)
    }

    pub fn client_connect(&self, conn: ConnectionId) {
        if self.clients.mark_client(conn) {
            info!("Client {} connected", conn);
        } else {
            debug!("Client {} announced itself again", conn);
        }
    }

    pub fn client_disconnect(&self, conn: ConnectionId) {
        if self.clients.unmark_client(conn) {
            info!("Client {} disconnected", conn);
        } else {
            warn!("client_disconnect from {} which never sent client_connect", conn);
        }
    }

    /// Transport-level closure: forget the connection everywhere
    pub fn connection_closed(&self, conn: ConnectionId) {
        self.clients.unregister(conn);
        self.sensors.remove_connection(conn);
        info!("Connection {} cleaned up", conn);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sensorrelay::client::test_support::RecordingSender;
    use crate::sensorrelay::client::ClientSender;

    #[test]
    fn reading_for_unregistered_sensor_is_not_routed() {
        let handler = EventHandler::default();
        let err = handler
            .route_reading(&Reading::new("CE7238J", json!(42)))
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownSensor));
    }

    #[test]
    fn reading_fans_out_to_every_subscriber() {
        let handler = EventHandler::default();
        let c1 = RecordingSender::new();
        let c2 = RecordingSender::new();
        let other = RecordingSender::new();
        for sender in [&c1, &c2, &other] {
            handler.clients.register(sender.clone());
        }

        handler.register_sensor("CE7238J");
        handler.subscribe("CE7238J", c1.id()).unwrap();
        handler.subscribe("CE7238J", c2.id()).unwrap();

        let reading = Reading::new("CE7238J", json!(42));
        assert_eq!(handler.route_reading(&reading).unwrap(), 2);

        let expected = vec![Event::NewSensorData(reading)];
        assert_eq!(c1.sent(), expected);
        assert_eq!(c2.sent(), expected);
        assert!(other.sent().is_empty());
    }

    #[test]
    fn status_ignores_subscriber_count() {
        let handler = EventHandler::default();
        assert!(!handler.connection_status("CF9382K"));
        handler.register_sensor("CF9382K");
        assert!(handler.connection_status("CF9382K"));
    }

    #[test]
    fn closed_connection_leaves_all_sets() {
        let handler = EventHandler::default();
        let client = RecordingSender::new();
        handler.clients.register(client.clone());
        handler.client_connect(client.id());
        handler.register_sensor("s1");
        handler.subscribe("s1", client.id()).unwrap();

        handler.connection_closed(client.id());

        assert!(!handler.clients.is_client(client.id()));
        assert!(!handler.sensors.is_subscribed("s1", client.id()));
        assert!(handler.connection_status("s1"));
        assert_eq!(handler.route_reading(&Reading::new("s1", json!(1))).unwrap(), 0);
    }
}
