use std::sync::Arc;

use log::{debug, error, warn};

use crate::protocol::Event;
use crate::sensorrelay::client::ClientSender;
use crate::sensorrelay::handler::EventHandler;

/// Applies one decoded event from `conn` to the broker state.
///
/// Every failure here is reported and contained; none of them end the
/// connection.
pub fn dispatch(handler: &EventHandler, conn: &Arc<dyn ClientSender>, event: Event) {
    let id = conn.id();
    debug!("Dispatching {:?} from {}", event.event_type(), id);

    match event {
        Event::ClientConnect => handler.client_connect(id),
        Event::ClientDisconnect => handler.client_disconnect(id),
        Event::SensorConnect { sensor_id } => handler.register_sensor(&sensor_id),
        Event::NewSensorData(reading) => {
            if let Err(e) = handler.route_reading(&reading) {
                warn!("Dropping reading from {}: {}", id, e);
            }
        }
        Event::StatusQuery { sensor_id } => {
            let connected = handler.connection_status(&sensor_id);
            let reply = Event::StatusReply {
                sensor_id,
                connected,
            };
            if let Err(e) = conn.send_event(&reply) {
                error!("Failed to answer status query from {}: {}", id, e);
            }
        }
        Event::StatusReply { sensor_id, .. } => {
            warn!("Ignoring status reply for {} sent by {}", sensor_id, id);
        }
        Event::Subscribe { sensor_id } => {
            if let Err(e) = handler.subscribe(&sensor_id, id) {
                warn!("Discarding subscription from {}: {}", id, e);
            }
        }
        Event::Unsubscribe { sensor_id } => {
            if let Err(e) = handler.unsubscribe(&sensor_id, id) {
                warn!("Ignoring unsubscribe from {}: {}", id, e);
            }
        }
    }
}
