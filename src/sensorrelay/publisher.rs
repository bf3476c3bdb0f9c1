use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use log::{debug, info};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::error::RelayError;
use crate::protocol::Event;
use crate::sensorrelay::config::PublisherConfig;
use crate::sensorrelay::net::connector::{connect_to_broker, WsStream};
use crate::sensorrelay::sensor::SensorSource;
use crate::sensorrelay::types::Reading;

/// Owns a set of sensors and forwards their readings to the broker.
///
/// Sources are polled strictly in registration order and each reading is
/// sent before the next source is looked at, so one slow send holds back
/// every sensor behind it.
pub struct Publisher {
    ws: WsStream,
    poll_interval: Duration,
    sensors: Vec<Arc<dyn SensorSource>>,
}

impl Publisher {
    /// Opens the connection. Failure is returned as is, there is no retry.
    pub async fn connect(config: &PublisherConfig) -> Result<Self, RelayError> {
        let ws = connect_to_broker(&config.url).await?;
        Ok(Self {
            ws,
            poll_interval: config.poll_interval(),
            sensors: Vec::new(),
        })
    }

    /// Registers a source with the broker and takes ownership of it. The
    /// source is only polled once `sensor_connect` went out.
    pub async fn add_sensor(&mut self, sensor: Arc<dyn SensorSource>) -> Result<(), RelayError> {
        let sensor_id = sensor.id().to_string();
        self.send(&Event::SensorConnect {
            sensor_id: sensor_id.clone(),
        })
        .await?;
        self.sensors.push(sensor);
        info!("Registered sensor {}", sensor_id);
        Ok(())
    }

    pub fn sensor_ids(&self) -> Vec<String> {
        self.sensors.iter().map(|s| s.id().to_string()).collect()
    }

    /// One pass over all sources. Returns how many readings were sent.
    pub async fn poll_once(&mut self) -> Result<usize, RelayError> {
        let mut sent = 0;
        for index in 0..self.sensors.len() {
            let sensor = self.sensors[index].clone();
            if !sensor.has_new_data() {
                continue;
            }
            let Some(value) = sensor.read() else { continue };
            debug!("Forwarding reading of {}", sensor.id());
            self.send(&Event::NewSensorData(Reading::new(sensor.id(), value)))
                .await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Polls forever on the configured period. Returns only on a send error.
    pub async fn poll_loop(&mut self) -> Result<(), RelayError> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await?;
        }
    }

    /// Closes the transport. The broker is not told which sensors went away.
    pub async fn close(mut self) -> Result<(), RelayError> {
        info!("Closing publisher with {} sensors", self.sensors.len());
        self.ws.close(None).await?;
        Ok(())
    }

    async fn send(&mut self, event: &Event) -> Result<(), RelayError> {
        let text = event.encode()?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    use super::*;
    use crate::sensorrelay::sensor::Sensor;

    async fn publisher_for(url: String) -> Publisher {
        let config = PublisherConfig {
            url,
            ..PublisherConfig::default()
        };
        Publisher::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn sensors_are_announced_then_polled_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut events = Vec::new();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                events.push(Event::decode(text.as_str()).unwrap());
            }
            events
        });

        let mut publisher = publisher_for(url).await;
        let first = Sensor::idle("CE7238J");
        let second = Sensor::idle("CF9382K");
        publisher.add_sensor(first.clone()).await.unwrap();
        publisher.add_sensor(second.clone()).await.unwrap();
        assert_eq!(publisher.sensor_ids(), vec!["CE7238J", "CF9382K"]);

        second.push(json!("abc"));
        first.push(json!(42));
        assert_eq!(publisher.poll_once().await.unwrap(), 2);
        assert_eq!(publisher.poll_once().await.unwrap(), 0);
        publisher.close().await.unwrap();

        assert_eq!(
            broker.await.unwrap(),
            vec![
                Event::SensorConnect {
                    sensor_id: "CE7238J".into()
                },
                Event::SensorConnect {
                    sensor_id: "CF9382K".into()
                },
                Event::NewSensorData(Reading::new("CE7238J", json!(42))),
                Event::NewSensorData(Reading::new("CF9382K", json!("abc"))),
            ]
        );
    }

    #[tokio::test]
    async fn sensor_is_not_kept_when_registration_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Handshake, then hang up.
            drop(tokio_tungstenite::accept_async(stream).await.unwrap());
        });

        let mut publisher = publisher_for(url).await;
        broker.await.unwrap();

        // The first writes after a hang-up can still land in the socket buffer.
        let mut rejected = None;
        for n in 0..50 {
            let sensor = Sensor::idle(format!("S{:06}", n));
            if publisher.add_sensor(sensor).await.is_err() {
                rejected = Some(format!("S{:06}", n));
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let rejected = rejected.expect("sending to a closed broker never failed");
        assert!(!publisher.sensor_ids().contains(&rejected));
    }
}
