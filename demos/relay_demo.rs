use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use serde_json::{json, Value};
use sensorrelay::error::RelayError;
use sensorrelay::sensorrelay::config::{PublisherConfig, RelayConfig, SubscriberConfig};
use sensorrelay::sensorrelay::net::server::Broker;
use sensorrelay::sensorrelay::publisher::Publisher;
use sensorrelay::sensorrelay::sensor::{Sensor, SensorKind, SensorSource};
use sensorrelay::sensorrelay::subscriber::Subscriber;

fn init_logger() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}:{}] {} - {}",
                buf.timestamp_millis(),
                record.module_path().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn print_with_args(sensor_id: &str, readings: &Value, args: &[Value]) {
    println!("Received readings from {} for {}: {}", sensor_id, args[0], readings);
    println!("extra args: {:?}\n", args);
}

fn print_plain(sensor_id: &str, readings: &Value, _args: &[Value]) {
    println!("Sensor: {}", sensor_id);
    println!("Sensor data: {}\n", readings);
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    init_logger();
    let config = RelayConfig::default();

    let broker = Broker::new();
    let addr = broker.start(&config.broker.addr).await?;
    let url = format!("ws://{}", addr);

    let refresh = config.sensors.refresh_interval();
    let sensor1 = Sensor::spawn(Some("CE7238J".into()), SensorKind::Integer, refresh);
    let sensor2 = Sensor::spawn(Some("CF9382K".into()), SensorKind::Text, refresh);
    let sensor3 = Sensor::spawn(None, SensorKind::Text, refresh);

    let publisher_config = PublisherConfig {
        url: url.clone(),
        ..config.publisher.clone()
    };
    let mut agent1 = Publisher::connect(&publisher_config).await?;
    let mut agent2 = Publisher::connect(&publisher_config).await?;
    agent1.add_sensor(sensor1.clone()).await?;
    agent1.add_sensor(sensor2.clone()).await?;
    agent2.add_sensor(sensor2.clone()).await?;
    agent2.add_sensor(sensor3.clone()).await?;

    let client1 = Arc::new(Subscriber::new(SubscriberConfig::new(url.clone())));
    let client2 = Arc::new(Subscriber::new(SubscriberConfig::new(url)));
    client1.connect().await?;
    client2.connect().await?;

    let is_connected = client1.sensor_connected("CE7238J").await?;
    info!("Sensor CE7238J is connected: {}", is_connected);
    if is_connected {
        client1.subscribe("CE7238J").await?;
        client2.subscribe("CE7238J").await?;
    }

    client1
        .register_callback("CE7238J", print_with_args, [json!("client1"), json!("sensor1")])
        .await?;
    client2
        .register_callback("CE7238J", print_plain, Vec::new())
        .await?;
    client1
        .register_callback(sensor2.id(), print_with_args, [json!("client1"), json!("sensor2")])
        .await?;
    client2
        .register_callback(sensor3.id(), print_plain, Vec::new())
        .await?;

    let listener1 = tokio::spawn({
        let client = client1.clone();
        async move { client.listen().await }
    });
    let listener2 = tokio::spawn({
        let client = client2.clone();
        async move { client.listen().await }
    });

    let run = async {
        tokio::try_join!(agent1.poll_loop(), agent2.poll_loop())?;
        Ok::<(), RelayError>(())
    };
    tokio::select! {
        result = run => if let Err(e) = result {
            error!("Publisher stopped: {}", e);
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(30)) => info!("Demo finished"),
    }

    agent1.close().await?;
    agent2.close().await?;
    client1.unsubscribe("CE7238J").await?;
    client1.disconnect().await?;
    client2.disconnect().await?;
    for listener in [listener1, listener2] {
        if let Ok(Err(e)) = listener.await {
            error!("Listener failed: {}", e);
        }
    }
    broker.stop();
    Ok(())
}
