use std::io::Write;

use log::{error, info};
use sensorrelay::sensorrelay::config::RelayConfig;
use sensorrelay::sensorrelay::init;

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

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logger();

    info!("Sensor relay starting up");

    // Fall back to defaults when there is no config.toml next to the binary
    let config = match RelayConfig::from_toml_file("config.toml") {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) if std::path::Path::new("config.toml").exists() => {
            error!("Failed to load configuration: {}", e);
            return Err(std::io::Error::other(e.to_string()));
        }
        Err(_) => {
            info!("No config.toml found, using defaults");
            RelayConfig::default()
        }
    };

    info!("Starting broker on {}", config.broker.addr);
    if let Err(e) = init(config).await {
        error!("Broker failed: {}", e);
        return Err(std::io::Error::other(e.to_string()));
    }

    Ok(())
}
