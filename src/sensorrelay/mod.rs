pub mod callbacks;
pub mod client;
pub mod config;
pub mod handler;
pub mod net;
pub mod publisher;
pub mod sensor;
pub mod subscriber;
pub mod subscriptions;
pub mod types;

use log::info;

use config::RelayConfig;
use net::server::Broker;

use crate::error::RelayError;

/// Runs a broker on the configured address until Ctrl-C
pub async fn init(config: RelayConfig) -> Result<(), RelayError> {
    let broker = Broker::new();
    broker.start(&config.broker.addr).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    broker.stop();
    Ok(())
}
