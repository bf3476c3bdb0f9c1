use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ErrorCode, RelayError};

/// Client side of a broker connection
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens one WebSocket connection to the broker. No retry.
pub async fn connect_to_broker(url: &str) -> Result<WsStream, RelayError> {
    debug!("Attempting to connect to broker at {}", url);
    let (ws, _response) = connect_async(url).await.map_err(|e| {
        RelayError::new(
            ErrorCode::ConnectionFailed,
            format!("Connection to {} failed: {}", url, e),
        )
    })?;

    if let MaybeTlsStream::Plain(tcp) = ws.get_ref() {
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", url, e);
        }
    }
    info!("Connected to broker at {}", url);
    Ok(ws)
}
