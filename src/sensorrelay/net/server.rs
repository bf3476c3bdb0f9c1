use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::sensorrelay::handler::EventHandler;
use crate::sensorrelay::net::connection::Connection;

/// The routing authority. Owns the registry; listening can be started and
/// stopped repeatedly without losing it.
#[derive(Default)]
pub struct Broker {
    handler: Arc<EventHandler>,
    listener_token: Mutex<Option<CancellationToken>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> &Arc<EventHandler> {
        &self.handler
    }

    /// Binds `addr` and accepts connections in the background.
    /// Returns the address actually bound.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let token = CancellationToken::new();
        let previous = self
            .listener_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            warn!("Broker was already listening, stopping the previous listener");
            previous.cancel();
        }

        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = run_event_server(listener, handler, token).await {
                error!("Event server stopped: {}", e);
            }
        });

        info!("Broker listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting and closes every known client connection.
    pub fn stop(&self) {
        if let Some(token) = self
            .listener_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        let closed = self.handler.clients.close_clients();
        info!("Broker stopped, {} clients closed", closed);
    }
}

/// Accept loop: each connection gets its own handshake and tasks
pub async fn run_event_server(
    listener: TcpListener,
    handler: Arc<EventHandler>,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Event server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for connection from {}: {}", addr, e);
        }
        info!("New connection from {}", addr);

        let handler = handler.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    Connection::spawn(ws, addr, handler);
                }
                Err(e) => warn!("WebSocket handshake with {} failed: {}", addr, e),
            }
        });
    }
}
