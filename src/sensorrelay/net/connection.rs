use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::protocol::Event;
use crate::sensorrelay::client::ClientSender;
use crate::sensorrelay::handler::EventHandler;
use crate::sensorrelay::net::events::dispatch;
use crate::sensorrelay::types::ConnectionId;

/// Frames waiting for a slow peer before new ones are dropped
pub const OUTBOUND_QUEUE: usize = 256;

/// One accepted WebSocket peer, publisher or subscriber alike
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    write_tx: Sender<Message>,
    cancel_token: CancellationToken,
}

impl Connection {
    /// Registers the connection with the handler and starts its read and
    /// write tasks.
    pub fn spawn<S>(ws: WebSocketStream<S>, peer: SocketAddr, handler: Arc<EventHandler>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, reader) = ws.split();
        let (write_tx, write_rx) = channel::<Message>(OUTBOUND_QUEUE);

        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            write_tx,
            cancel_token: CancellationToken::new(),
        });
        handler.clients.register(conn.clone());

        let conn_read = conn.clone();
        tokio::spawn(async move {
            let id = conn_read.id;
            if let Err(e) = Connection::read_task(conn_read.clone(), reader, handler.clone()).await {
                warn!("Read task for {} ended with error: {}", id, e);
            }
            // Stop the writer too, then drop every trace of this connection.
            conn_read.cancel_token.cancel();
            handler.connection_closed(id);
        });

        let cancel = conn.cancel_token.clone();
        let id = conn.id;
        tokio::spawn(async move {
            if let Err(e) = Connection::write_task(writer, write_rx, cancel).await {
                warn!("Write task for {} ended with error: {}", id, e);
            }
        });

        info!("Connection {} accepted from {}", conn.id, conn.peer);
        conn
    }

    async fn read_task<S>(
        conn: Arc<Connection>,
        reader: SplitStream<WebSocketStream<S>>,
        handler: Arc<EventHandler>,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let token = conn.cancel_token.clone();
        tokio::select! {
            _ = token.cancelled() => Ok(()),
            res = Connection::read(conn, reader, handler) => res,
        }
    }

    async fn read<S>(
        conn: Arc<Connection>,
        mut reader: SplitStream<WebSocketStream<S>>,
        handler: Arc<EventHandler>,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sender: Arc<dyn ClientSender> = conn.clone();
        debug!("Starting read loop for {}", conn.id);

        while let Some(frame) = reader.next().await {
            match frame? {
                Message::Text(text) => {
                    debug!("Received {} bytes from {}", text.len(), conn.id);
                    match Event::decode(text.as_str()) {
                        Ok(event) => dispatch(&handler, &sender, event),
                        Err(e) if e.code() == Some(ErrorCode::UnknownEvent) => {
                            warn!("Ignoring frame from {}: {}", conn.id, e);
                        }
                        Err(e) => {
                            error!("Closing {} after malformed frame: {}", conn.id, e);
                            return Err(e);
                        }
                    }
                }
                Message::Close(_) => {
                    info!("Connection {} closed by peer", conn.id);
                    break;
                }
                other => debug!("Ignoring non-text frame from {}: {:?}", conn.id, other),
            }
        }
        Ok(())
    }

    async fn write_task<S>(
        mut writer: SplitSink<WebSocketStream<S>, Message>,
        mut rx: Receiver<Message>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Write task cancelled, sending close frame");
                    // The peer may already be gone; nothing to do about it.
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    return Ok(());
                }
                msg = rx.recv() => match msg {
                    Some(msg) => writer.send(msg).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl ClientSender for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_event(&self, event: &Event) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::new(ErrorCode::TransportClosed, "Connection is closed"));
        }
        let text = event.encode()?;
        match self.write_tx.try_send(Message::Text(text.into())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue of {} is full, dropping {:?}", self.id, event.event_type());
                Err(RelayError::new(ErrorCode::SendFailed, "Outbound queue is full"))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::new(
                ErrorCode::TransportClosed,
                "Write task has stopped",
            )),
        }
    }

    fn close(&self) {
        info!("Closing connection {}", self.id);
        self.cancel_token.cancel();
    }
}
