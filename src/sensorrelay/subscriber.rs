use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as SyncMutex, PoisonError};

use dashmap::{DashMap, DashSet};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, RelayError};
use crate::protocol::Event;
use crate::sensorrelay::callbacks::{CallbackRegistration, CallbackTable, Dispatcher};
use crate::sensorrelay::config::SubscriberConfig;
use crate::sensorrelay::net::connector::{connect_to_broker, WsStream};
use crate::sensorrelay::net::reconnector::RetryPolicy;
use crate::sensorrelay::types::SensorId;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Receives readings for the sensors it subscribed to and hands them to the
/// registered callbacks.
///
/// Every send goes through [`Subscriber::send_resilient`], which reconnects
/// on transport loss. After each reconnect the local subscription set is
/// replayed to the broker unless `replay_subscriptions` is off, in which case
/// callbacks stay registered locally but receive nothing until the caller
/// subscribes again.
///
/// Callbacks run on a separate worker fed by a bounded queue; the receive
/// loop only enqueues.
pub struct Subscriber {
    config: SubscriberConfig,
    retry: RetryPolicy,
    sink: Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    /// Frames read early while checking for a closed transport
    drained: SyncMutex<VecDeque<Event>>,
    reconnect_lock: Mutex<()>,
    /// Bumped on every successful (re)connect
    generation: AtomicU64,
    subscriptions: DashSet<SensorId>,
    callbacks: CallbackTable,
    pending_status: DashMap<SensorId, VecDeque<oneshot::Sender<bool>>>,
    dispatcher: Dispatcher,
    closing: CancellationToken,
}

impl Subscriber {
    /// Must be called inside a Tokio runtime; the callback worker starts here.
    pub fn new(config: SubscriberConfig) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        let dispatcher = Dispatcher::spawn(config.dispatch_queue);
        Self {
            config,
            retry,
            sink: Mutex::new(None),
            source: Mutex::new(None),
            drained: SyncMutex::new(VecDeque::new()),
            reconnect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            subscriptions: DashSet::new(),
            callbacks: CallbackTable::new(),
            pending_status: DashMap::new(),
            dispatcher,
            closing: CancellationToken::new(),
        }
    }

    /// Opens the transport and announces this subscriber with `client_connect`.
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.closing.is_cancelled() {
            return Err(disconnected());
        }
        let _guard = self.reconnect_lock.lock().await;
        self.open().await
    }

    async fn open(&self) -> Result<(), RelayError> {
        let ws = connect_to_broker(&self.config.url).await?;
        let (mut sink, source) = ws.split();

        // Announce and replay on the new transport before anyone else can use it.
        sink.send(text_frame(&Event::ClientConnect)?).await?;
        if self.config.replay_subscriptions {
            let sensor_ids = self.subscriptions();
            for sensor_id in &sensor_ids {
                sink.send(text_frame(&Event::Subscribe {
                    sensor_id: sensor_id.clone(),
                })?)
                .await?;
            }
            if !sensor_ids.is_empty() {
                info!("Replayed {} subscriptions", sensor_ids.len());
            }
        }

        // Source first: a usable sink always has a live source behind it.
        *self.source.lock().await = Some(source);
        let mut sink_guard = self.sink.lock().await;
        *sink_guard = Some(sink);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(sink_guard);

        info!(
            "Subscriber connected to {} (connection #{})",
            self.config.url, generation
        );
        Ok(())
    }

    /// Reconnects unless someone already did since `seen` was observed.
    async fn reconnect(&self, seen: u64) -> Result<(), RelayError> {
        if self.closing.is_cancelled() {
            return Err(disconnected());
        }
        let _guard = self.reconnect_lock.lock().await;
        if self.generation() != seen {
            debug!("Already reconnected, skipping");
            return Ok(());
        }
        warn!("Connection lost, reconnecting to {}", self.config.url);
        self.open().await
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn try_send(&self, text: &str) -> Result<(), RelayError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(RelayError::new(ErrorCode::NotConnected, "No open connection"));
        };
        if self.peer_closed() {
            *guard = None;
            return Err(RelayError::new(
                ErrorCode::TransportClosed,
                "Broker closed the connection",
            ));
        }
        if let Err(e) = sink.send(Message::Text(text.to_owned().into())).await {
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Drains frames the transport already holds, without waiting, so a
    /// Close from the broker is noticed even when nobody is listening. Text
    /// frames met on the way are kept for the next reader.
    fn peer_closed(&self) -> bool {
        // An active reader owns the source and sees the Close itself.
        let Ok(mut guard) = self.source.try_lock() else {
            return false;
        };
        let Some(source) = guard.as_mut() else {
            // A reader already dropped it and is reconnecting.
            return true;
        };
        loop {
            match source.next().now_or_never() {
                None => return false,
                Some(Some(Ok(Message::Text(text)))) => match Event::decode(text.as_str()) {
                    Ok(event) => self
                        .drained
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_back(event),
                    Err(e) => warn!("Skipping frame from broker: {}", e),
                },
                Some(Some(Ok(Message::Close(frame)))) => {
                    info!("Broker closed the connection: {:?}", frame);
                    break;
                }
                Some(Some(Ok(_))) => {}
                Some(Some(Err(e))) => {
                    warn!("Connection to broker failed: {}", e);
                    break;
                }
                Some(None) => break,
            }
        }
        *guard = None;
        true
    }

    /// Sends `event`, reconnecting and resending the same frame on transport
    /// loss. Gives up with `RetriesExhausted` after the configured attempts.
    ///
    /// A frame can reach the broker twice if the transport dies after the
    /// broker read it; there is no idempotency token.
    pub async fn send_resilient(&self, event: &Event) -> Result<(), RelayError> {
        let text = event.encode()?;
        let name = event.event_type().as_str();
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            if self.closing.is_cancelled() {
                return Err(disconnected());
            }
            let seen = self.generation();
            let err = match self.try_send(&text).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport_closed() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                return Err(RelayError::new(
                    ErrorCode::RetriesExhausted,
                    format!("Sending {} failed after {} attempts: {}", name, attempt, err),
                ));
            }
            let delay = self.retry.backoff(attempt);
            warn!(
                "Sending {} failed (attempt {}/{}): {}, reconnecting in {:?}",
                name, attempt, max_attempts, err, delay
            );
            sleep(delay).await;
            if let Err(e) = self.reconnect(seen).await {
                warn!("Reconnect failed: {}", e);
            }
            attempt += 1;
        }
    }

    pub async fn subscribe(&self, sensor_id: &str) -> Result<(), RelayError> {
        self.subscriptions.insert(sensor_id.to_string());
        let result = self
            .send_resilient(&Event::Subscribe {
                sensor_id: sensor_id.to_string(),
            })
            .await;
        if result.is_err() {
            self.subscriptions.remove(sensor_id);
        }
        result
    }

    pub async fn unsubscribe(&self, sensor_id: &str) -> Result<(), RelayError> {
        self.subscriptions.remove(sensor_id);
        self.send_resilient(&Event::Unsubscribe {
            sensor_id: sensor_id.to_string(),
        })
        .await
    }

    /// Sensors this subscriber believes it is subscribed to
    pub fn subscriptions(&self) -> Vec<SensorId> {
        let mut ids: Vec<SensorId> = self.subscriptions.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Stores the callback for `sensor_id`, replacing any previous one, and
    /// subscribes to the sensor.
    pub async fn register_callback<F, I>(
        &self,
        sensor_id: &str,
        callback: F,
        args: I,
    ) -> Result<(), RelayError>
    where
        F: Fn(&str, &Value, &[Value]) + Send + Sync + 'static,
        I: IntoIterator<Item = Value>,
    {
        let registration = CallbackRegistration::new(callback, args.into_iter().collect());
        if self.callbacks.insert(sensor_id, registration) {
            info!("Replaced callback for {}", sensor_id);
        }
        self.subscribe(sensor_id).await
    }

    /// Drops the callback for `sensor_id` and unsubscribes. Fails with
    /// `UnknownSubscription`, sending nothing, if no callback was registered.
    pub async fn remove_callback(&self, sensor_id: &str) -> Result<(), RelayError> {
        if self.callbacks.remove(sensor_id).is_none() {
            return Err(RelayError::new(
                ErrorCode::UnknownSubscription,
                format!("No callback registered for {}", sensor_id),
            ));
        }
        self.unsubscribe(sensor_id).await
    }

    pub fn has_callback(&self, sensor_id: &str) -> bool {
        self.callbacks.contains(sensor_id)
    }

    /// Asks the broker whether `sensor_id` has been registered.
    ///
    /// Replies are matched by sensor id, so readings arriving in between are
    /// delivered normally. Works with or without a concurrent [`listen`].
    ///
    /// [`listen`]: Subscriber::listen
    pub async fn sensor_connected(&self, sensor_id: &str) -> Result<bool, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.pending_status
            .entry(sensor_id.to_string())
            .or_default()
            .push_back(tx);

        // `rx` is gone by the time this returns, so our waiter reads as closed.
        let result = self.await_status(sensor_id, rx).await;
        if result.is_err() {
            self.prune_status_waiters(sensor_id);
        }
        result
    }

    async fn await_status(
        &self,
        sensor_id: &str,
        mut rx: oneshot::Receiver<bool>,
    ) -> Result<bool, RelayError> {
        let query = Event::StatusQuery {
            sensor_id: sensor_id.to_string(),
        };
        self.send_resilient(&query).await?;
        let mut sent_on = self.generation();

        loop {
            // Waiting for the reader slot is cancel-safe; reading is not, so
            // once we hold the slot we read to completion.
            let guard = tokio::select! {
                biased;
                reply = &mut rx => return reply.map_err(|_| disconnected()),
                guard = self.source.lock() => guard,
            };
            if let Ok(connected) = rx.try_recv() {
                return Ok(connected);
            }
            if !self.pump(guard).await? {
                return Err(disconnected());
            }
            // The query died with the old transport; ask again.
            if self.generation() != sent_on {
                self.send_resilient(&query).await?;
                sent_on = self.generation();
            }
        }
    }

    /// Receives until [`disconnect`](Subscriber::disconnect) is called,
    /// reconnecting on transport loss. Returns an error only when
    /// reconnecting is exhausted.
    pub async fn listen(&self) -> Result<(), RelayError> {
        info!("Listening for sensor data");
        loop {
            let alive = tokio::select! {
                _ = self.closing.cancelled() => false,
                guard = self.source.lock() => self.pump(guard).await?,
            };
            if !alive {
                info!("Stopped listening");
                return Ok(());
            }
        }
    }

    /// Reads and handles one frame. Returns `false` once disconnected.
    async fn pump(&self, mut guard: MutexGuard<'_, Option<WsSource>>) -> Result<bool, RelayError> {
        let drained = self
            .drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(event) = drained {
            self.handle_inbound(event).await?;
            return Ok(true);
        }

        let seen = self.generation();
        let frame = match guard.as_mut() {
            Some(source) => source.next().await,
            None => None,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                match Event::decode(text.as_str()) {
                    Ok(event) => self.handle_inbound(event).await?,
                    Err(e) => warn!("Skipping frame from broker: {}", e),
                }
                return Ok(true);
            }
            Some(Ok(Message::Close(frame))) => info!("Broker closed the connection: {:?}", frame),
            Some(Ok(_)) => return Ok(true),
            Some(Err(e)) => warn!("Connection to broker failed: {}", e),
            None => debug!("No open connection to read from"),
        }

        *guard = None;
        drop(guard);
        if self.closing.is_cancelled() {
            return Ok(false);
        }
        self.retry
            .run("reconnect", move |_| self.reconnect(seen))
            .await?;
        Ok(true)
    }

    async fn handle_inbound(&self, event: Event) -> Result<(), RelayError> {
        match event {
            Event::NewSensorData(reading) => match self.callbacks.get(&reading.sensor_id) {
                Some(registration) => self.dispatcher.enqueue(registration, reading).await?,
                None => debug!("No callback for {}, dropping reading", reading.sensor_id),
            },
            Event::StatusReply {
                sensor_id,
                connected,
            } => self.resolve_status(&sensor_id, connected),
            other => debug!("Ignoring {:?} from broker", other.event_type()),
        }
        Ok(())
    }

    fn resolve_status(&self, sensor_id: &str, connected: bool) {
        let Some(mut waiters) = self.pending_status.get_mut(sensor_id) else {
            debug!("Unsolicited status reply for {}", sensor_id);
            return;
        };
        while let Some(tx) = waiters.pop_front() {
            if tx.send(connected).is_ok() {
                break;
            }
        }
        drop(waiters);
        self.pending_status
            .remove_if(sensor_id, |_, waiters| waiters.is_empty());
    }

    fn prune_status_waiters(&self, sensor_id: &str) {
        if let Some(mut waiters) = self.pending_status.get_mut(sensor_id) {
            waiters.retain(|tx| !tx.is_closed());
        }
        self.pending_status
            .remove_if(sensor_id, |_, waiters| waiters.is_empty());
    }

    /// Sends `client_disconnect` and closes the transport. The subscriber
    /// cannot be reconnected afterwards; `listen` returns.
    pub async fn disconnect(&self) -> Result<(), RelayError> {
        self.closing.cancel();
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.send(text_frame(&Event::ClientDisconnect)?).await {
                warn!("Could not send client_disconnect: {}", e);
            }
            if let Err(e) = sink.close().await {
                debug!("Closing transport: {}", e);
            }
        }
        self.pending_status.clear();
        info!("Subscriber disconnected from {}", self.config.url);
        Ok(())
    }
}

fn text_frame(event: &Event) -> Result<Message, RelayError> {
    Ok(Message::Text(event.encode()?.into()))
}

fn disconnected() -> RelayError {
    RelayError::new(ErrorCode::SendFailed, "Subscriber has been disconnected")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    use super::*;
    use crate::sensorrelay::config::RetryConfig;
    use crate::sensorrelay::types::Reading;

    fn offline() -> Subscriber {
        let mut config = SubscriberConfig::new("ws://127.0.0.1:1");
        config.retry = RetryConfig {
            max_attempts: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        };
        Subscriber::new(config)
    }

    #[tokio::test]
    async fn removing_unknown_callback_sends_nothing() {
        let subscriber = offline();
        let err = subscriber.remove_callback("CE7238J").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::UnknownSubscription));
    }

    #[tokio::test]
    async fn failed_subscribe_is_rolled_back() {
        let subscriber = offline();
        let err = subscriber.subscribe("CE7238J").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RetriesExhausted));
        assert!(subscriber.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn status_replies_go_to_the_oldest_live_waiter() {
        let subscriber = offline();
        let (gone_tx, gone_rx) = oneshot::channel();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        drop(gone_rx);
        subscriber
            .pending_status
            .entry("CE7238J".into())
            .or_default()
            .extend([gone_tx, first_tx, second_tx]);

        subscriber.resolve_status("CE7238J", true);
        assert!(first_rx.await.unwrap());
        assert!(second_rx.try_recv().is_err());

        subscriber.resolve_status("CE7238J", false);
        assert!(!second_rx.await.unwrap());
        assert!(subscriber.pending_status.is_empty());

        // nobody waiting
        subscriber.resolve_status("CE7238J", true);
    }

    #[tokio::test]
    async fn failed_status_query_leaves_no_waiter() {
        let subscriber = offline();
        let err = subscriber.sensor_connected("CE7238J").await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::RetriesExhausted));
        assert!(subscriber.pending_status.is_empty());
    }

    #[tokio::test]
    async fn reading_sent_ahead_of_a_close_still_reaches_the_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (closed_tx, closed_rx) = oneshot::channel();

        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
            let reading = Event::NewSensorData(Reading::new("CE7238J", json!(42)));
            first
                .send(Message::Text(reading.encode().unwrap().into()))
                .await
                .unwrap();
            first.close(None).await.unwrap();
            closed_tx.send(()).unwrap();

            let (stream, _) = listener.accept().await.unwrap();
            let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = second.next().await {}
        });

        let mut config = SubscriberConfig::new(url);
        config.retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
        };
        let subscriber = Subscriber::new(config);
        subscriber.connect().await.unwrap();
        closed_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Nobody is listening; the send itself has to notice the Close.
        let (tx, mut rx) = unbounded_channel();
        subscriber
            .register_callback(
                "CE7238J",
                move |_, readings, _| {
                    let _ = tx.send(readings.clone());
                },
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(subscriber.generation(), 2);

        let guard = subscriber.source.lock().await;
        assert!(subscriber.pump(guard).await.unwrap());
        let readings = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(readings, Some(json!(42)));

        subscriber.disconnect().await.unwrap();
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_subscriber_stays_closed() {
        let subscriber = offline();
        subscriber.disconnect().await.unwrap();
        assert!(subscriber.connect().await.is_err());
        assert!(subscriber.listen().await.is_ok());
    }
}
