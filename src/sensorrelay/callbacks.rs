use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, error};
use serde_json::Value;
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::error::{ErrorCode, RelayError};
use crate::sensorrelay::types::{Reading, SensorId};

/// Callback invoked with `(sensor_id, readings, extra_args)`
pub type SensorCallback = dyn Fn(&str, &Value, &[Value]) + Send + Sync;

/// Fixed extra arguments handed to a callback on every call
pub type CallbackArgs = SmallVec<[Value; 4]>;

pub struct CallbackRegistration {
    callback: Box<SensorCallback>,
    args: CallbackArgs,
}

impl CallbackRegistration {
    pub fn new<F>(callback: F, args: CallbackArgs) -> Self
    where
        F: Fn(&str, &Value, &[Value]) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
            args,
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn invoke(&self, reading: &Reading) {
        (self.callback)(&reading.sensor_id, &reading.value, &self.args);
    }
}

/// At most one registration per sensor
#[derive(Default)]
pub struct CallbackTable {
    inner: DashMap<SensorId, Arc<CallbackRegistration>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a registration. Returns `true` if it replaced an older one.
    pub fn insert(&self, sensor_id: &str, registration: CallbackRegistration) -> bool {
        self.inner
            .insert(sensor_id.to_string(), Arc::new(registration))
            .is_some()
    }

    pub fn remove(&self, sensor_id: &str) -> Option<Arc<CallbackRegistration>> {
        self.inner.remove(sensor_id).map(|(_, registration)| registration)
    }

    pub fn get(&self, sensor_id: &str) -> Option<Arc<CallbackRegistration>> {
        self.inner.get(sensor_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, sensor_id: &str) -> bool {
        self.inner.contains_key(sensor_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

struct Delivery {
    registration: Arc<CallbackRegistration>,
    reading: Reading,
}

/// Bounded work queue with a single worker running callbacks in order.
///
/// Enqueueing waits while the queue is full, so a slow callback throttles
/// the receive loop instead of growing memory.
pub struct Dispatcher {
    tx: mpsc::Sender<Delivery>,
}

impl Dispatcher {
    /// Starts the worker. Must be called inside a Tokio runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Delivery>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let sensor_id = delivery.reading.sensor_id.clone();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    delivery.registration.invoke(&delivery.reading)
                }));
                if outcome.is_err() {
                    error!("Callback for {} panicked", sensor_id);
                }
            }
            debug!("Callback worker finished");
        });
        Self { tx }
    }

    pub async fn enqueue(
        &self,
        registration: Arc<CallbackRegistration>,
        reading: Reading,
    ) -> Result<(), RelayError> {
        self.tx
            .send(Delivery {
                registration,
                reading,
            })
            .await
            .map_err(|_| RelayError::new(ErrorCode::InternalServerError, "Callback worker stopped"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use smallvec::smallvec;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    use super::*;

    #[test]
    fn second_registration_overwrites_first() {
        let table = CallbackTable::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let first = hits.clone();
        assert!(!table.insert(
            "CE7238J",
            CallbackRegistration::new(move |_, _, _| first.lock().unwrap().push("first"), smallvec![]),
        ));
        let second = hits.clone();
        assert!(table.insert(
            "CE7238J",
            CallbackRegistration::new(move |_, _, _| second.lock().unwrap().push("second"), smallvec![]),
        ));
        assert_eq!(table.len(), 1);

        table
            .get("CE7238J")
            .unwrap()
            .invoke(&Reading::new("CE7238J", json!(42)));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn extra_args_are_passed_through() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let registration = CallbackRegistration::new(
            move |id, readings, args| {
                *sink.lock().unwrap() = Some((id.to_string(), readings.clone(), args.to_vec()));
            },
            smallvec![json!("client1"), json!("sensor1")],
        );

        registration.invoke(&Reading::new("CE7238J", json!(42)));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((
                "CE7238J".to_string(),
                json!(42),
                vec![json!("client1"), json!("sensor1")]
            ))
        );
    }

    #[tokio::test]
    async fn worker_runs_callbacks_in_order_and_survives_panics() {
        let dispatcher = Dispatcher::spawn(2);
        let (tx, mut rx) = unbounded_channel();

        let boom = Arc::new(CallbackRegistration::new(|_, _, _| panic!("boom"), smallvec![]));
        let record = Arc::new(CallbackRegistration::new(
            move |_, readings, _| tx.send(readings.clone()).unwrap(),
            smallvec![],
        ));

        dispatcher.enqueue(record.clone(), Reading::new("s", json!(1))).await.unwrap();
        dispatcher.enqueue(boom, Reading::new("s", json!(2))).await.unwrap();
        dispatcher.enqueue(record, Reading::new("s", json!(3))).await.unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(json!(1)));
        assert_eq!(second, Some(json!(3)));
    }
}
