//! TaskPublisher: sends tasks to the shared task queue and settles each task's
//! promise when the matching response arrives on a private reply queue.
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use task_protocol::{Codec, CodecError, PayloadError, TaskBody, TaskResponse, codec};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::TaskMessage;
use crate::broker::{Broker, BrokerError, Delivery, OutgoingMessage, PublishOptions, QueueOptions};
use crate::config::TaskQueueConfig;
use crate::promise::{Promise, TaskError};

/// Deliveries the reply consumer may hold at once.
const REPLY_PREFETCH: usize = 64;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("a task with correlation id `{0}` is already awaiting its response")]
    DuplicateCorrelationId(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Correlation ids of tasks still awaiting a response. Every publisher built
/// on the same registry refuses an id another one has in flight.
#[derive(Debug, Clone, Default)]
pub struct CorrelationRegistry {
    in_flight: Arc<DashMap<String, String>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for the publisher answering on `owner`.
    fn reserve(&self, id: &str, owner: &str) -> bool {
        match self.in_flight.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(owner.to_string());
                true
            }
        }
    }

    fn release(&self, id: &str, owner: &str) {
        self.in_flight.remove_if(id, |_, held_by| held_by == owner);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

pub struct TaskPublisher {
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    task_queue: String,
    reply_queue: String,
    reply_consumer: String,
    confirm_deliveries: bool,
    registry: CorrelationRegistry,
    pending: Arc<DashMap<String, Promise>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPublisher")
            .field("task_queue", &self.task_queue)
            .field("reply_queue", &self.reply_queue)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl TaskPublisher {
    /// Declare the task queue and a private reply queue, and start listening
    /// for responses. Correlation ids are reserved in `registry`.
    pub async fn new(
        broker: Arc<dyn Broker>,
        codec: Arc<dyn Codec>,
        config: &TaskQueueConfig,
        registry: CorrelationRegistry,
    ) -> Result<Arc<Self>, BrokerError> {
        broker
            .declare_queue(&config.task_queue, QueueOptions::task_queue(config.testing_mode))
            .await?;
        let reply_queue = broker
            .declare_queue(
                &format!("{}-{}", config.reply_prefix, Uuid::new_v4()),
                QueueOptions::reply_queue(),
            )
            .await?;
        let mut consumer = broker.consume(&reply_queue, REPLY_PREFETCH).await?;

        let pending: Arc<DashMap<String, Promise>> = Arc::new(DashMap::new());
        let me = Arc::new(Self {
            broker: broker.clone(),
            codec: codec.clone(),
            task_queue: config.task_queue.clone(),
            reply_queue: reply_queue.clone(),
            reply_consumer: consumer.tag().to_string(),
            confirm_deliveries: config.confirm_deliveries,
            registry: registry.clone(),
            pending: pending.clone(),
            pump: Mutex::new(None),
        });

        let owner = reply_queue.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                let tag = delivery.delivery_tag;
                on_response(&pending, &registry, &owner, codec.as_ref(), delivery);
                if let Err(err) = broker.ack(tag).await {
                    warn!("could not ack response {tag}: {err}");
                }
            }
            debug!("reply consumer finished");
        });
        *me.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(task_queue = %me.task_queue, reply_queue = %me.reply_queue, "task publisher ready");
        Ok(me)
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Tasks sent whose responses have not arrived yet.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    fn forget(&self, correlation_id: &str) -> Option<Promise> {
        self.registry.release(correlation_id, &self.reply_queue);
        self.pending.remove(correlation_id).map(|(_, promise)| promise)
    }

    /// Send a task. The returned promise settles with the remote result, the
    /// remote exception, or a delivery failure.
    ///
    /// Reusing the correlation id of a task still awaiting its response, here
    /// or on any publisher sharing the registry, is refused before anything
    /// is transmitted.
    pub async fn send(&self, message: TaskMessage) -> Result<Promise, PublishError> {
        let TaskMessage {
            correlation_id,
            body,
            future,
        } = message;
        body.validate()?;

        if !self.registry.reserve(&correlation_id, &self.reply_queue) {
            return Err(PublishError::DuplicateCorrelationId(correlation_id));
        }
        self.pending.insert(correlation_id.clone(), future.clone());

        let bytes = match codec::encode_as(self.codec.as_ref(), &body) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.forget(&correlation_id);
                return Err(err.into());
            }
        };

        let outgoing = OutgoingMessage::new(bytes)
            .correlation_id(correlation_id.clone())
            .reply_to(self.reply_queue.clone())
            .persistent(true);
        let options = PublishOptions {
            mandatory: true,
            confirm: self.confirm_deliveries,
        };
        match self.broker.publish(&self.task_queue, outgoing, options).await {
            Ok(()) => debug!(correlation_id = %correlation_id, kind = body.kind(), "task sent"),
            Err(err) => {
                warn!(correlation_id = %correlation_id, "task delivery failed: {err}");
                self.forget(&correlation_id);
                let _ = future.set_exception(TaskError::DeliveryFailed(err.to_string()));
            }
        }
        Ok(future)
    }

    /// Send a bare task body under a fresh correlation id.
    pub async fn task_send(&self, body: TaskBody) -> Result<Promise, PublishError> {
        self.send(TaskMessage::new(body)).await
    }

    /// Stop listening for responses. Tasks still awaiting one are cancelled.
    pub async fn close(&self) {
        if let Err(err) = self.broker.cancel(&self.reply_consumer).await {
            debug!("reply consumer already gone: {err}");
        }
        let handle = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(promise) = self.forget(&id) {
                promise.cancel();
            }
        }
        info!(reply_queue = %self.reply_queue, "task publisher closed");
    }
}

fn on_response(
    pending: &DashMap<String, Promise>,
    registry: &CorrelationRegistry,
    owner: &str,
    codec: &dyn Codec,
    delivery: Delivery,
) {
    let Some(correlation_id) = delivery.message.correlation_id else {
        warn!("discarding response without a correlation id");
        return;
    };
    let Some((_, promise)) = pending.remove(&correlation_id) else {
        debug!(correlation_id = %correlation_id, "discarding response for an unknown correlation id");
        return;
    };
    // Free the id before anyone awaiting the promise can reuse it.
    registry.release(&correlation_id, owner);

    let outcome = match codec::decode_as::<TaskResponse>(codec, &delivery.message.body) {
        Ok(response) => {
            debug!(
                correlation_id = %correlation_id,
                outcome = %response.outcome,
                responder = %response.responder_host.hostname,
                "response received"
            );
            response.into_result().map_err(TaskError::from)
        }
        Err(err) => Err(TaskError::failed("DecodeError", err.to_string())),
    };
    let settled = match outcome {
        Ok(value) => promise.set_result(value),
        Err(error) => promise.set_exception(error),
    };
    if let Err(err) = settled {
        debug!(correlation_id = %correlation_id, "response arrived for a settled task: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use task_protocol::{HostInfo, JsonCodec};
    use tokio::time::{Duration, timeout};

    async fn publisher(broker: Arc<MemoryBroker>) -> Arc<TaskPublisher> {
        shared_publisher(broker, CorrelationRegistry::new()).await
    }

    async fn shared_publisher(broker: Arc<MemoryBroker>, registry: CorrelationRegistry) -> Arc<TaskPublisher> {
        TaskPublisher::new(broker, Arc::new(JsonCodec), &TaskQueueConfig::testing(), registry)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_refused() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker.clone()).await;
        let body = TaskBody::launch("echo", vec![], json!({}), true).unwrap();

        publisher
            .send(TaskMessage::with_correlation_id(body.clone(), "same"))
            .await
            .unwrap();
        let err = publisher
            .send(TaskMessage::with_correlation_id(body, "same"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::DuplicateCorrelationId(id) if id == "same"));
        assert_eq!(broker.ready_count(publisher.task_queue()), 1);
        assert_eq!(publisher.pending_count(), 1);
    }

    #[tokio::test]
    async fn correlation_id_in_flight_on_another_publisher_is_refused() {
        let broker = Arc::new(MemoryBroker::new());
        let registry = CorrelationRegistry::new();
        let first = shared_publisher(broker.clone(), registry.clone()).await;
        let second = shared_publisher(broker.clone(), registry.clone()).await;
        let body = TaskBody::launch("echo", vec![], json!({}), true).unwrap();

        first
            .send(TaskMessage::with_correlation_id(body.clone(), "same"))
            .await
            .unwrap();
        let err = second
            .send(TaskMessage::with_correlation_id(body.clone(), "same"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::DuplicateCorrelationId(id) if id == "same"));
        assert_eq!(broker.ready_count(first.task_queue()), 1);
        assert_eq!(second.pending_count(), 0);

        // Closing the owner frees the id for everyone.
        first.close().await;
        assert!(!registry.contains("same"));
        second
            .send(TaskMessage::with_correlation_id(body, "same"))
            .await
            .unwrap();
        assert_eq!(broker.ready_count(second.task_queue()), 2);
    }

    #[tokio::test]
    async fn delivery_failure_fails_the_promise() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker.clone()).await;
        broker.close();

        let promise = publisher
            .task_send(TaskBody::continue_process("p", None, true).unwrap())
            .await
            .unwrap();
        assert!(matches!(promise.result(), Some(Err(TaskError::DeliveryFailed(_)))));
        assert_eq!(publisher.pending_count(), 0);
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn refused_task_fails_only_when_deliveries_are_confirmed() {
        let broker = Arc::new(MemoryBroker::new());
        let body = TaskBody::launch("dummy", vec![], json!({}), true).unwrap();

        let confirming = publisher(broker.clone()).await;
        broker.refuse_publishes(confirming.task_queue(), true);
        let promise = confirming.task_send(body.clone()).await.unwrap();
        assert!(matches!(promise.result(), Some(Err(TaskError::DeliveryFailed(_)))));
        assert!(confirming.registry().is_empty());

        let config = TaskQueueConfig {
            confirm_deliveries: false,
            ..TaskQueueConfig::testing()
        };
        let unconfirmed = TaskPublisher::new(broker.clone(), Arc::new(JsonCodec), &config, CorrelationRegistry::new())
            .await
            .unwrap();
        broker.refuse_publishes(unconfirmed.task_queue(), true);
        let promise = unconfirmed.task_send(body).await.unwrap();
        assert!(!promise.is_done());
        assert_eq!(unconfirmed.pending_count(), 1);
        assert_eq!(broker.ready_count(unconfirmed.task_queue()), 0);
    }

    #[tokio::test]
    async fn responses_settle_by_correlation_id() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker.clone()).await;
        let promise = publisher
            .send(TaskMessage::with_correlation_id(
                TaskBody::launch("echo", vec![], json!({}), true).unwrap(),
                "c-1",
            ))
            .await
            .unwrap();

        // Answer by hand on the reply queue, with an unrelated response first.
        for (id, value) in [("stranger", json!(0)), ("c-1", json!({"x": 1}))] {
            let response = TaskResponse::result(value, HostInfo::current(None));
            let bytes = codec::encode_as(&JsonCodec, &response).unwrap();
            broker
                .publish(
                    publisher.reply_queue(),
                    OutgoingMessage::new(bytes).correlation_id(id),
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }

        let value = timeout(Duration::from_secs(1), promise.wait())
            .await
            .expect("timeout")
            .expect("value");
        assert_eq!(value, json!({"x": 1}));
        assert_eq!(publisher.pending_count(), 0);
        assert!(!publisher.registry().contains("c-1"));
    }

    #[tokio::test]
    async fn close_cancels_pending_tasks() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker.clone()).await;
        let promise = publisher
            .task_send(TaskBody::launch("dummy", vec![], json!(null), true).unwrap())
            .await
            .unwrap();
        publisher.close().await;
        assert!(promise.is_cancelled());
        assert!(!broker.queue_exists(publisher.reply_queue()));
    }
}
