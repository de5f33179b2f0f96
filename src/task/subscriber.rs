//! TaskSubscriber: consumes the shared task queue, offers each task to its
//! receivers in registration order and answers on the task's reply queue.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use task_protocol::{Codec, ExceptionDescription, HostInfo, TaskBody, TaskResponse, codec};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Delivery, OutgoingMessage, PublishOptions, QueueOptions};
use crate::config::{TaskQueueConfig, UnhandledPolicy};
use crate::promise::{Promise, TaskError};

/// How an accepted task turned out.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Value(Value),
    /// The result arrives later; the delivery stays unacknowledged until then.
    Pending(Promise),
    Failed(TaskError),
}

#[derive(Debug, Clone)]
pub enum Received {
    Accepted(TaskOutcome),
    /// Not for this receiver; offer the task to the next one.
    Declined,
}

impl Received {
    pub fn value(value: Value) -> Self {
        Received::Accepted(TaskOutcome::Value(value))
    }

    pub fn pending(promise: Promise) -> Self {
        Received::Accepted(TaskOutcome::Pending(promise))
    }

    pub fn failed(error: TaskError) -> Self {
        Received::Accepted(TaskOutcome::Failed(error))
    }
}

#[async_trait]
pub trait TaskReceiver: Send + Sync {
    async fn on_task_received(&self, task: &TaskBody) -> Received;

    fn name(&self) -> &str {
        "task-receiver"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

type Receivers = Vec<(ReceiverId, Arc<dyn TaskReceiver>)>;

pub struct TaskSubscriber {
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    config: TaskQueueConfig,
    receivers: Mutex<Receivers>,
    next_id: AtomicU64,
    consumer_tag: Mutex<Option<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSubscriber")
            .field("task_queue", &self.config.task_queue)
            .field("receivers", &self.receivers().len())
            .field("consuming", &lock(&self.consumer_tag).is_some())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskSubscriber {
    pub fn new(broker: Arc<dyn Broker>, codec: Arc<dyn Codec>, config: &TaskQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            codec,
            config: config.clone(),
            receivers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            consumer_tag: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    pub fn add_task_receiver(&self, receiver: Arc<dyn TaskReceiver>) -> ReceiverId {
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        debug!(receiver = receiver.name(), "task receiver added");
        lock(&self.receivers).push((id, receiver));
        id
    }

    pub fn remove_task_receiver(&self, id: ReceiverId) -> bool {
        let mut receivers = lock(&self.receivers);
        let before = receivers.len();
        receivers.retain(|(rid, _)| *rid != id);
        before != receivers.len()
    }

    fn receivers(&self) -> Receivers {
        lock(&self.receivers).clone()
    }

    /// Start consuming. At most `prefetch` tasks are in progress at once.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        if lock(&self.consumer_tag).is_some() {
            return Ok(());
        }
        self.broker
            .declare_queue(&self.config.task_queue, QueueOptions::task_queue(self.config.testing_mode))
            .await?;
        let mut consumer = self
            .broker
            .consume(&self.config.task_queue, self.config.prefetch)
            .await?;
        *lock(&self.consumer_tag) = Some(consumer.tag().to_string());

        let me = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                me.on_delivery(delivery).await;
                tokio::task::yield_now().await;
            }
            debug!("task consumer finished");
        });
        *lock(&self.pump) = Some(handle);
        info!(
            task_queue = %self.config.task_queue,
            prefetch = self.config.prefetch,
            "task subscriber started"
        );
        Ok(())
    }

    /// Stop consuming. Tasks not yet acknowledged go back to the queue.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let tag = lock(&self.consumer_tag).take();
        if let Some(tag) = tag {
            self.broker.cancel(&tag).await?;
        }
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        info!(task_queue = %self.config.task_queue, "task subscriber stopped");
        Ok(())
    }

    async fn on_delivery(self: &Arc<Self>, delivery: Delivery) {
        let task = match codec::decode_as::<Value>(self.codec.as_ref(), &delivery.message.body)
            .map_err(|e| e.to_string())
            .and_then(|v| TaskBody::from_value(v).map_err(|e| e.to_string()))
        {
            Ok(task) => task,
            Err(reason) => {
                warn!(delivery_tag = delivery.delivery_tag, "malformed task: {reason}");
                let response = TaskResponse::exception(
                    ExceptionDescription::new("MalformedTask", reason),
                    self.host(),
                );
                self.finish(delivery, response).await;
                return;
            }
        };

        for (_, receiver) in self.receivers() {
            match self.offer(receiver, &task).await {
                Received::Declined => continue,
                Received::Accepted(outcome) => {
                    debug!(kind = task.kind(), "task accepted");
                    self.on_accepted(delivery, outcome).await;
                    return;
                }
            }
        }
        self.on_unhandled(delivery, &task).await;
    }

    /// Run one receiver in its own task so a panicking receiver becomes a
    /// failed outcome instead of taking the consumer down.
    async fn offer(&self, receiver: Arc<dyn TaskReceiver>, task: &TaskBody) -> Received {
        let name = receiver.name().to_string();
        let task = task.clone();
        match tokio::spawn(async move { receiver.on_task_received(&task).await }).await {
            Ok(received) => received,
            Err(err) => {
                error!(receiver = %name, "task receiver crashed: {err}");
                Received::failed(TaskError::failed("ReceiverPanicked", err.to_string()))
            }
        }
    }

    async fn on_accepted(self: &Arc<Self>, delivery: Delivery, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Value(value) => {
                let response = TaskResponse::result(value, self.host());
                self.finish(delivery, response).await;
            }
            TaskOutcome::Failed(error) => {
                let response = TaskResponse::exception(ExceptionDescription::from(&error), self.host());
                self.finish(delivery, response).await;
            }
            TaskOutcome::Pending(promise) => {
                let me = self.clone();
                tokio::spawn(async move {
                    let response = match promise.wait().await {
                        Ok(value) => TaskResponse::result(value, me.host()),
                        Err(error) => TaskResponse::exception(ExceptionDescription::from(&error), me.host()),
                    };
                    me.finish(delivery, response).await;
                });
            }
        }
    }

    async fn on_unhandled(&self, delivery: Delivery, task: &TaskBody) {
        let requeue = self.config.unhandled == UnhandledPolicy::Requeue;
        warn!(
            kind = task.kind(),
            redelivered = delivery.redelivered,
            policy = %self.config.unhandled,
            "no receiver accepted the task"
        );
        if let Err(err) = self.broker.reject(delivery.delivery_tag, requeue).await {
            error!("could not reject task {}: {err}", delivery.delivery_tag);
        }
    }

    /// Reply first, then acknowledge, so a crash in between redelivers the
    /// task rather than losing its response. A reply the broker refuses puts
    /// the task back on the queue.
    async fn finish(&self, delivery: Delivery, response: TaskResponse) {
        match (&delivery.message.reply_to, &delivery.message.correlation_id) {
            (Some(reply_to), correlation_id) => match codec::encode_as(self.codec.as_ref(), &response) {
                Ok(bytes) => {
                    let mut outgoing = OutgoingMessage::new(bytes);
                    outgoing.correlation_id = correlation_id.clone();
                    let options = PublishOptions {
                        mandatory: false,
                        confirm: self.config.confirm_deliveries,
                    };
                    if let Err(err) = self.broker.publish(reply_to, outgoing, options).await {
                        error!(reply_to = %reply_to, "could not send response, requeueing the task: {err}");
                        if let Err(err) = self.broker.reject(delivery.delivery_tag, true).await {
                            error!("could not requeue task {}: {err}", delivery.delivery_tag);
                        }
                        return;
                    }
                }
                Err(err) => error!("could not encode response: {err}"),
            },
            (None, _) => debug!(delivery_tag = delivery.delivery_tag, "task has no reply destination"),
        }
        if let Err(err) = self.broker.ack(delivery.delivery_tag).await {
            error!("could not ack task {}: {err}", delivery.delivery_tag);
        }
    }

    fn host(&self) -> HostInfo {
        HostInfo::current(self.config.worker_id.clone())
    }
}
