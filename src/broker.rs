//! Message-broker seam used by the task publisher and subscriber.
//!
//! The contract mirrors what an AMQP broker offers: named queues, publishes
//! carrying a correlation id and a reply destination, consumers with a
//! prefetch window, and explicit ack/reject of deliveries.
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    /// The shared task queue: durable, except in testing mode where it is
    /// dropped once its consumers go away.
    pub fn task_queue(testing_mode: bool) -> Self {
        Self {
            durable: !testing_mode,
            auto_delete: testing_mode,
            exclusive: false,
        }
    }

    /// A private reply queue owned by one publisher.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
}

impl OutgoingMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            correlation_id: None,
            reply_to: None,
            persistent: false,
        }
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Fail the publish if no queue can take the message.
    pub mandatory: bool,
    /// Only return once the broker has confirmed the message.
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub queue: String,
    pub message: OutgoingMessage,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection is closed")]
    Closed,
    #[error("message to `{0}` could not be routed")]
    Unroutable(String),
    #[error("broker refused to confirm a message to `{0}`")]
    Nacked(String),
    #[error("queue `{0}` does not exist")]
    UnknownQueue(String),
    #[error("queue `{0}` is exclusive to another connection")]
    ExclusiveQueue(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),
}

/// Stream of deliveries for one consumer.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    deliveries: mpsc::Receiver<Delivery>,
}

impl Consumer {
    pub fn new(tag: impl Into<String>, deliveries: mpsc::Receiver<Delivery>) -> Self {
        Self {
            tag: tag.into(),
            deliveries,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Next delivery, or `None` once the consumer is cancelled.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue, returning its name. Declaring an existing queue is a
    /// no-op; an empty name asks the broker to generate one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError>;

    async fn publish(
        &self,
        queue: &str,
        message: OutgoingMessage,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Start consuming. At most `prefetch` deliveries are unacknowledged at once.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery, putting it back at the head of its queue if `requeue`.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Stop a consumer. Its unacknowledged deliveries are requeued.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    fn name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Broker({})", self.name())
    }
}
