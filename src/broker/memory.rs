use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Broker, BrokerError, Consumer, Delivery, OutgoingMessage, PublishOptions, QueueOptions};

struct ConsumerSlot {
    tag: String,
    prefetch: usize,
    in_flight: usize,
    tx: mpsc::Sender<Delivery>,
}

struct Queued {
    message: OutgoingMessage,
    redelivered: bool,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Queued>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer: String,
    message: OutgoingMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    closed: bool,
    /// Queues whose publishes the broker refuses to take.
    refusing: HashSet<String>,
}

impl BrokerState {
    /// Hand ready messages to consumers with free prefetch slots, round robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let next_tag = self.next_tag + 1;
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.ready.is_empty() || q.consumers.is_empty() {
                return;
            }
            let count = q.consumers.len();
            let Some(slot_idx) = (0..count)
                .map(|i| (q.next_consumer + i) % count)
                .find(|&i| q.consumers[i].in_flight < q.consumers[i].prefetch)
            else {
                return;
            };
            q.next_consumer = (slot_idx + 1) % count;
            let Some(queued) = q.ready.pop_front() else {
                return;
            };
            let slot = &mut q.consumers[slot_idx];
            let delivery = Delivery {
                delivery_tag: next_tag,
                redelivered: queued.redelivered,
                queue: queue.to_string(),
                message: queued.message.clone(),
            };
            match slot.tx.try_send(delivery) {
                Ok(()) => {
                    slot.in_flight += 1;
                    let consumer = slot.tag.clone();
                    self.next_tag = next_tag;
                    self.unacked.insert(
                        next_tag,
                        Unacked {
                            queue: queue.to_string(),
                            consumer,
                            message: queued.message,
                        },
                    );
                }
                Err(err) => {
                    // The consumer is gone or its window is full: put the
                    // message back and drop a dead consumer.
                    q.ready.push_front(queued);
                    if matches!(err, mpsc::error::TrySendError::Closed(_)) {
                        let tag = slot.tag.clone();
                        debug!(consumer = %tag, queue, "dropping closed consumer");
                        self.remove_consumer(queue, &tag);
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Detach a consumer and requeue everything it had not acknowledged, in
    /// original order, at the head of the queue.
    fn remove_consumer(&mut self, queue: &str, consumer: &str) -> bool {
        let Some(q) = self.queues.get_mut(queue) else {
            return false;
        };
        let before = q.consumers.len();
        q.consumers.retain(|c| c.tag != consumer);
        if before == q.consumers.len() {
            return false;
        }
        q.next_consumer = 0;

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        let mut returned = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                returned.push(u.message);
            }
        }
        if let Some(q) = self.queues.get_mut(queue) {
            for message in returned.into_iter().rev() {
                q.ready.push_front(Queued {
                    message,
                    redelivered: true,
                });
            }
            if q.options.auto_delete && q.consumers.is_empty() {
                debug!(queue, "auto-deleting queue after its last consumer left");
                self.queues.remove(queue);
            }
        }
        true
    }

    fn release(&mut self, delivery_tag: u64) -> Result<Unacked, BrokerError> {
        let unacked = self
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if let Some(q) = self.queues.get_mut(&unacked.queue) {
            if let Some(slot) = q.consumers.iter_mut().find(|c| c.tag == unacked.consumer) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        Ok(unacked)
    }
}

/// In-process broker with AMQP-like queue semantics. Useful for tests and
/// single-process deployments where producers and workers share a runtime.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse any further publishes.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Make the broker refuse messages published to `queue`, as a real broker
    /// does under a resource alarm. Confirmed publishes see the refusal;
    /// unconfirmed ones are lost silently.
    pub fn refuse_publishes(&self, queue: &str, refuse: bool) {
        let mut state = self.lock();
        if refuse {
            state.refusing.insert(queue.to_string());
        } else {
            state.refusing.remove(queue);
        }
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages waiting to be delivered on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Deliveries not yet acknowledged, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("unacked", &state.unacked.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        state.queues.entry(name.clone()).or_insert_with(|| {
            debug!(queue = %name, ?options, "declared queue");
            QueueState {
                options,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            }
        });
        Ok(name)
    }

    async fn publish(
        &self,
        queue: &str,
        message: OutgoingMessage,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.refusing.contains(queue) {
            if options.confirm {
                return Err(BrokerError::Nacked(queue.to_string()));
            }
            warn!(queue, "broker dropped an unconfirmed message");
            return Ok(());
        }
        let Some(q) = state.queues.get_mut(queue) else {
            if options.mandatory {
                return Err(BrokerError::Unroutable(queue.to_string()));
            }
            warn!(queue, "dropping message for a queue that does not exist");
            return Ok(());
        };
        trace!(queue, correlation_id = ?message.correlation_id, "published");
        q.ready.push_back(Queued {
            message,
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Consumer, BrokerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        if q.options.exclusive && !q.consumers.is_empty() {
            return Err(BrokerError::ExclusiveQueue(queue.to_string()));
        }
        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let tag = format!("ctag-{}", Uuid::new_v4());
        q.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            prefetch,
            in_flight: 0,
            tx,
        });
        debug!(queue, consumer = %tag, prefetch, "consumer attached");
        state.dispatch(queue);
        Ok(Consumer::new(tag, rx))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let unacked = state.release(delivery_tag)?;
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let unacked = state.release(delivery_tag)?;
        if requeue {
            if let Some(q) = state.queues.get_mut(&unacked.queue) {
                q.ready.push_front(Queued {
                    message: unacked.message,
                    redelivered: true,
                });
            }
        } else {
            debug!(queue = %unacked.queue, delivery_tag, "discarded rejected delivery");
        }
        state.dispatch(&unacked.queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let queue = state
            .queues
            .iter()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer_tag.to_string()))?;
        state.remove_consumer(&queue, consumer_tag);
        state.dispatch(&queue);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
