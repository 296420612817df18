use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use events::EventEnvelope;
use tokio::sync::Notify;

use crate::message::{DEATH_REASON_HEADER, DELIVERY_COUNT_HEADER, Delivery, DeliveryTag, Message};
use crate::topic::{is_valid_pattern, topic_matches};
use crate::{DEAD_LETTER_SUFFIX, Result, TransportError, dead_letter_queue};

/// Name of the exchange all saga events are published to.
pub const DEFAULT_EXCHANGE: &str = "microservice.events";

/// Declaration of a consumer queue and its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Topic patterns bound to the exchange.
    pub routing_keys: Vec<String>,
    /// Maximum unacknowledged deliveries per subscription.
    pub prefetch: usize,
    /// Deliveries after which a requeued message is dead-lettered instead.
    pub max_deliveries: u32,
}

impl QueueSpec {
    pub const DEFAULT_PREFETCH: usize = 10;
    pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_keys: Vec::new(),
            prefetch: Self::DEFAULT_PREFETCH,
            max_deliveries: Self::DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Adds a binding pattern.
    pub fn bind(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_keys.push(routing_key.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }
}

/// Publish side and queue declaration of a topic exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the exchange this transport publishes to.
    fn exchange(&self) -> &str;

    /// Stores a message in every queue whose binding matches its routing key.
    /// Returns once all copies are stored.
    async fn publish_message(&self, message: Message) -> Result<()>;

    /// Declares a queue (and its dead-letter queue) and subscribes to it.
    /// Declaring an existing queue adds any new bindings and attaches another
    /// competing subscriber.
    async fn declare_queue(&self, spec: QueueSpec) -> Result<Box<dyn Subscription>>;

    /// Closes the transport. Publishing fails and subscriptions stop receiving.
    fn close(&self);

    /// Publishes an envelope routed by its event type.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        self.publish_message(Message::from_envelope(envelope)?).await
    }

    /// Publishes an envelope under an explicit routing key.
    async fn publish_with_key(&self, routing_key: &str, envelope: &EventEnvelope) -> Result<()> {
        self.publish_message(Message::with_routing_key(routing_key, envelope)?)
            .await
    }
}

/// Consumer side of a declared queue.
///
/// Dropping a subscription returns its unacknowledged deliveries to the queue.
/// A delivery that is never settled, for example because its process died,
/// is delivered again once the transport notices.
#[async_trait]
pub trait Subscription: Send {
    fn queue(&self) -> &str;

    /// Waits for the next delivery. Blocks while `prefetch` deliveries are
    /// outstanding. Returns `None` once the transport is closed.
    async fn recv(&mut self) -> Option<Delivery>;

    /// Acknowledges a delivery. Unknown or stale tags are ignored.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledges a delivery. With `requeue` the message goes
    /// back to the head of the queue unless it has reached the delivery
    /// limit; otherwise, or once the limit is reached, it is dead-lettered.
    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;
}

struct Unacked {
    subscriber: u64,
    message: Message,
}

struct Queue {
    bindings: Vec<String>,
    max_deliveries: u32,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Unacked>,
}

impl Queue {
    fn new(max_deliveries: u32) -> Self {
        Self {
            bindings: Vec::new(),
            max_deliveries,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
        }
    }

    fn outstanding(&self, subscriber: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.subscriber == subscriber)
            .count()
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    next_tag: u64,
    next_subscriber: u64,
    closed: bool,
}

impl State {
    fn deliver(&mut self, queue_name: &str, subscriber: u64, prefetch: usize) -> Option<Delivery> {
        let queue = self.queues.get_mut(queue_name)?;
        if queue.outstanding(subscriber) >= prefetch {
            return None;
        }
        let mut message = queue.ready.pop_front()?;

        let count = message.delivery_count() + 1;
        message
            .headers
            .insert(DELIVERY_COUNT_HEADER.to_string(), count.to_string());

        self.next_tag += 1;
        let tag = self.next_tag;
        queue.unacked.insert(
            tag,
            Unacked {
                subscriber,
                message: message.clone(),
            },
        );

        Some(Delivery {
            tag: DeliveryTag(tag),
            queue: queue_name.to_string(),
            redelivered: count > 1,
            message,
        })
    }

    /// Requeues or dead-letters a message that left the unacked set without an ack.
    fn settle(&mut self, queue_name: &str, message: Message, requeue: bool) {
        let Some(max_deliveries) = self.queues.get(queue_name).map(|q| q.max_deliveries) else {
            return;
        };
        if !requeue {
            self.dead_letter(queue_name, message, "rejected");
        } else if message.delivery_count() >= max_deliveries {
            self.dead_letter(queue_name, message, "delivery limit reached");
        } else if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.ready.push_front(message);
        }
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: Message, reason: &str) {
        let target = dead_letter_queue(queue_name);
        let Some(dlq) = self.queues.get_mut(&target) else {
            tracing::warn!(
                queue = %queue_name,
                message_id = %message.message_id,
                reason,
                "No dead-letter queue, dropping message"
            );
            return;
        };

        tracing::warn!(
            queue = %queue_name,
            message_id = %message.message_id,
            routing_key = %message.routing_key,
            reason,
            "Message dead-lettered"
        );
        metrics::counter!("transport_dead_lettered_total", "queue" => queue_name.to_string())
            .increment(1);

        message.headers.remove(DELIVERY_COUNT_HEADER);
        message
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), reason.to_string());
        dlq.ready.push_back(message);
    }

    /// Returns every unacked delivery matching `filter` to its queue,
    /// preserving delivery order at the head.
    fn requeue_unacked(&mut self, filter: impl Fn(&str, &Unacked) -> bool) -> usize {
        let mut returned = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| filter(name.as_str(), u))
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    returned.push((name.clone(), unacked.message));
                }
            }
        }

        let count = returned.len();
        for (name, message) in returned {
            self.settle(&name, message, true);
        }
        count
    }
}

struct Inner {
    exchange: String,
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process topic exchange. Queues live only as long as the process;
/// [`PostgresBroker`](crate::PostgresBroker) keeps them across restarts.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange: exchange.into(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Simulates a dropped connection: every unacknowledged delivery on
    /// every queue is returned to its queue and will be redelivered.
    /// Returns the number of deliveries returned.
    pub fn reset_connections(&self) -> usize {
        let count = self.inner.lock().requeue_unacked(|_, _| true);
        tracing::warn!(requeued = count, "Broker connections reset");
        self.inner.notify.notify_waiters();
        count
    }

    /// Number of messages ready for delivery on a queue.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Number of delivered but unacknowledged messages on a queue.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.inner.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    /// Copies of the messages ready on a queue, head first.
    pub fn peek(&self, queue: &str) -> Vec<Message> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copies of the messages in a queue's dead-letter queue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Message> {
        self.peek(&dead_letter_queue(queue))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_EXCHANGE)
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    async fn publish_message(&self, message: Message) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }

            let mut routed = 0usize;
            for (name, queue) in state.queues.iter_mut() {
                if queue
                    .bindings
                    .iter()
                    .any(|pattern| topic_matches(pattern, &message.routing_key))
                {
                    tracing::trace!(queue = %name, routing_key = %message.routing_key, "Routed");
                    queue.ready.push_back(message.clone());
                    routed += 1;
                }
            }

            if routed == 0 {
                tracing::debug!(
                    exchange = %self.inner.exchange,
                    routing_key = %message.routing_key,
                    message_id = %message.message_id,
                    "Unroutable message dropped"
                );
            }
            metrics::counter!("transport_published_total", "routing_key" => message.routing_key.clone())
                .increment(1);
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<Box<dyn Subscription>> {
        if spec.name.is_empty() {
            return Err(TransportError::UnknownQueue(spec.name));
        }
        if let Some(bad) = spec.routing_keys.iter().find(|p| !is_valid_pattern(p)) {
            return Err(TransportError::InvalidPattern(bad.clone()));
        }

        let subscriber = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }

            let queue = state
                .queues
                .entry(spec.name.clone())
                .or_insert_with(|| Queue::new(spec.max_deliveries.max(1)));
            for key in &spec.routing_keys {
                if !queue.bindings.contains(key) {
                    queue.bindings.push(key.clone());
                }
            }

            if !spec.name.ends_with(DEAD_LETTER_SUFFIX) {
                state
                    .queues
                    .entry(dead_letter_queue(&spec.name))
                    .or_insert_with(|| Queue::new(spec.max_deliveries.max(1)));
            }

            state.next_subscriber += 1;
            state.next_subscriber
        };

        tracing::info!(
            exchange = %self.inner.exchange,
            queue = %spec.name,
            bindings = ?spec.routing_keys,
            prefetch = spec.prefetch,
            "Queue declared"
        );

        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            queue: spec.name,
            id: subscriber,
            prefetch: spec.prefetch.max(1),
        }))
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_waiters();
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    queue: String,
    id: u64,
    prefetch: usize,
}

impl InMemorySubscription {
    fn take_unacked(&self, tag: DeliveryTag) -> Option<Message> {
        let mut state = self.inner.lock();
        let queue = state.queues.get_mut(&self.queue)?;
        let owned = queue
            .unacked
            .get(&tag.0)
            .is_some_and(|u| u.subscriber == self.id);
        if !owned {
            return None;
        }
        queue.unacked.remove(&tag.0).map(|u| u.message)
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if state.closed {
                    return None;
                }
                if let Some(delivery) = state.deliver(&self.queue, self.id, self.prefetch) {
                    return Some(delivery);
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        if self.take_unacked(tag).is_none() {
            tracing::debug!(queue = %self.queue, %tag, "Ignoring ack for unknown delivery");
            return Ok(());
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let Some(message) = self.take_unacked(tag) else {
            tracing::debug!(queue = %self.queue, %tag, "Ignoring nack for unknown delivery");
            return Ok(());
        };
        self.inner.lock().settle(&self.queue, message, requeue);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let id = self.id;
        let queue = self.queue.clone();
        let returned = self
            .inner
            .lock()
            .requeue_unacked(|name, u| name == queue && u.subscriber == id);
        if returned > 0 {
            tracing::debug!(queue = %self.queue, returned, "Subscription dropped with unacked deliveries");
            self.inner.notify.notify_waiters();
        }
    }
}
