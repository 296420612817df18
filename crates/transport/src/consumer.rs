use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use events::EventEnvelope;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::broker::Subscription;
use crate::message::{Delivery, DeliveryTag};
use crate::Result;

/// Failure reported by a message handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The message could succeed later; it is redelivered.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The message can never succeed; it is dead-lettered.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Reacts to one decoded event. Must be idempotent: deliveries are at least once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: EventEnvelope) -> std::result::Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ack,
    Requeue,
    Reject,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ack => "ack",
            Outcome::Requeue => "requeue",
            Outcome::Reject => "reject",
        }
    }
}

/// Drives a [`MessageHandler`] from a [`Subscription`].
///
/// Each delivery is decoded and handled in its own task; the subscription's
/// prefetch bounds how many run at once. Successful handling is acked,
/// transient failures are requeued after a backoff, and undecodable or
/// rejected messages are dead-lettered.
pub struct Consumer {
    subscription: Box<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
    retry_backoff: Duration,
}

impl Consumer {
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

    pub fn new(subscription: Box<dyn Subscription>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            subscription,
            handler,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Base delay before a transiently failed message is requeued. The delay
    /// grows linearly with the delivery count.
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Runs the consumer on a new task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Consumes until the shutdown flag is set or the transport closes, then
    /// waits for in-flight handlers and settles them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let queue = self.subscription.queue().to_string();
        let mut in_flight: JoinSet<(DeliveryTag, Outcome)> = JoinSet::new();

        tracing::info!(queue = %queue, handler = self.handler.name(), "Consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.settle_joined(&queue, joined).await?;
                }
                delivery = self.subscription.recv() => {
                    let Some(delivery) = delivery else {
                        break;
                    };
                    self.dispatch(&queue, delivery, &mut in_flight).await?;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            self.settle_joined(&queue, joined).await?;
        }

        tracing::info!(queue = %queue, handler = self.handler.name(), "Consumer stopped");
        Ok(())
    }

    async fn dispatch(
        &mut self,
        queue: &str,
        delivery: Delivery,
        in_flight: &mut JoinSet<(DeliveryTag, Outcome)>,
    ) -> Result<()> {
        let tag = delivery.tag;
        let attempt = delivery.delivery_count().max(1);

        let envelope = match events::decode_envelope(&delivery.message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    queue = %queue,
                    message_id = %delivery.message.message_id,
                    routing_key = %delivery.message.routing_key,
                    error = %e,
                    "Undecodable message"
                );
                return self.settle(queue, tag, Outcome::Reject).await;
            }
        };

        let span = tracing::info_span!(
            "consume",
            queue = %queue,
            event_type = %envelope.event_type(),
            event_id = %envelope.event_id,
            correlation_id = %envelope.correlation_id,
            attempt,
        );
        let handler = Arc::clone(&self.handler);
        let backoff = self.retry_backoff * attempt.min(10);
        let queue_label = queue.to_string();

        in_flight.spawn(
            async move {
                let start = Instant::now();
                let result = AssertUnwindSafe(handler.handle(envelope))
                    .catch_unwind()
                    .await;
                metrics::histogram!("consumer_handle_duration_seconds", "queue" => queue_label)
                    .record(start.elapsed().as_secs_f64());

                let outcome = match result {
                    Ok(Ok(())) => Outcome::Ack,
                    Ok(Err(HandlerError::Transient(reason))) => {
                        tracing::warn!(%reason, "Handler failed transiently, will retry");
                        tokio::time::sleep(backoff).await;
                        Outcome::Requeue
                    }
                    Ok(Err(HandlerError::Rejected(reason))) => {
                        tracing::warn!(%reason, "Handler rejected message");
                        Outcome::Reject
                    }
                    Err(_) => {
                        tracing::error!("Handler panicked");
                        tokio::time::sleep(backoff).await;
                        Outcome::Requeue
                    }
                };
                (tag, outcome)
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn settle_joined(
        &mut self,
        queue: &str,
        joined: std::result::Result<(DeliveryTag, Outcome), tokio::task::JoinError>,
    ) -> Result<()> {
        match joined {
            Ok((tag, outcome)) => self.settle(queue, tag, outcome).await,
            Err(e) => {
                // The delivery stays unacked until the subscription is dropped.
                tracing::error!(queue = %queue, error = %e, "Handler task failed");
                Ok(())
            }
        }
    }

    async fn settle(&mut self, queue: &str, tag: DeliveryTag, outcome: Outcome) -> Result<()> {
        metrics::counter!(
            "consumer_messages_total",
            "queue" => queue.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        match outcome {
            Outcome::Ack => self.subscription.ack(tag).await,
            Outcome::Requeue => self.subscription.nack(tag, true).await,
            Outcome::Reject => self.subscription.nack(tag, false).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, QueueSpec, Transport};
    use crate::message::Message;
    use common::{OrderId, UserId};
    use events::{Event, OrderConfirmedData};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn confirmed() -> EventEnvelope {
        EventEnvelope::new(Event::OrderConfirmed(OrderConfirmedData {
            order_id: OrderId::new(),
            user_id: UserId::new("u1"),
        }))
    }

    /// Fails the first `failures` attempts with the given error, then succeeds.
    struct ScriptedHandler {
        failures: usize,
        error: HandlerError,
        calls: AtomicUsize,
        handled: Mutex<Vec<EventEnvelope>>,
    }

    impl ScriptedHandler {
        fn new(failures: usize, error: HandlerError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
                handled: Mutex::new(Vec::new()),
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(0, HandlerError::Transient(String::new()))
        }

        fn handled(&self) -> Vec<EventEnvelope> {
            self.handled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn handle(&self, envelope: EventEnvelope) -> std::result::Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            self.handled.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn start(
        broker: &InMemoryBroker,
        spec: QueueSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> (watch::Sender<bool>, JoinHandle<Result<()>>) {
        let subscription = broker.declare_queue(spec).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = Consumer::new(subscription, handler)
            .with_retry_backoff(Duration::from_millis(1))
            .spawn(rx);
        (tx, handle)
    }

    #[tokio::test]
    async fn handles_and_acks() {
        let broker = InMemoryBroker::default();
        let handler = ScriptedHandler::ok();
        let (stop, handle) = start(&broker, QueueSpec::new("q").bind("order.*"), handler.clone()).await;

        let envelope = confirmed();
        broker.publish(&envelope).await.unwrap();

        wait_until(|| handler.handled().len() == 1).await;
        assert_eq!(handler.handled()[0], envelope);
        wait_until(|| broker.unacked_count("q") == Some(0)).await;

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let broker = InMemoryBroker::default();
        let handler = ScriptedHandler::new(2, HandlerError::Transient("busy".into()));
        let (stop, handle) = start(&broker, QueueSpec::new("q").bind("order.*"), handler.clone()).await;

        broker.publish(&confirmed()).await.unwrap();

        wait_until(|| handler.handled().len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(broker.dead_letters("q").is_empty());

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn persistent_transient_failure_is_dead_lettered() {
        let broker = InMemoryBroker::default();
        let handler = ScriptedHandler::new(usize::MAX, HandlerError::Transient("down".into()));
        let spec = QueueSpec::new("q").bind("order.*").with_max_deliveries(3);
        let (stop, handle) = start(&broker, spec, handler.clone()).await;

        broker.publish(&confirmed()).await.unwrap();

        wait_until(|| broker.dead_letters("q").len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered_once() {
        let broker = InMemoryBroker::default();
        let handler = ScriptedHandler::new(usize::MAX, HandlerError::Rejected("bad".into()));
        let (stop, handle) = start(&broker, QueueSpec::new("q").bind("order.*"), handler.clone()).await;

        broker.publish(&confirmed()).await.unwrap();

        wait_until(|| broker.dead_letters("q").len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn undecodable_messages_skip_the_handler() {
        let broker = InMemoryBroker::default();
        let handler = ScriptedHandler::ok();
        let (stop, handle) = start(&broker, QueueSpec::new("q").bind("order.*"), handler.clone()).await;

        let mut message = Message::from_envelope(&confirmed()).unwrap();
        message.body = br#"{"event_type":"order.confirmed"}"#.to_vec();
        broker.publish_message(message).await.unwrap();

        wait_until(|| broker.dead_letters("q").len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    struct SlowHandler {
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _envelope: EventEnvelope) -> std::result::Result<(), HandlerError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn prefetch_bounds_handler_concurrency() {
        let broker = InMemoryBroker::default();
        let handler = Arc::new(SlowHandler {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        });
        let spec = QueueSpec::new("q").bind("order.*").with_prefetch(2);
        let (stop, handle) = start(&broker, spec, handler.clone()).await;

        for _ in 0..6 {
            broker.publish(&confirmed()).await.unwrap();
        }

        wait_until(|| handler.done.load(Ordering::SeqCst) == 6).await;
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stops_when_transport_closes() {
        let broker = InMemoryBroker::default();
        let (_stop, handle) = start(&broker, QueueSpec::new("q").bind("order.*"), ScriptedHandler::ok()).await;

        broker.close();
        handle.await.unwrap().unwrap();
    }
}
