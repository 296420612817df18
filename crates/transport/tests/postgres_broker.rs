//! PostgreSQL broker integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p transport --test postgres_broker -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::{OrderId, UserId};
use events::{Event, EventEnvelope, OrderConfirmedData};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use transport::{
    DEATH_REASON_HEADER, Delivery, PostgresBroker, QueueSpec, Subscription, Transport, TransportError,
};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/005_create_broker_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn setup() -> PgPool {
    let info = get_container_info().await;
    let pool = PgPool::connect(&info.connection_string).await.unwrap();
    sqlx::query("TRUNCATE TABLE broker_messages, broker_bindings, broker_queues")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

fn broker(pool: &PgPool) -> PostgresBroker {
    PostgresBroker::new(pool.clone(), "test.events").with_poll_interval(Duration::from_millis(5))
}

fn confirmed() -> EventEnvelope {
    EventEnvelope::new(Event::OrderConfirmed(OrderConfirmedData {
        order_id: OrderId::new(),
        user_id: UserId::new("u1"),
    }))
}

async fn recv_now(sub: &mut Box<dyn Subscription>) -> Option<Delivery> {
    tokio::time::timeout(Duration::from_millis(500), sub.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
#[serial]
async fn test_undelivered_message_survives_restart() {
    let pool = setup().await;
    let envelope = confirmed();

    {
        let first = broker(&pool);
        let _sub = first
            .declare_queue(QueueSpec::new("q").bind("order.*"))
            .await
            .unwrap();
        first.publish(&envelope).await.unwrap();
        first.close();
    }

    let second = broker(&pool);
    let mut sub = second
        .declare_queue(QueueSpec::new("q").bind("order.*"))
        .await
        .unwrap();
    let delivery = recv_now(&mut sub).await.unwrap();
    assert_eq!(delivery.message.message_id, envelope.event_id);
    assert_eq!(delivery.message.correlation_id, envelope.correlation_id);
    assert_eq!(delivery.delivery_count(), 1);
    assert_eq!(events::decode_envelope(&delivery.message.body).unwrap(), envelope);

    sub.ack(delivery.tag).await.unwrap();
    assert_eq!(second.queue_depth("q").await.unwrap(), 0);
    assert!(recv_now(&mut sub).await.is_none());
}

#[tokio::test]
#[serial]
async fn test_expired_lease_is_redelivered() {
    let pool = setup().await;
    let broker = broker(&pool).with_lease(Duration::from_millis(100));
    let mut crashed = broker
        .declare_queue(QueueSpec::new("q").bind("order.*"))
        .await
        .unwrap();
    let mut survivor = broker
        .declare_queue(QueueSpec::new("q").bind("order.*"))
        .await
        .unwrap();
    broker.publish(&confirmed()).await.unwrap();

    let lost = recv_now(&mut crashed).await.unwrap();
    // Leaked so no release runs, as if the process died.
    std::mem::forget(crashed);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let again = recv_now(&mut survivor).await.unwrap();
    assert!(again.redelivered);
    assert_eq!(again.delivery_count(), 2);
    assert_eq!(again.message.message_id, lost.message.message_id);
}

#[tokio::test]
#[serial]
async fn test_fans_out_to_matching_queues() {
    let pool = setup().await;
    let broker = broker(&pool);
    let mut a = broker
        .declare_queue(QueueSpec::new("a").bind("order.*"))
        .await
        .unwrap();
    let mut b = broker
        .declare_queue(QueueSpec::new("b").bind("order.confirmed"))
        .await
        .unwrap();
    let _c = broker
        .declare_queue(QueueSpec::new("c").bind("payment.#"))
        .await
        .unwrap();

    broker.publish(&confirmed()).await.unwrap();

    assert!(recv_now(&mut a).await.is_some());
    assert!(recv_now(&mut b).await.is_some());
    assert_eq!(broker.queue_depth("c").await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn test_preserves_order_and_prefetch() {
    let pool = setup().await;
    let broker = broker(&pool);
    let mut sub = broker
        .declare_queue(QueueSpec::new("q").bind("order.*").with_prefetch(2))
        .await
        .unwrap();

    let envelopes: Vec<_> = (0..3).map(|_| confirmed()).collect();
    for envelope in &envelopes {
        broker.publish(envelope).await.unwrap();
    }

    let d1 = recv_now(&mut sub).await.unwrap();
    let d2 = recv_now(&mut sub).await.unwrap();
    assert_eq!(d1.message.message_id, envelopes[0].event_id);
    assert_eq!(d2.message.message_id, envelopes[1].event_id);
    assert!(recv_now(&mut sub).await.is_none());

    sub.ack(d1.tag).await.unwrap();
    let d3 = recv_now(&mut sub).await.unwrap();
    assert_eq!(d3.message.message_id, envelopes[2].event_id);
}

#[tokio::test]
#[serial]
async fn test_nack_requeues_then_dead_letters() {
    let pool = setup().await;
    let broker = broker(&pool);
    let mut sub = broker
        .declare_queue(QueueSpec::new("q").bind("order.*").with_max_deliveries(2))
        .await
        .unwrap();
    broker.publish(&confirmed()).await.unwrap();

    let first = recv_now(&mut sub).await.unwrap();
    sub.nack(first.tag, true).await.unwrap();
    let second = recv_now(&mut sub).await.unwrap();
    assert!(second.redelivered);
    assert_eq!(second.delivery_count(), 2);
    sub.nack(second.tag, true).await.unwrap();

    assert!(recv_now(&mut sub).await.is_none());
    let dead = broker.dead_letters("q").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, first.message.message_id);
    assert_eq!(dead[0].header(DEATH_REASON_HEADER), Some("delivery limit reached"));
}

#[tokio::test]
#[serial]
async fn test_reject_dead_letters_and_stale_ack_is_ignored() {
    let pool = setup().await;
    let broker = broker(&pool);
    let mut sub = broker
        .declare_queue(QueueSpec::new("q").bind("order.*"))
        .await
        .unwrap();
    broker.publish(&confirmed()).await.unwrap();

    let delivery = recv_now(&mut sub).await.unwrap();
    sub.nack(delivery.tag, false).await.unwrap();
    sub.ack(delivery.tag).await.unwrap();

    let dead = broker.dead_letters("q").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].header(DEATH_REASON_HEADER), Some("rejected"));
    assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn test_closed_broker_rejects_publish_and_ends_subscriptions() {
    let pool = setup().await;
    let broker = broker(&pool);
    let mut sub = broker
        .declare_queue(QueueSpec::new("q").bind("order.*"))
        .await
        .unwrap();

    broker.close();
    assert!(matches!(
        broker.publish(&confirmed()).await,
        Err(TransportError::Closed)
    ));
    assert!(sub.recv().await.is_none());
}
