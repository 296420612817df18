//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p inventory --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::{CorrelationId, Money, OrderId, ProductId, SystemClock};
use events::{Event, StockItem};
use inventory::{
    InventoryError, InventoryService, InventoryStore, InventoryTx, PostgresInventoryStore, ReleaseOutcome,
    ReserveOutcome,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use transport::{Outbox, PostgresOutbox};

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
            for migration in [
                include_str!("../../../migrations/001_create_outbox_table.sql"),
                include_str!("../../../migrations/002_create_inventory_tables.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

struct Fixture {
    store: PostgresInventoryStore,
    service: Arc<InventoryService>,
    outbox: PostgresOutbox,
}

/// Fresh pool and cleared tables for each test.
async fn fixture(lock_timeout: Duration) -> Fixture {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE inventory_reservations, inventory_released_orders, products, outbox",
    )
    .execute(&pool)
    .await
    .unwrap();

    let store = PostgresInventoryStore::new(pool.clone()).with_lock_timeout(lock_timeout);
    let service = Arc::new(InventoryService::new(
        Arc::new(store.clone()),
        Arc::new(SystemClock),
    ));
    Fixture {
        store,
        service,
        outbox: PostgresOutbox::new(pool, inventory::PRODUCER),
    }
}

fn items(pairs: &[(&str, u32)]) -> Vec<StockItem> {
    pairs.iter().map(|(id, q)| StockItem::new(*id, *q)).collect()
}

async fn pending_events(outbox: &PostgresOutbox) -> Vec<Event> {
    outbox
        .pending(100)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.envelope.payload)
        .collect()
}

#[tokio::test]
#[serial]
async fn reserve_and_release_round_trip() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.service
        .create_product(ProductId::new("P1"), "Widget", 5)
        .await
        .unwrap();
    let order_id = OrderId::new();
    let corr = CorrelationId::from(order_id);

    let outcome = fx
        .service
        .reserve(order_id, &items(&[("P1", 3)]), Money::from_cents(3000), &corr)
        .await
        .unwrap();
    assert!(matches!(outcome, ReserveOutcome::Reserved { .. }));

    let product = fx.service.get_product(&ProductId::new("P1")).await.unwrap();
    assert_eq!(product.reserved_quantity, 3);
    assert_eq!(product.available_quantity(), 2);

    let released = fx.service.release(order_id, "cancelled", &corr).await.unwrap();
    assert_eq!(
        released,
        ReleaseOutcome::Released {
            items: items(&[("P1", 3)])
        }
    );

    let reservations = fx.store.reservations_for_order(order_id).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert!(reservations[0].is_released);

    let events = pending_events(&fx.outbox).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Event::InventoryReserved(_)));
    assert!(matches!(events[1], Event::InventoryReleased(_)));
}

#[tokio::test]
#[serial]
async fn replayed_reservation_is_idempotent() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.service
        .create_product(ProductId::new("P1"), "Widget", 5)
        .await
        .unwrap();
    let order_id = OrderId::new();
    let corr = CorrelationId::from(order_id);

    fx.service
        .reserve(order_id, &items(&[("P1", 2)]), Money::zero(), &corr)
        .await
        .unwrap();
    let replay = fx
        .service
        .reserve(order_id, &items(&[("P1", 2)]), Money::zero(), &corr)
        .await
        .unwrap();

    assert_eq!(replay, ReserveOutcome::AlreadyReserved);
    let product = fx.service.get_product(&ProductId::new("P1")).await.unwrap();
    assert_eq!(product.reserved_quantity, 2);
    assert_eq!(pending_events(&fx.outbox).await.len(), 1);
}

#[tokio::test]
#[serial]
async fn concurrent_reservations_never_oversell() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.service
        .create_product(ProductId::new("P1"), "Widget", 5)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let service = Arc::clone(&fx.service);
        handles.push(tokio::spawn(async move {
            let order_id = OrderId::new();
            service
                .reserve(
                    order_id,
                    &items(&[("P1", 3)]),
                    Money::zero(),
                    &CorrelationId::from(order_id),
                )
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let reserved = outcomes
        .iter()
        .filter(|o| matches!(o, ReserveOutcome::Reserved { .. }))
        .count();
    let insufficient = outcomes
        .iter()
        .filter(|o| matches!(o, ReserveOutcome::Insufficient { .. }))
        .count();
    assert_eq!((reserved, insufficient), (1, 1));

    let product = fx.service.get_product(&ProductId::new("P1")).await.unwrap();
    assert_eq!(product.reserved_quantity, 3);
}

#[tokio::test]
#[serial]
async fn opposite_item_orders_do_not_deadlock() {
    let fx = fixture(Duration::from_secs(5)).await;
    for id in ["A", "B"] {
        fx.service
            .create_product(ProductId::new(id), "Widget", 100)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..10 {
        let service = Arc::clone(&fx.service);
        let request = if i % 2 == 0 {
            items(&[("A", 1), ("B", 1)])
        } else {
            items(&[("B", 1), ("A", 1)])
        };
        handles.push(tokio::spawn(async move {
            let order_id = OrderId::new();
            service
                .reserve(order_id, &request, Money::zero(), &CorrelationId::from(order_id))
                .await
        }));
    }
    for handle in handles {
        assert!(matches!(
            handle.await.unwrap(),
            Ok(ReserveOutcome::Reserved { .. })
        ));
    }

    for id in ["A", "B"] {
        let product = fx.service.get_product(&ProductId::new(id)).await.unwrap();
        assert_eq!(product.reserved_quantity, 10);
    }
}

#[tokio::test]
#[serial]
async fn lock_timeout_is_a_conflict() {
    let fx = fixture(Duration::from_millis(100)).await;
    fx.service
        .create_product(ProductId::new("P1"), "Widget", 5)
        .await
        .unwrap();

    let mut holder = fx.store.begin().await.unwrap();
    holder.lock_product(&ProductId::new("P1")).await.unwrap();

    let order_id = OrderId::new();
    let result = fx
        .service
        .reserve(
            order_id,
            &items(&[("P1", 1)]),
            Money::zero(),
            &CorrelationId::from(order_id),
        )
        .await;
    assert!(matches!(result, Err(InventoryError::ConcurrencyConflict(_))));

    drop(holder);
    assert!(pending_events(&fx.outbox).await.is_empty());
}

#[tokio::test]
#[serial]
async fn duplicate_product_is_rejected() {
    let fx = fixture(Duration::from_secs(5)).await;
    fx.service
        .create_product(ProductId::new("P1"), "Widget", 5)
        .await
        .unwrap();

    let result = fx
        .service
        .create_product(ProductId::new("P1"), "Widget", 5)
        .await;
    assert!(matches!(result, Err(InventoryError::ProductAlreadyExists(_))));
}
