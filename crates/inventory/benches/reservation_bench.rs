use std::sync::Arc;

use common::{CorrelationId, Money, OrderId, ProductId, SystemClock};
use criterion::{Criterion, criterion_group, criterion_main};
use events::StockItem;
use inventory::{InMemoryInventoryStore, InventoryService};

async fn service_with_products(count: usize) -> InventoryService {
    let store = InMemoryInventoryStore::default();
    let service = InventoryService::new(Arc::new(store), Arc::new(SystemClock));
    for i in 0..count {
        service
            .create_product(ProductId::new(format!("P{i}")), "Widget", 1_000_000)
            .await
            .unwrap();
    }
    service
}

fn bench_reserve_single_item(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = rt.block_on(service_with_products(1));
    let items = vec![StockItem::new("P0", 1)];

    c.bench_function("inventory/reserve_single_item", |b| {
        b.iter(|| {
            rt.block_on(async {
                let order_id = OrderId::new();
                service
                    .reserve(
                        order_id,
                        &items,
                        Money::from_cents(1000),
                        &CorrelationId::from(order_id),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_reserve_ten_items(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = rt.block_on(service_with_products(10));
    let items: Vec<StockItem> = (0..10)
        .rev()
        .map(|i| StockItem::new(format!("P{i}"), 1))
        .collect();

    c.bench_function("inventory/reserve_ten_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                let order_id = OrderId::new();
                service
                    .reserve(
                        order_id,
                        &items,
                        Money::from_cents(10_000),
                        &CorrelationId::from(order_id),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_reserve_then_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = rt.block_on(service_with_products(3));
    let items = vec![StockItem::new("P0", 2), StockItem::new("P2", 1)];

    c.bench_function("inventory/reserve_then_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let order_id = OrderId::new();
                let corr = CorrelationId::from(order_id);
                service
                    .reserve(order_id, &items, Money::from_cents(3000), &corr)
                    .await
                    .unwrap();
                service.release(order_id, "cancelled", &corr).await.unwrap();
            });
        });
    });
}

fn bench_replayed_reservation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = rt.block_on(service_with_products(1));
    let items = vec![StockItem::new("P0", 1)];
    let order_id = OrderId::new();
    let corr = CorrelationId::from(order_id);
    rt.block_on(service.reserve(order_id, &items, Money::zero(), &corr))
        .unwrap();

    c.bench_function("inventory/replayed_reservation", |b| {
        b.iter(|| {
            rt.block_on(async {
                service
                    .reserve(order_id, &items, Money::zero(), &corr)
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_single_item,
    bench_reserve_ten_items,
    bench_reserve_then_release,
    bench_replayed_reservation
);
criterion_main!(benches);
