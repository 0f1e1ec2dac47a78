use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use orderdesk_core::{TenantId, UserId};
use orderdesk_events::{InMemoryEventBus, PublishedEvent};
use orderdesk_infra::{EngineConfig, InMemoryOrderStore, OrderService};
use orderdesk_inventory::{StockAdjustment, StockDirection, StockLevel, Variant, VariantId, plan};
use orderdesk_orders::{
    Address, AddressId, CreateOrderRequest, Customer, CustomerId, Discount, OrderItemInput,
    PriceLine, SearchDocument, SearchTerm, ShippingCharge, ShippingMode, TenantContext, compute,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn price_lines(count: usize) -> Vec<PriceLine> {
    (0..count)
        .map(|i| PriceLine {
            quantity: (i % 7 + 1) as i64,
            unit_price: Decimal::new(1999 + i as i64, 2),
            unit_cost: Decimal::new(850, 2),
        })
        .collect()
}

fn bench_pricing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pricing");

    for lines in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::new("compute", lines), lines, |b, &n| {
            let lines = price_lines(n);
            let discount = Discount::Percent(dec!(12.5));
            b.iter(|| {
                compute(
                    black_box(&lines),
                    dec!(0.15),
                    Some(&discount),
                    ShippingCharge::Manual(dec!(25)),
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_stock_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("stock_plan");

    for variants in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*variants as u64));
        group.bench_with_input(BenchmarkId::new("allocate", variants), variants, |b, &n| {
            let levels: Vec<StockLevel> = (0..n)
                .map(|i| StockLevel {
                    variant_id: VariantId::new(),
                    name: format!("Variant {i}"),
                    stock_quantity: 1_000,
                })
                .collect();
            // Every variant appears twice so the per-variant aggregation is exercised.
            let lines: Vec<StockAdjustment> = levels
                .iter()
                .chain(levels.iter())
                .map(|l| StockAdjustment {
                    variant_id: l.variant_id,
                    quantity: 3,
                })
                .collect();

            b.iter(|| plan(black_box(&levels), StockDirection::Allocate, black_box(&lines)).unwrap());
        });
    }

    group.finish();
}

fn bench_search_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_rank");
    let doc = SearchDocument {
        order_number: "K7Q2ZD",
        channel: "storefront",
        currency: "SAR",
        payment_reference: Some("pi_3OqL2mKx"),
        customer_name: Some("Layla Haddad"),
        customer_email: Some("layla@example.com"),
    };

    for (label, raw) in [("hit", "layla haddad"), ("miss", "nobody in particular")] {
        let term = SearchTerm::parse(raw).unwrap().unwrap();
        group.bench_function(label, |b| b.iter(|| term.rank(black_box(&doc))));
    }

    group.finish();
}

fn bench_order_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_creation");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    for items in [1usize, 10].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("in_memory", items), items, |b, &n| {
            let store = InMemoryOrderStore::new();
            let bus: Arc<InMemoryEventBus<PublishedEvent>> = Arc::new(InMemoryEventBus::new());
            let service = OrderService::new(store.clone(), bus, EngineConfig::default());

            let tenant_id = TenantId::new();
            let ctx = TenantContext::new(tenant_id, "SAR", dec!(0.15)).unwrap();
            let customer = Customer {
                id: CustomerId::new(),
                tenant_id,
                name: "Bench Customer".to_string(),
                email: None,
            };
            let address = Address {
                id: AddressId::new(),
                tenant_id,
                customer_id: customer.id,
                country_code: "SA".to_string(),
            };
            let variants: Vec<VariantId> = (0..n).map(|_| VariantId::new()).collect();

            runtime.block_on(async {
                store.put_customer(customer.clone()).await;
                store.put_address(address.clone()).await;
                for (i, id) in variants.iter().enumerate() {
                    store
                        .put_variant(Variant {
                            id: *id,
                            tenant_id,
                            name: format!("Variant {i}"),
                            sku: None,
                            currency: "SAR".to_string(),
                            sale_price: dec!(19.99),
                            cost_price: dec!(8.50),
                            stock_quantity: i64::MAX / 2,
                        })
                        .await;
                }
            });

            let actor = UserId::new();
            b.iter(|| {
                let request = CreateOrderRequest::new(
                    customer.id,
                    address.id,
                    variants.iter().map(|id| OrderItemInput::new(*id, 1)).collect(),
                    ShippingMode::free(),
                );
                runtime
                    .block_on(service.create(&ctx, actor, black_box(request)))
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pricing,
    bench_stock_plan,
    bench_search_rank,
    bench_order_creation
);
criterion_main!(benches);
