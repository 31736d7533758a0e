use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{NaiveDate, Utc};
use pharmastock_core::{BatchId, Entity, InvoiceId, LineId, ProductId, UserId};
use pharmastock_infra::{
    AllocationManager, InMemoryInventoryStore, LedgerSession, SaleEngine, SaleRequest,
};
use pharmastock_inventory::{Batch, LotSpec};
use pharmastock_products::ProductAttrs;
use pharmastock_purchasing::InvoiceLine;
use pharmastock_sales::{PaymentMethod, SaleRequestLine, plan_consumption};
use std::sync::Arc;

fn lot(day: u32) -> LotSpec {
    LotSpec {
        product_name: "Amoxicillin".to_string(),
        packaging_unit: "strip".to_string(),
        unit_cost: 1000,
        expiry_date: NaiveDate::from_yo_opt(2026, 1 + day % 365),
    }
}

/// `lots` rows of 10 units each bound to one product, expiries scattered.
fn bound_rows(product: ProductId, lots: usize) -> Vec<Batch> {
    (0..lots)
        .map(|i| {
            let day = (i as u32).wrapping_mul(7919) % 365;
            let mut source = Batch::receive(
                BatchId::new(),
                InvoiceId::new(),
                LineId::new(),
                lot(day),
                10,
                Utc::now(),
            )
            .unwrap();
            source.carve(BatchId::new(), 10, product, Utc::now()).unwrap()
        })
        .collect()
}

fn bench_fefo_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("fefo_plan");

    for lots in [10usize, 100, 1_000] {
        let product = ProductId::new();
        let rows = bound_rows(product, lots);
        let ask = (lots as i64 * 10) / 2;

        group.throughput(Throughput::Elements(lots as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lots), &rows, |b, rows| {
            b.iter(|| plan_consumption(black_box(product), black_box(rows), black_box(ask)).unwrap());
        });
    }

    group.finish();
}

/// Setup: one product holding `lots` bound rows in the in-memory store.
fn seeded_store(runtime: &tokio::runtime::Runtime, lots: usize) -> (SaleEngine, ProductId) {
    runtime.block_on(async {
        let store = Arc::new(InMemoryInventoryStore::new());
        let manager = AllocationManager::new(store.clone());
        let invoice = InvoiceId::new();

        let mut session = LedgerSession::open(store.as_ref()).await.unwrap();
        let mut rows = Vec::with_capacity(lots);
        for i in 0..lots {
            let line = InvoiceLine {
                line_id: LineId::new(),
                lot: lot((i as u32).wrapping_mul(7919) % 365),
                quantity: 1_000_000,
            };
            rows.push(session.receive(invoice, &line).await.unwrap());
        }
        session.commit().await.unwrap();

        let attrs = ProductAttrs {
            name: None,
            selling_price: 1,
            margin_percent: None,
            category_id: None,
            image_path: None,
        };
        let product = manager
            .create_product(rows[0].id(), 1_000_000, attrs)
            .await
            .unwrap()
            .product
            .id();
        for row in &rows[1..] {
            manager.add_allocation(product, row.id(), 1_000_000).await.unwrap();
        }
        (SaleEngine::new(store), product)
    })
}

fn bench_record_sale(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("record_sale");

    for lots in [10usize, 100] {
        let (engine, product) = seeded_store(&runtime, lots);
        group.bench_with_input(BenchmarkId::from_parameter(lots), &lots, |b, _| {
            b.iter(|| {
                runtime
                    .block_on(engine.record_sale(SaleRequest {
                        cashier_id: UserId::new(),
                        payment_method: PaymentMethod::Cash,
                        amount_paid: 1_000,
                        lines: vec![SaleRequestLine {
                            product_id: black_box(product),
                            quantity: 3,
                            unit_price: None,
                        }],
                    }))
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fefo_plan, bench_record_sale);
criterion_main!(benches);
