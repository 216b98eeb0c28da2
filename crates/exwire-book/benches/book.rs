//! Benchmarks for order book reconstruction
//!
//! Run with: cargo bench --bench book

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use exwire_book::{BookIncrement, OrderBookBuilder};
use exwire_types::{BookSnapshot, OrderOpen, Product, Side, SnapshotOrder};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Snapshot with N orders per side, 10 orders per price level
fn make_snapshot(seq: u64, orders_per_side: usize) -> BookSnapshot {
    let mut orders = Vec::with_capacity(orders_per_side * 2);
    for i in 0..orders_per_side {
        orders.push(SnapshotOrder {
            order_id: format!("bid_{}", i),
            side: Side::Buy,
            price: dec!(100000) - Decimal::from(i as i64 / 10),
            size: dec!(0.1) + Decimal::from(i as i64) / dec!(1000),
        });
        orders.push(SnapshotOrder {
            order_id: format!("ask_{}", i),
            side: Side::Sell,
            price: dec!(100001) + Decimal::from(i as i64 / 10),
            size: dec!(0.1) + Decimal::from(i as i64) / dec!(1000),
        });
    }
    BookSnapshot {
        product: Product::new("BTC-USD"),
        seq,
        orders,
    }
}

fn populated_book(orders_per_side: usize) -> OrderBookBuilder {
    let mut book = OrderBookBuilder::new(Product::new("BTC-USD"));
    book.on_snapshot(&make_snapshot(1, orders_per_side)).unwrap();
    book
}

fn bench_snapshot_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_load");

    for size in [100, 500, 1000] {
        let snap = make_snapshot(1, size);
        group.throughput(Throughput::Elements(size as u64 * 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &snap, |b, snap| {
            b.iter_batched(
                || OrderBookBuilder::new(Product::new("BTC-USD")),
                |mut book| {
                    book.on_snapshot(black_box(snap)).unwrap();
                    black_box(book)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_snapshot_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_diff");

    for size in [100, 500, 1000] {
        // Second snapshot shifted by one level so every price overlaps
        // except the edges
        let next = make_snapshot(2, size);
        group.throughput(Throughput::Elements(size as u64 * 2));

        group.bench_with_input(BenchmarkId::from_parameter(size), &next, |b, next| {
            b.iter_batched(
                || populated_book(size),
                |mut book| {
                    let deltas = book.on_snapshot(black_box(next)).unwrap();
                    black_box(deltas)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_order_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_open");

    for size in [100, 500, 1000] {
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || populated_book(size),
                |mut book| {
                    let msg = OrderOpen {
                        product: Product::new("BTC-USD"),
                        seq: 2,
                        order_id: "new".into(),
                        side: Side::Buy,
                        price: dec!(100000.5),
                        remaining_size: dec!(1.0),
                        time: None,
                    };
                    book.on_incremental(BookIncrement::Open(black_box(&msg)))
                        .unwrap();
                    black_box(book)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_snapshot_load,
    bench_snapshot_diff,
    bench_order_open
);
criterion_main!(benches);
