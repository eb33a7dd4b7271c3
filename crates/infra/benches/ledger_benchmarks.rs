use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::thread;

use stockwise_core::ProductId;
use stockwise_events::{BusMessage, InMemoryEventBus, channels};
use stockwise_infra::consumer::OrderEventConsumer;
use stockwise_infra::idempotency::{IdempotencyGuard, InMemoryProcessedEventStore};
use stockwise_infra::ledger::{InMemoryLedgerStore, StockLedger};
use stockwise_infra::publisher::{OutboxPublisher, Publisher};
use stockwise_infra::router::EventRouter;
use stockwise_inventory::AdjustmentReason;

fn publisher() -> Arc<dyn Publisher> {
    Arc::new(OutboxPublisher::new(Arc::new(InMemoryEventBus::<BusMessage>::new())))
}

fn ledger() -> Arc<StockLedger> {
    Arc::new(StockLedger::new(Arc::new(InMemoryLedgerStore::new()), publisher()))
}

fn bench_adjust_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("adjust_latency");
    group.sample_size(1000);

    group.bench_function("single_product", |b| {
        let ledger = ledger();
        let p = ProductId::new();
        ledger.register_product(p, 0, 1).unwrap();

        // Alternate so stock never runs out.
        let mut up = true;
        b.iter(|| {
            let delta = if up { 1 } else { -1 };
            up = !up;
            black_box(ledger.adjust(p, delta, AdjustmentReason::Manual).unwrap());
        });
    });

    group.finish();
}

/// Same total work, either all on one product (serialised by its lock) or
/// spread over one product per thread.
fn bench_contention(c: &mut Criterion) {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 250;

    let mut group = c.benchmark_group("adjust_contention");
    group.throughput(Throughput::Elements((THREADS * PER_THREAD) as u64));

    for shared in [true, false] {
        let label = if shared { "same_product" } else { "independent_products" };
        group.bench_with_input(BenchmarkId::new("threads", label), &shared, |b, &shared| {
            let ledger = ledger();
            let products: Vec<ProductId> = if shared {
                vec![ProductId::new()]
            } else {
                (0..THREADS).map(|_| ProductId::new()).collect()
            };
            for p in &products {
                ledger.register_product(*p, 0, 0).unwrap();
            }

            b.iter(|| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|i| {
                        let ledger = Arc::clone(&ledger);
                        let p = products[i % products.len()];
                        thread::spawn(move || {
                            for _ in 0..PER_THREAD {
                                ledger.adjust(p, 1, AdjustmentReason::Manual).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_verification");

    for history_len in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*history_len as u64));
        group.bench_with_input(
            BenchmarkId::new("verify_replay", history_len),
            history_len,
            |b, &len| {
                let ledger = ledger();
                let p = ProductId::new();
                ledger.register_product(p, 0, 1).unwrap();
                for _ in 1..len {
                    ledger.adjust(p, 1, AdjustmentReason::Manual).unwrap();
                }

                b.iter(|| black_box(ledger.verify_replay(p).unwrap()));
            },
        );
    }

    group.finish();
}

fn bench_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_event_consume");

    let ledger = ledger();
    let p = ProductId::new();
    ledger.register_product(p, 0, 0).unwrap();
    let consumer = OrderEventConsumer::new(
        IdempotencyGuard::new(Arc::new(InMemoryProcessedEventStore::new())),
        EventRouter::new(Arc::clone(&ledger)),
        publisher(),
    );

    group.bench_function("fresh_event", |b| {
        let mut n: u64 = 0;
        b.iter(|| {
            n += 1;
            let payload = format!(
                r#"{{"eventType":"ORDER_CANCELLED","orderId":{n},"eventId":"bench-{n}","items":[{{"productId":"{p}","quantity":1}}]}}"#
            );
            let msg = BusMessage::raw(channels::ORDER_EVENTS, None, payload);
            black_box(consumer.handle(&msg).unwrap());
        });
    });

    group.bench_function("duplicate_event", |b| {
        let payload = format!(
            r#"{{"eventType":"ORDER_CANCELLED","orderId":1,"eventId":"bench-dup","items":[{{"productId":"{p}","quantity":1}}]}}"#
        );
        let msg = BusMessage::raw(channels::ORDER_EVENTS, None, payload);
        consumer.handle(&msg).unwrap();

        b.iter(|| black_box(consumer.handle(&msg).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_adjust_latency,
    bench_contention,
    bench_replay,
    bench_consume
);
criterion_main!(benches);
