#![allow(missing_docs)]
//! Benchmarks for the deferred event queue.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use pulse_core::ticks::{DeferredEventQueue, TickPriority};

type Pos = (i32, i32, i32);

/// Fills a queue with `count` events spread over 20 ticks.
fn filled_queue(count: i32) -> DeferredEventQueue<Pos, u16> {
    let mut queue = DeferredEventQueue::new();
    for i in 0..count {
        let pos = (i % 64, i / 4096, (i / 64) % 64);
        queue.schedule(pos, 1, u64::from(i.unsigned_abs() % 20), TickPriority::Normal);
    }
    queue
}

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    for count in [1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| black_box(filled_queue(count)));
        });
    }
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_due");
    for count in [1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || filled_queue(count),
                |mut queue| {
                    // One tick worth of events out of twenty
                    black_box(queue.drain_due(black_box(0)));
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_duplicate_check(c: &mut Criterion) {
    let queue = filled_queue(10_000);
    c.bench_function("has_scheduled", |b| {
        b.iter(|| black_box(queue.has_scheduled(black_box((10, 0, 10)), black_box(1))));
    });
}

criterion_group!(benches, bench_schedule, bench_drain, bench_duplicate_check);
criterion_main!(benches);
