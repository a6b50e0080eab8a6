//! Collection throughput: monolithic teardown sweeps versus stepped
//! incremental sweeps over the same population.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::hint::black_box;

use reef_gc::{Cell, CollectionType, Heap, HeapOptions};

const POPULATION: u64 = 10_000;

struct Payload {
    value: u64,
}

impl Cell for Payload {
    const CLASS_NAME: &'static str = "Payload";
}

fn populated_heap() -> Heap {
    let mut heap = Heap::with_options(HeapOptions::default().conservative_scanning(false));
    for value in 0..POPULATION {
        let _ = heap.allocate(Payload { value });
    }
    heap
}

fn monolithic_collect(c: &mut Criterion) {
    c.bench_function("monolithic_collect_10k", |b| {
        b.iter_batched(
            populated_heap,
            |mut heap| {
                heap.collect_garbage(CollectionType::CollectEverything, false);
                black_box(heap)
            },
            BatchSize::SmallInput,
        );
    });
}

fn incremental_sweep(c: &mut Criterion) {
    c.bench_function("incremental_sweep_10k", |b| {
        b.iter_batched(
            populated_heap,
            |mut heap| {
                heap.collect_garbage(CollectionType::CollectGarbage, false);
                while !heap.sweep_next_block() {}
                black_box(heap)
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, monolithic_collect, incremental_sweep);
criterion_main!(benches);
