//! Experience table benchmarks
//!
//! - Insert throughput with eviction, per remover
//! - Sample latency, per sampler
//! - Wire encoding with and without compression

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_common::{Tensor, TrainingRecord};
use relay_store::protocol::{encode, Codec, StoreRequest};
use relay_store::{Selector, Table, TableConfig};
use uuid::Uuid;

fn record(width: usize) -> TrainingRecord {
    TrainingRecord::new()
        .with_field("observation", Tensor::vector(vec![0.25; width]))
        .with_field("advantage", Tensor::vector(vec![1.0; 16]))
        .with_field("mask", Tensor::vector(vec![1.0; 16]))
}

fn selectors() -> [(&'static str, Selector); 4] {
    [
        ("fifo", Selector::Fifo),
        ("lifo", Selector::Lifo),
        ("min_heap", Selector::MinHeap),
        ("prioritized", Selector::Prioritized { exponent: 0.5 }),
    ]
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_insert");
    group.throughput(Throughput::Elements(1));

    for (name, remover) in selectors() {
        group.bench_with_input(BenchmarkId::new("remover", name), &remover, |b, &remover| {
            let table = Table::new(TableConfig {
                max_size: 4096,
                remover,
                seed: Some(1),
                ..Default::default()
            })
            .unwrap();
            let payload = record(256);
            let mut priority = 0.0;
            b.iter(|| {
                priority += 1.0;
                black_box(table.try_insert(payload.clone(), priority % 97.0).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_sample");

    for (name, sampler) in [("uniform", Selector::Uniform)].into_iter().chain(selectors()) {
        group.bench_with_input(BenchmarkId::new("sampler", name), &sampler, |b, &sampler| {
            let table = Table::new(TableConfig {
                max_size: 4096,
                sampler,
                seed: Some(1),
                ..Default::default()
            })
            .unwrap();
            for i in 0..4096 {
                table.try_insert(record(64), (i % 13) as f64 + 0.5).unwrap();
            }
            b.iter(|| black_box(table.try_sample().unwrap()));
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_encode");
    let request = StoreRequest::Write {
        batch_id: Uuid::new_v4(),
        table: "reverb_table_0".into(),
        records: (0..32).map(|_| record(1024)).collect(),
        priorities: vec![],
        timeout_ms: None,
    };

    for codec in [Codec::Raw, Codec::Zstd] {
        group.bench_with_input(
            BenchmarkId::new("codec", format!("{codec:?}")),
            &codec,
            |b, &codec| b.iter(|| black_box(encode(&request, codec).unwrap())),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_sample, bench_encode);
criterion_main!(benches);
