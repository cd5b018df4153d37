// Benchmarks for the namespace cache diff engine
// Measures full updates with mixed changes and steady-state re-application

use std::collections::HashMap;
use std::hint::black_box;

use batata_apollo_client::NamespaceCache;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn config_map(size: usize, generation: usize) -> HashMap<String, String> {
    (0..size)
        .map(|i| {
            // Every tenth key changes per generation, the tail shifts by one
            let value = if i % 10 == 0 {
                format!("value-{}-{}", i, generation)
            } else {
                format!("value-{}", i)
            };
            (format!("key.{}", i + generation), value)
        })
        .collect()
}

fn bench_update_with_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("namespace_update_changes");

    for size in [10, 100, 1000] {
        let first = config_map(size, 0);
        let second = config_map(size, 1);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter_batched(
                || {
                    let cache = NamespaceCache::new("application");
                    cache.update(&first, None);
                    cache
                },
                |cache| cache.update(black_box(&second), None),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_update_unchanged(c: &mut Criterion) {
    let mut group = c.benchmark_group("namespace_update_unchanged");

    for size in [10, 100, 1000] {
        let values = config_map(size, 0);
        let cache = NamespaceCache::new("application");
        cache.update(&values, None);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| cache.update(black_box(&values), None))
        });
    }

    group.finish();
}

fn bench_typed_reads(c: &mut Criterion) {
    let cache = NamespaceCache::new("application");
    cache.update(
        &HashMap::from([
            ("int".to_string(), "42".to_string()),
            ("list".to_string(), "a,b,c,d".to_string()),
        ]),
        None,
    );

    c.bench_function("get_int_value", |b| {
        b.iter(|| cache.get_int_value(black_box("int"), 0))
    });
    c.bench_function("get_string_slice_value", |b| {
        b.iter(|| cache.get_string_slice_value(black_box("list"), ",", Vec::new()))
    });
}

criterion_group!(
    benches,
    bench_update_with_changes,
    bench_update_unchanged,
    bench_typed_reads
);
criterion_main!(benches);
