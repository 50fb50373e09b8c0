use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use conveyor::{Prefetcher, SequenceViewExt, from_fn};

const ELEMENTS: usize = 2_048;
const MIX_ROUNDS: u32 = 512;

/// A compute-bound element: enough integer mixing to dominate scheduling
/// overhead without touching memory.
fn busy_value(i: usize, rounds: u32) -> u64 {
    let mut x = i as u64 ^ 0x9E37_79B9_7F4A_7C15;
    for _ in 0..rounds {
        x = x.wrapping_mul(0x2545_F491_4F6C_DD1D).rotate_left(23) ^ (x >> 17);
    }
    x
}

fn benchmark_ordered_prefetch(c: &mut Criterion) {
    let view = Arc::new(from_fn(ELEMENTS, |i| busy_value(i, MIX_ROUNDS)));

    let mut group = c.benchmark_group("ordered_prefetch");
    group.throughput(Throughput::Elements(ELEMENTS as u64));

    group.bench_function("sequential", |b| {
        b.iter(|| {
            let sum = view
                .iter()
                .map(|r| r.expect("element"))
                .fold(0u64, u64::wrapping_add);
            black_box(sum);
        });
    });

    for nworkers in [2_usize, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", nworkers), &nworkers, |b, &n| {
            b.iter(|| {
                let prefetcher =
                    Prefetcher::threads(Arc::clone(&view), n, n * 8).expect("spawn prefetcher");
                let sum = prefetcher
                    .map(|r| r.expect("element"))
                    .fold(0u64, u64::wrapping_add);
                black_box(sum);
            });
        });
    }
    group.finish();
}

criterion_group!(ordered_prefetch, benchmark_ordered_prefetch);
criterion_main!(ordered_prefetch);
