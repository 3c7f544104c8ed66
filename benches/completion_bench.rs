//! Criterion benchmark untuk completion buffer dan worker pool
//!
//! Run dengan: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netkit::client::{CompletionBuffer, RoundOutcome, DEFAULT_CAPACITY};
use netkit::{Encoding, WorkerPool};

fn bench_completion_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("completion_buffer");
    let chunk = [b'x'; DEFAULT_CAPACITY];

    // Satu round penuh
    group.throughput(Throughput::Bytes(DEFAULT_CAPACITY as u64));
    group.bench_function("single_round", |b| {
        b.iter(|| {
            let mut buf =
                CompletionBuffer::new(DEFAULT_CAPACITY, DEFAULT_CAPACITY, Encoding::Ascii).unwrap();
            buf.window().copy_from_slice(&chunk);
            black_box(buf.complete_round(DEFAULT_CAPACITY))
        });
    });

    // Beberapa round pendek lalu satu round penuh
    for short_rounds in [1usize, 4, 16].iter() {
        group.bench_function(format!("short_rounds_{}", short_rounds), |b| {
            b.iter(|| {
                let mut buf =
                    CompletionBuffer::new(DEFAULT_CAPACITY, 64, Encoding::Ascii).unwrap();
                for _ in 0..*short_rounds {
                    buf.window()[..16].copy_from_slice(&chunk[..16]);
                    assert_eq!(buf.complete_round(16), RoundOutcome::Pending);
                }
                buf.window().copy_from_slice(&chunk[..64]);
                black_box(buf.complete_round(64))
            });
        });
    }

    group.finish();
}

fn bench_worker_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_pool");
    let pool = WorkerPool::new(4).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let permit = pool.try_acquire();
            black_box(&permit);
        });
    });

    group.bench_function("execute_noop", |b| {
        b.iter(|| {
            let permit = pool.acquire().unwrap();
            pool.execute(permit, || {
                black_box(0u64);
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_completion_buffer, bench_worker_pool);
criterion_main!(benches);
