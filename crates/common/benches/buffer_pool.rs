//! Buffer pool benchmarks
//!
//! Compares the pooled acquire/release cycle used by the read workers with
//! a fresh allocation per report.
//!
//! Run with: `cargo bench -p common --bench buffer_pool`

use common::{BufferPool, InputQueue};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use protocol::{DeviceId, Report};

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("report_buffer");

    for size in [64usize, 512] {
        let pool = BufferPool::default();
        group.bench_with_input(BenchmarkId::new("pooled", size), &size, |b, &size| {
            b.iter(|| {
                let buf = pool.acquire(black_box(size));
                pool.release(buf);
            });
        });

        group.bench_with_input(BenchmarkId::new("allocated", size), &size, |b, &size| {
            b.iter(|| {
                let buf = vec![0u8; black_box(size)];
                black_box(buf);
            });
        });
    }

    group.finish();
}

fn bench_queue_overflow(c: &mut Criterion) {
    let pool = BufferPool::default();
    let queue = InputQueue::new(64);

    c.bench_function("input_queue_push_full", |b| {
        for _ in 0..64 {
            queue.push(Report::input(DeviceId(1), pool.acquire(64)));
        }
        b.iter(|| {
            let report = Report::input(DeviceId(1), pool.acquire(64));
            if let Some(evicted) = queue.push(report) {
                pool.release(evicted.bytes);
            }
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_queue_overflow);
criterion_main!(benches);
