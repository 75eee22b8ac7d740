//! Pool hot-path benchmark: acquire/release cycles at varying occupancy.

use criterion::{criterion_group, criterion_main, Criterion};
use ringserv_core::pool::ConnPool;

fn dummy_fd() -> i32 {
    // Benchmarks measure slot accounting, not close(2); use an fd that
    // close() rejects cheaply.
    -1
}

fn bench_acquire_release(c: &mut Criterion) {
    c.bench_function("pool_acquire_release_empty", |b| {
        let mut pool = ConnPool::new(8192, 4096);
        b.iter(|| {
            let conn = pool.acquire(dummy_fd()).unwrap();
            pool.release(conn).unwrap();
        });
    });

    c.bench_function("pool_acquire_release_half_full", |b| {
        let mut pool = ConnPool::new(8192, 4096);
        for _ in 0..4096 {
            pool.acquire(dummy_fd()).unwrap();
        }
        b.iter(|| {
            let conn = pool.acquire(dummy_fd()).unwrap();
            pool.release(conn).unwrap();
        });
    });
}

criterion_group!(benches, bench_acquire_release);
criterion_main!(benches);
