// Key cache performance benchmarks: read/write hit paths, eviction under
// pressure, and concurrent readers sharing a single miss.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockcache::{CacheConfig, IoHandle, KeyCache};

/// An `IoHandle` that hands back zeroed buffers without touching the
/// filesystem, so these benchmarks measure cache-path overhead rather
/// than disk latency.
struct ZeroedIo {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl ZeroedIo {
    fn new() -> Self {
        Self {
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl IoHandle for ZeroedIo {
    fn pread(&self, _file: i32, buf: &mut [u8], _offset: u64) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        buf.fill(0);
        Ok(buf.len())
    }

    fn pwrite(&self, _file: i32, _buf: &[u8], _offset: u64) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn make_cache(block_size: usize, blocks: usize) -> KeyCache {
    let cfg = CacheConfig::builder()
        .block_size(block_size)
        .memory(blocks * (block_size + 96))
        .build();
    KeyCache::init(cfg, Arc::new(ZeroedIo::new())).unwrap()
}

fn bench_cold_miss_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_miss_fill");

    for block_count in [64usize, 512, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(block_count), &block_count, |b, &block_count| {
            b.iter(|| {
                let cache = make_cache(4096, block_count);
                let mut buf = [0u8; 4096];
                for i in 0..block_count as u64 {
                    cache.read(1, black_box(i * 4096), 0, &mut buf).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_hot_read(c: &mut Criterion) {
    let cache = make_cache(4096, 512);
    let mut buf = [0u8; 4096];
    cache.read(1, 0, 0, &mut buf).unwrap();

    c.bench_function("hot_read", |b| {
        b.iter(|| {
            cache.read(1, black_box(0), 0, &mut buf).unwrap();
        });
    });
}

fn bench_eviction_pressure(c: &mut Criterion) {
    c.bench_function("eviction_pressure", |b| {
        let cache = make_cache(4096, 128);
        let mut buf = [0u8; 4096];
        let mut next = 0u64;
        b.iter(|| {
            cache.read(1, black_box(next * 4096), 0, &mut buf).unwrap();
            next = (next + 1) % 4096;
        });
    });
}

fn bench_buffered_write(c: &mut Criterion) {
    let cache = make_cache(4096, 512);
    let data = vec![7u8; 4096];

    c.bench_function("buffered_write", |b| {
        b.iter(|| {
            cache.write(1, black_box(0), 0, &data, true).unwrap();
        });
    });
}

fn bench_concurrent_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_readers");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                let cache = Arc::new(make_cache(4096, 256));
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let cache = cache.clone();
                            std::thread::spawn(move || {
                                let mut buf = [0u8; 4096];
                                for i in 0..32u64 {
                                    cache.read(1, i * 4096, 0, &mut buf).unwrap();
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cold_miss_fill,
    bench_hot_read,
    bench_eviction_pressure,
    bench_buffered_write,
    bench_concurrent_readers
);
criterion_main!(benches);
