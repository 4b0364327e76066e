//! ChunkBuffer throughput: small write/read cycles (single-chunk retention)
//! and large writes spanning many chunks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use edgepoll_core::{ChunkBuffer, ChunkPool};
use std::sync::Arc;

fn small_cycles(c: &mut Criterion) {
    let pool = Arc::new(ChunkPool::new());
    let mut buf = ChunkBuffer::with_pool(pool);
    let src = [0x5au8; 256];
    let mut dst = [0u8; 256];

    let mut group = c.benchmark_group("small_cycle");
    group.throughput(Throughput::Bytes(src.len() as u64));
    group.bench_function("write_read_256", |b| {
        b.iter(|| {
            buf.write(black_box(&src));
            black_box(buf.read(&mut dst));
        })
    });
    group.finish();
}

fn large_writes(c: &mut Criterion) {
    let pool = Arc::new(ChunkPool::new());
    let mut group = c.benchmark_group("large_write");

    for size in [16 * 1024usize, 64 * 1024, 256 * 1024] {
        let src = vec![0xa5u8; size];
        let mut dst = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut buf = ChunkBuffer::with_pool(pool.clone());
            b.iter(|| {
                buf.write(black_box(&src));
                black_box(buf.read(&mut dst));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, small_cycles, large_writes);
criterion_main!(benches);
