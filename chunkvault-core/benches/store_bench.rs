//! Criterion benchmarks for the chunk store write and read paths.
//!
//! Benchmarks:
//! 1. Incremental append onto a long history vs full rewrite of it
//! 2. Range query over the whole history
//! 3. Chunk codec encode/decode

use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use chunkvault_core::data::{decode, encode};
use chunkvault_core::{ChunkStore, Frame, PipelineConfig, Row};
use tempfile::TempDir;
use tokio::runtime::Runtime;

// ── Helpers ──────────────────────────────────────────────────────────

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 2, 14, 30, 0).unwrap()
}

fn make_bars(start: usize, n: usize) -> Frame {
    (start..start + n)
        .map(|i| {
            let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            Row::new(base() + Duration::minutes(i as i64))
                .with("open", close - 0.3)
                .with("high", close + 1.5)
                .with("low", close - 1.5)
                .with("close", close)
                .with("volume", 1_000_000.0 + (i % 500_000) as f64)
        })
        .collect()
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn seeded_store(rt: &Runtime, history: usize) -> (TempDir, ChunkStore) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig::new(dir.path().to_string_lossy()).with_chunk_size(1_000);
    let store = ChunkStore::open(cfg).unwrap();
    rt.block_on(store.full_rewrite(make_bars(0, history))).unwrap();
    (dir, store)
}

// ── Benchmarks ───────────────────────────────────────────────────────

fn bench_write_paths(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("write_path");
    group.sample_size(10);

    for history in [1_000usize, 10_000] {
        let fresh = make_bars(history, 60);

        group.bench_with_input(BenchmarkId::new("incremental_append", history), &history, |b, &h| {
            b.iter_batched(
                || seeded_store(&rt, h),
                |(_dir, store)| rt.block_on(store.incremental_append(black_box(fresh.clone()))),
                BatchSize::PerIteration,
            )
        });

        group.bench_with_input(BenchmarkId::new("full_rewrite", history), &history, |b, &h| {
            b.iter_batched(
                || seeded_store(&rt, h),
                |(_dir, store)| rt.block_on(store.full_rewrite(black_box(fresh.clone()))),
                BatchSize::PerIteration,
            )
        });
    }
    group.finish();
}

fn bench_read_range(c: &mut Criterion) {
    let rt = runtime();
    let (_dir, store) = seeded_store(&rt, 10_000);
    c.bench_function("read_all_10k", |b| {
        b.iter(|| rt.block_on(store.read_all()).unwrap())
    });
}

fn bench_codec(c: &mut Criterion) {
    let frame = make_bars(0, 1_000);
    let text = encode(&frame).unwrap();
    c.bench_function("encode_1k", |b| b.iter(|| encode(black_box(&frame)).unwrap()));
    c.bench_function("decode_1k", |b| b.iter(|| decode(black_box(&text)).unwrap()));
}

criterion_group!(benches, bench_write_paths, bench_read_range, bench_codec);
criterion_main!(benches);
