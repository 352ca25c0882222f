// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the SQLite-backed queue.
//!
//! Measures:
//! - Enqueue latency at different payload sizes
//! - Dequeue + ack throughput for one consumer
//! - Compaction pass cost, with and without a file rebuild

use std::{hint::black_box, sync::Arc};

use burrow_common_storage_queue::{
    CompactionConfig, Compactor, Queue, RawCodec, Store, StoreConfig,
};
use bytes::Bytes;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Payload sizes to benchmark (bytes)
const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096];

/// Records per iteration for throughput and compaction benchmarks
const BATCH_SIZE: u64 = 1_000;

struct Fixture {
    _dir:  TempDir,
    store: Arc<Store>,
    queue: Queue<Bytes, RawCodec>,
}

fn runtime() -> Runtime { Runtime::new().unwrap() }

fn fixture(rt: &Runtime) -> Fixture {
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            Store::open(StoreConfig::at(dir.path().join("bench.db")))
                .await
                .unwrap(),
        );
        let queue = Queue::open(store.clone(), "bench", RawCodec).await.unwrap();
        Fixture {
            _dir: dir,
            store,
            queue,
        }
    })
}

fn filled(rt: &Runtime, acked_by: Option<&str>) -> Fixture {
    let f = fixture(rt);
    rt.block_on(async {
        let payload = Bytes::from(vec![0xABu8; 256]);
        for _ in 0..BATCH_SIZE {
            f.queue.enqueue(&payload).await.unwrap();
        }
        if let Some(consumer) = acked_by {
            for _ in 0..BATCH_SIZE {
                f.queue.dequeue(consumer).await.unwrap().ack().await.unwrap();
            }
        }
    });
    f
}

fn bench_enqueue_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_latency");
    group.sample_size(50);

    for &size in MESSAGE_SIZES {
        let f = fixture(&rt);
        let payload = Bytes::from(vec![0xABu8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| rt.block_on(f.queue.enqueue(black_box(payload))).unwrap());
        });
    }

    group.finish();
}

fn bench_dequeue_ack_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dequeue_ack_throughput");
    group.sample_size(10);
    group.throughput(Throughput::Elements(BATCH_SIZE));

    group.bench_function("drain", |b| {
        b.iter_batched(
            || filled(&rt, None),
            |f| {
                rt.block_on(async {
                    for _ in 0..BATCH_SIZE {
                        let delivered = f.queue.dequeue("reader").await.unwrap();
                        black_box(delivered.value());
                        delivered.ack().await.unwrap();
                    }
                });
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    for rebuild_every in [0u32, 1] {
        let name = if rebuild_every == 0 { "reset" } else { "reset_and_rebuild" };
        group.bench_function(name, |b| {
            b.iter_batched(
                || {
                    let f = filled(&rt, Some("reader"));
                    let config = CompactionConfig::builder()
                        .rebuild_every(rebuild_every)
                        .build();
                    let compactor = Compactor::new(f.store.clone(), config);
                    (f, compactor)
                },
                |(_f, compactor)| {
                    let report = rt.block_on(compactor.compact()).unwrap();
                    black_box(report);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_latency,
    bench_dequeue_ack_throughput,
    bench_compaction,
);

criterion_main!(benches);
