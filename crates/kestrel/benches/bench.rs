use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use kestrel::{Config, KestrelId, KeySet, Kestrel, MemoryStore, NodeAddr, decode};
use std::time::Instant;
use tokio::runtime::Builder;

// IDs per allocation. Stays below the sequence ceiling so the counter can be
// rewound between iterations without tripping the wraparound lock.
const BATCH: usize = 1024;

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("id");
    group.throughput(Throughput::Elements(BATCH as u64));

    group.bench_function(format!("pack/elems/{BATCH}"), |b| {
        b.iter(|| {
            for seq in 0..BATCH as u64 {
                black_box(KestrelId::from(black_box(1_000_000), 42, seq));
            }
        });
    });

    let raw: Vec<u64> = (0..BATCH as u64)
        .map(|seq| KestrelId::from(1_000_000, 42, seq).to_raw())
        .collect();
    group.bench_function(format!("decode/elems/{BATCH}"), |b| {
        b.iter(|| {
            for id in &raw {
                black_box(decode(*id).unwrap());
            }
        });
    });

    group.finish();
}

/// Round trips through the in-process store on one Tokio thread.
fn bench_issue(c: &mut Criterion) {
    let mut group = c.benchmark_group("issue/memory");
    group.throughput(Throughput::Elements(BATCH as u64));

    let rt = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .build()
        .unwrap();
    let store = MemoryStore::single(NodeAddr::new("127.0.0.1", 6379));
    let kestrel = rt.block_on(async {
        let config = Config::builder().shard_id(1).build_with(|_| None).unwrap();
        Kestrel::connect_with(config, store.connector()).await.unwrap()
    });
    let sequence = KeySet::default().sequence;

    group.bench_function(format!("batch/elems/{BATCH}"), |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let kestrel = kestrel.clone();
            let store = store.clone();
            let sequence = sequence.clone();
            async move {
                let start = Instant::now();
                for _ in 0..iters {
                    store.set(&sequence, 0);
                    let ids = kestrel.issue(BATCH).await.unwrap();
                    black_box(ids);
                }
                start.elapsed()
            }
        });
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("single/elems/1", |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let kestrel = kestrel.clone();
            let store = store.clone();
            let sequence = sequence.clone();
            async move {
                let start = Instant::now();
                for _ in 0..iters {
                    store.set(&sequence, 0);
                    black_box(kestrel.issue_one().await.unwrap());
                }
                start.elapsed()
            }
        });
    });

    group.finish();
    rt.block_on(kestrel.close());
}

criterion_group!(benches, bench_pack, bench_issue);
criterion_main!(benches);
