//! Index tree and commit benchmarks.
//!
//! Measures point lookups against saved trees, in-memory inserts, bulk
//! building, the cost of keep versus flatten saves, and end-to-end commits
//! through the merge worker.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, sync::Arc, time::Duration};

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fbdb_store::{
    Database, DatabaseConfig, Fbtree, FbtreeBuilder, IndexSchema, IxSpec, RecordKey, SaveStrategy,
    Schema, Store, TreeConfig, TreeContext,
};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn context() -> TreeContext {
    TreeContext::new(Arc::new(Store::in_memory()), Arc::new(RecordKey), TreeConfig::default())
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

/// Builds a saved tree of `count` keys with the bulk builder.
fn built_tree(ctx: &TreeContext, count: usize) -> Fbtree {
    let mut b = FbtreeBuilder::new(ctx.clone(), IxSpec::default());
    for i in 0..count {
        let k = key(i);
        let off = ctx.store.save_sized(&k).expect("save record");
        b.add(&k, off).expect("add");
    }
    b.finish().expect("finish")
}

// =============================================================================
// Lookups
// =============================================================================

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("fbtree/search");
    group.throughput(Throughput::Elements(1));

    for count in [1_000, 10_000, 100_000] {
        let ctx = context();
        let tree = built_tree(&ctx, count);
        group.bench_with_input(
            BenchmarkId::new("built", format!("{}k", count / 1000)),
            &count,
            |b, &count| {
                let mut i = 0usize;
                b.iter(|| {
                    i = (i + 7919) % count;
                    black_box(tree.search(&key(i)).expect("search"))
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// Inserts and saves
// =============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("fbtree/insert");

    for count in [100, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        let ctx = context();
        let base = built_tree(&ctx, 10_000);
        let offs: Vec<(Vec<u8>, u64)> = (0..count)
            .map(|i| {
                let k = format!("key-{:08}x", i * 10_000 / count).into_bytes();
                let off = ctx.store.save_sized(&k).expect("save record");
                (k, off)
            })
            .collect();
        group.bench_with_input(BenchmarkId::new("into_10k", count), &offs, |b, offs| {
            b.iter(|| {
                let t = base
                    .update(|t| {
                        for (k, off) in offs {
                            t.insert(k, *off)?;
                        }
                        Ok(())
                    })
                    .expect("update");
                black_box(t)
            });
        });
    }

    group.finish();
}

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("fbtree/save");
    let ctx = context();
    let base = built_tree(&ctx, 10_000);
    let updated = base
        .update(|t| {
            for i in (0..10_000).step_by(250) {
                let k = format!("key-{i:08}x").into_bytes();
                let off = t.context().store.save_sized(&k)?;
                t.insert(&k, off)?;
            }
            Ok(())
        })
        .expect("update");

    for (name, strategy) in [("keep", SaveStrategy::Keep), ("flatten", SaveStrategy::Flatten)] {
        group.bench_function(name, |b| {
            b.iter(|| black_box(updated.save_with(strategy).expect("save")));
        });
    }

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("fbtree/build");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("10k", |b| {
        b.iter_batched(context, |ctx| black_box(built_tree(&ctx, 10_000)), BatchSize::LargeInput);
    });
    group.finish();
}

// =============================================================================
// Commits
// =============================================================================

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("db/commit");
    group.throughput(Throughput::Elements(1));

    let temp_dir = TempDir::new().expect("create temp dir");
    let config = DatabaseConfig::builder().sync_on_checkpoint(false).build();
    let db = Database::create(temp_dir.path().join("bench.fbdb"), config).expect("create");
    let mut tran = db.update();
    tran.create_table(Schema::builder().table("t").indexes(vec![IndexSchema::key([0])]).build())
        .expect("create table");
    tran.commit().expect("commit");

    group.bench_function("one_row", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            let mut tran = db.update();
            tran.output("t", &key(i)).expect("output");
            tran.commit().expect("commit");
        });
    });

    group.finish();
}

criterion_group! {
    name = tree_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_search, bench_insert, bench_save, bench_build
}

criterion_group! {
    name = commit_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_commit
}

criterion_main!(tree_benches, commit_benches);
