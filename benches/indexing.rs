//! Index and query benchmarks over synthetic trees.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nixnav_daemon::index::IndexStore;
use nixnav_daemon::query::{execute, SearchFilter};

const FILES: usize = 50_000;

fn synthetic_store() -> IndexStore {
    let mut store = IndexStore::new();
    let bid = store.add_bookmark("bench", "/bench", false).unwrap();
    for i in 0..FILES {
        let path = format!("/bench/dir{}/project_{i}/readme_{i}.md", i % 100);
        store.insert(&path, false, i as i64, 1024, bid);
    }
    store
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert_10k_paths", |b| {
        b.iter(|| {
            let mut store = IndexStore::new();
            let bid = store.add_bookmark("bench", "/bench", false).unwrap();
            for i in 0..10_000 {
                let path = format!("/bench/src/module_{i}/file_{i}.rs");
                store.insert(black_box(&path), false, i as i64, 512, bid);
            }
            black_box(store.file_count())
        })
    });
}

fn bench_query(c: &mut Criterion) {
    let store = synthetic_store();
    let filter = SearchFilter::under("/bench");

    c.bench_function("query_substring_50k", |b| {
        b.iter(|| {
            let hits = execute(&store, black_box("readme_42"), &filter);
            black_box(hits.len())
        })
    });

    c.bench_function("query_common_substring_50k", |b| {
        b.iter(|| {
            let hits = execute(&store, black_box("readme"), &filter);
            black_box(hits.len())
        })
    });
}

criterion_group!(benches, bench_insert, bench_query);
criterion_main!(benches);
