//! Benchmarks for triple store operations.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use degdb::identity::Identity;
use degdb::store::TripleStore;
use degdb::triple::{Triple, TriplePattern};

fn corpus(identity: &Identity, n: usize) -> Vec<Triple> {
    (0..n)
        .map(|i| {
            Triple::new(
                format!("/m/{:05}", i / 4),
                format!("/type/object/p{}", i % 4),
                format!("value {i}"),
            )
            .signed_by(identity)
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let identity = Identity::generate();
    let batch = corpus(&identity, 1_000);

    c.bench_function("insert_1k_memory", |bench| {
        bench.iter_batched(
            TripleStore::memory_only,
            |store| black_box(store.insert(&batch).unwrap().count()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_verify(c: &mut Criterion) {
    let identity = Identity::generate();
    let triple = Triple::new("/m/02mjmr", "/type/object/name", "Barack Obama").signed_by(&identity);

    c.bench_function("verify_signature", |bench| {
        bench.iter(|| black_box(triple.verify().is_ok()))
    });
}

fn bench_query(c: &mut Criterion) {
    let identity = Identity::generate();
    let store = TripleStore::memory_only();
    store.insert(&corpus(&identity, 10_000)).unwrap();

    let by_subject = TriplePattern::any().with_subject("/m/00042");
    let by_both = TriplePattern::any()
        .with_subject("/m/00042")
        .with_predicate("/type/object/p1");

    c.bench_function("query_subject_10k", |bench| {
        bench.iter(|| black_box(store.query(&by_subject)))
    });
    c.bench_function("query_subject_predicate_10k", |bench| {
        bench.iter(|| black_box(store.query(&by_both)))
    });
}

criterion_group!(benches, bench_insert, bench_verify, bench_query);
criterion_main!(benches);
