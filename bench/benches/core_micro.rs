//! Micro-benchmarks of the hot paths: node-array mutation and search,
//! column tree operations, the changeset codec, and the merge engine.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use tide_bench::{random_changeset, rng};
use tide_engine::store::array::{Array, ArrayKind, Cond};
use tide_engine::store::{IntColumn, SlabAlloc};
use tide_engine::sync::{encode_changeset, parse_changeset, Transformer};

fn array_append(c: &mut Criterion) {
    c.bench_function("array_append_10k", |b| {
        b.iter(|| {
            let alloc = std::rc::Rc::new(SlabAlloc::new(8));
            let mut arr = Array::new(alloc, ArrayKind::Leaf).unwrap();
            for i in 0..10_000i64 {
                arr.add(black_box(i & 0x7F)).unwrap();
            }
            arr.len()
        })
    });
}

fn array_find(c: &mut Criterion) {
    let alloc = std::rc::Rc::new(SlabAlloc::new(8));
    let mut arr = Array::new(alloc, ArrayKind::Leaf).unwrap();
    for i in 0..10_000i64 {
        arr.add(i % 100).unwrap();
    }
    c.bench_function("array_find_eq_narrow", |b| {
        b.iter(|| arr.find_first(Cond::Eq, black_box(99), 0, usize::MAX))
    });
    c.bench_function("array_sum", |b| b.iter(|| arr.sum(0, usize::MAX)));
}

fn column_tree_ops(c: &mut Criterion) {
    c.bench_function("int_column_grow_5k", |b| {
        b.iter(|| {
            let mut col = IntColumn::new(std::rc::Rc::new(SlabAlloc::new(8))).unwrap();
            for i in 0..5_000i64 {
                col.add(black_box(i)).unwrap();
            }
            col.len()
        })
    });

    let mut col = IntColumn::new(std::rc::Rc::new(SlabAlloc::new(8))).unwrap();
    let mut gen = rng(11);
    for _ in 0..5_000 {
        col.add(gen.gen_range(-1_000..1_000)).unwrap();
    }
    c.bench_function("int_column_point_reads", |b| {
        let mut gen = rng(12);
        b.iter(|| {
            let ndx = gen.gen_range(0..col.len());
            black_box(col.get(ndx))
        })
    });
}

fn changeset_codec(c: &mut Criterion) {
    let cs = random_changeset(500, 50, 1, 1_000, 21);
    let bytes = encode_changeset(&cs);
    c.bench_function("changeset_encode_500", |b| b.iter(|| encode_changeset(&cs)));
    c.bench_function("changeset_parse_500", |b| {
        b.iter(|| parse_changeset(black_box(&bytes)).unwrap())
    });
}

fn merge_transform(c: &mut Criterion) {
    c.bench_function("transform_200_vs_200", |b| {
        b.iter_batched(
            || {
                (
                    random_changeset(200, 40, 1, 100, 31),
                    random_changeset(200, 40, 2, 200, 32),
                )
            },
            |(mut local, mut incoming)| {
                Transformer::transform_pair(&mut local, &mut incoming).unwrap();
                (local.len(), incoming.len())
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    array_append,
    array_find,
    column_tree_ops,
    changeset_codec,
    merge_transform
);
criterion_main!(benches);
