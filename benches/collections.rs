use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use opal::{BackendOptions, ClassSpec, Store};

#[derive(Debug, Clone, Default, PartialEq)]
struct Sample {
    id: u64,
    value: i64,
    weight: f64,
}

fn sample_store() -> Store {
    let mut store =
        Store::open_in_memory(BackendOptions::with_map_size_mb(64)).expect("open store");
    store
        .register(
            ClassSpec::<Sample>::new("Sample")
                .object_id(|s| s.id, |s, id| s.id = id)
                .scalar("value", |s: &Sample| s.value, |s, v| s.value = v)
                .scalar("weight", |s: &Sample| s.weight, |s, v| s.weight = v),
        )
        .expect("register Sample");
    store
}

fn bench_put_objects(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_objects");
    for count in [100u64, 1_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let store = sample_store();
                let mut txn = store.begin_write().unwrap();
                for i in 0..count {
                    let mut sample = Sample {
                        id: 0,
                        value: i as i64,
                        weight: i as f64 * 0.5,
                    };
                    txn.put_object(&mut sample).unwrap();
                }
                txn.commit().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_value_collection_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_collection");
    for count in [1_000usize, 10_000] {
        let values: Vec<u32> = (0..count as u32).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(count),
            &values,
            |b, values| {
                let store = sample_store();
                b.iter(|| {
                    let mut txn = store.begin_write().unwrap();
                    let id = txn.put_value_collection(black_box(values)).unwrap();
                    txn.commit().unwrap();

                    let txn = store.begin_read().unwrap();
                    let back = txn.get_value_collection::<u32>(id).unwrap();
                    black_box(back);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_put_objects, bench_value_collection_roundtrip);
criterion_main!(benches);
