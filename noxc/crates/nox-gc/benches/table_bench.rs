use criterion::{criterion_group, criterion_main, Criterion};
use nox_gc::{Heap, Table, Value};

fn table_insert_lookup(c: &mut Criterion) {
    c.bench_function("table insert+lookup 1000 keys", |b| {
        b.iter(|| {
            let mut heap = Heap::new();
            let mut table = Table::new();
            let keys: Vec<_> = (0..1000)
                .map(|i| {
                    let name = format!("key_{i}");
                    heap.alloc_string(name.clone().into_bytes().into_boxed_slice(), nox_gc::table::hash_bytes(name.as_bytes()))
                })
                .collect();
            for (i, key) in keys.iter().enumerate() {
                table.set(*key, Value::Number(i as f64));
            }
            for key in &keys {
                std::hint::black_box(table.get(*key));
            }
        });
    });
}

criterion_group!(benches, table_insert_lookup);
criterion_main!(benches);
