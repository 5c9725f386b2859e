use nox_gc::table::hash_bytes;
use nox_gc::{Heap, Table, Value};
use quickcheck_macros::quickcheck;

#[quickcheck]
fn every_inserted_key_is_found(keys: Vec<String>) -> bool {
    let mut heap = Heap::new();
    let mut table = Table::new();
    let mut refs = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        let hash = hash_bytes(k.as_bytes());
        let gc = heap.alloc_string(k.clone().into_bytes().into_boxed_slice(), hash);
        table.set(gc, Value::Number(i as f64));
        refs.push((gc, i));
    }
    refs.iter().all(|(gc, i)| table.get(*gc) == Some(Value::Number(*i as f64)))
}

#[test]
fn intern_returns_identical_reference_for_equal_bytes() {
    let mut heap = Heap::new();
    let a = heap.alloc_string(b"shared".to_vec().into_boxed_slice(), hash_bytes(b"shared"));
    heap.strings.set(a, Value::Nil);
    let found = heap.strings.find_string(b"shared", hash_bytes(b"shared"));
    assert_eq!(found, Some(a));
}

#[test]
fn deleted_key_can_be_reinserted_without_growing_unboundedly() {
    let mut heap = Heap::new();
    let mut table = Table::new();
    for i in 0..64 {
        let name = format!("k{i}");
        let gc = heap.alloc_string(name.clone().into_bytes().into_boxed_slice(), hash_bytes(name.as_bytes()));
        table.set(gc, Value::Bool(true));
        table.delete(gc);
    }
    assert_eq!(table.len(), 0);
}
