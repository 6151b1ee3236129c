//! Run with:
//!   cargo bench --bench collect_benchmark

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use heap::{Heap, HeapSettings, RootCategory, RootProvider};
use object::{HEADER_WORDS, ObjectKind, Value};

struct Roots(Vec<Value>);

impl RootProvider for Roots {
    fn visit_roots(&mut self, category: RootCategory, visitor: &mut dyn FnMut(&mut Value)) {
        if category == RootCategory::Threads {
            self.0.iter_mut().for_each(visitor);
        }
    }
}

fn settings(threads: usize) -> HeapSettings {
    HeapSettings {
        young_size: 262_144,
        young_initial_size: 262_144,
        min_young_size: 65_536,
        old_size: 1_048_576,
        old_initial_size: 1_048_576,
        parallel_gc_threads: threads,
        scavenge_before_full_gc: false,
        ..HeapSettings::default()
    }
}

/// A heap holding a linked list of `len` nodes, every other node garbage.
fn list_heap(threads: usize, len: usize) -> (Heap, Roots) {
    let mut heap = Heap::new(settings(threads)).expect("bench settings are valid");
    let mut roots = Roots(Vec::new());
    let node = heap
        .define_klass(ObjectKind::Instance, HEADER_WORDS + 2, Value::NULL, &mut roots)
        .expect("perm has room");
    let head = heap.allocate_instance(node, &mut roots).expect("young has room");
    roots.0.push(head);
    let mut tail = head;
    for _ in 0..len {
        heap.allocate_instance(node, &mut roots).expect("young has room");
        let next = heap.allocate_instance(node, &mut roots).expect("young has room");
        heap.store_field(tail, HEADER_WORDS, next);
        tail = next;
    }
    (heap, roots)
}

fn bench_scavenge(c: &mut Criterion) {
    for threads in [1, 4] {
        c.bench_function(&format!("scavenge 10k nodes, {threads} threads"), |b| {
            b.iter_batched(
                || list_heap(threads, 10_000),
                |(mut heap, mut roots)| black_box(heap.scavenge(&mut roots)),
                BatchSize::LargeInput,
            )
        });
    }
}

fn bench_full(c: &mut Criterion) {
    for threads in [1, 4] {
        c.bench_function(&format!("full gc 10k nodes, {threads} threads"), |b| {
            b.iter_batched(
                || list_heap(threads, 10_000),
                |(mut heap, mut roots)| black_box(heap.collect_full(false, true, &mut roots)),
                BatchSize::LargeInput,
            )
        });
    }
}

criterion_group!(benches, bench_scavenge, bench_full);
criterion_main!(benches);
