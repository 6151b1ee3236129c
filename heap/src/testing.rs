//! Small heaps and root sets shared by the unit tests.

use object::{HEADER_WORDS, ObjectKind, Value};

use crate::{Heap, HeapSettings, RootCategory, RootProvider};

/// First and second reference field of a [`node_klass`] instance.
pub const LEFT: usize = HEADER_WORDS;
pub const RIGHT: usize = HEADER_WORDS + 1;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// perm 4096, old 16384 and young 8192 words; survivors of 1024 words.
pub fn settings() -> HeapSettings {
    HeapSettings {
        perm_size: 4_096,
        old_size: 16_384,
        old_initial_size: 16_384,
        young_size: 8_192,
        young_initial_size: 8_192,
        min_young_size: 2_048,
        survivor_ratio: 6,
        card_size: 64,
        generation_alignment: 512,
        tlab_size: 256,
        parallel_gc_threads: 1,
        task_queue_capacity: 64,
        initial_tenuring_threshold: 7,
        max_tenuring_threshold: 15,
        scavenge_before_full_gc: false,
        use_adaptive_size_policy: false,
        use_adaptive_gc_boundary: false,
        mark_sweep_dead_ratio: 5,
        perm_mark_sweep_dead_ratio: 20,
        mark_sweep_always_compact_count: 4,
        use_gc_overhead_limit: false,
        gc_time_limit: 98,
        gc_heap_free_limit: 2,
        gc_overhead_limit_threshold: 5,
        verify_before_gc: true,
        verify_after_gc: true,
        zap_unused_heap_area: true,
    }
}

pub fn heap() -> Heap {
    heap_with(settings())
}

pub fn heap_with(settings: HeapSettings) -> Heap {
    init_logging();
    Heap::new(settings).expect("test heap settings are valid")
}

/// Instance klass with two reference fields, four words per object.
pub fn node_klass(heap: &mut Heap) -> Value {
    heap.define_klass(ObjectKind::Instance, HEADER_WORDS + 2, Value::NULL, &mut Vec::new())
        .expect("perm has room")
}

/// Strong roots reported as thread roots, plus weak roots.
#[derive(Debug, Default)]
pub struct TestRoots {
    pub strong: Vec<Value>,
    pub weak: Vec<Value>,
}

impl RootProvider for TestRoots {
    fn visit_roots(&mut self, category: RootCategory, visitor: &mut dyn FnMut(&mut Value)) {
        if category == RootCategory::Threads {
            self.strong.iter_mut().for_each(visitor);
        }
    }

    fn visit_weak_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.weak.iter_mut().for_each(visitor);
    }
}
