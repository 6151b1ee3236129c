use std::process;

use clap::Parser as ClapParser;
use heap::{GcCause, Heap, HeapError, HeapSettings, RootCategory, RootProvider};
use object::{HEADER_WORDS, ObjectKind, ReferenceType, Value};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Churns a generational heap with a random object graph and reports what
/// the collectors did.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of objects to allocate
    #[arg(long, default_value_t = 500_000)]
    allocations: usize,

    /// Objects kept reachable from the mutator's roots at any time
    #[arg(long, default_value_t = 4_096)]
    live: usize,

    /// Reserved young generation size in words
    #[arg(long, default_value_t = 262_144)]
    young_words: usize,

    /// Reserved old generation size in words
    #[arg(long, default_value_t = 1_048_576)]
    old_words: usize,

    /// Parallel collector threads (defaults to the available cores, at most 8)
    #[arg(long)]
    threads: Option<usize>,

    /// Request an explicit full collection every n allocations (0 = never)
    #[arg(long, default_value_t = 0)]
    full_every: usize,

    /// Let full collections hand live eden data to the old generation
    #[arg(long)]
    absorb_eden: bool,

    /// Verify the heap before and after every collection
    #[arg(long)]
    verify: bool,

    /// Keep collecting even when full collections stop freeing memory
    #[arg(long)]
    no_gc_overhead_limit: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Root slots of the simulated mutator.
#[derive(Default)]
struct Mutator {
    slots: Vec<Value>,
    weak: Vec<Value>,
}

impl RootProvider for Mutator {
    fn visit_roots(&mut self, category: RootCategory, visitor: &mut dyn FnMut(&mut Value)) {
        if category == RootCategory::Threads {
            self.slots.iter_mut().for_each(visitor);
        }
    }

    fn visit_weak_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.weak.iter_mut().for_each(visitor);
    }
}

fn settings(cli: &Cli) -> HeapSettings {
    let defaults = HeapSettings::default();
    HeapSettings {
        young_size: cli.young_words,
        young_initial_size: cli.young_words,
        min_young_size: (cli.young_words / 4).min(defaults.min_young_size),
        old_size: cli.old_words,
        old_initial_size: cli.old_words,
        parallel_gc_threads: cli.threads.unwrap_or(defaults.parallel_gc_threads),
        use_adaptive_gc_boundary: cli.absorb_eden,
        verify_before_gc: cli.verify,
        verify_after_gc: cli.verify,
        use_gc_overhead_limit: !cli.no_gc_overhead_limit,
        ..defaults
    }
}

fn churn(cli: &Cli, heap: &mut Heap) -> Result<(), HeapError> {
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut mutator = Mutator::default();
    let node = heap.define_klass(ObjectKind::Instance, HEADER_WORDS + 2, Value::NULL, &mut mutator)?;
    let live = cli.live.max(1);

    for i in 0..cli.allocations {
        let obj = match rng.random_range(0..10) {
            0..=6 => heap.allocate_instance(node, &mut mutator)?,
            7 => {
                let len = rng.random_range(1..16);
                let array = heap.allocate_ref_array(len, &mut mutator)?;
                if let Some(&held) = mutator.slots.get(rng.random_range(0..live)) {
                    heap.array_store(array, rng.random_range(0..len), held);
                }
                array
            }
            8 => heap.allocate_word_array(rng.random_range(0..32), &mut mutator)?,
            _ => {
                let referent = mutator
                    .slots
                    .get(rng.random_range(0..live))
                    .copied()
                    .unwrap_or(Value::NULL);
                heap.allocate_reference(ReferenceType::Weak, referent, &mut mutator)?
            }
        };

        let slot = rng.random_range(0..live);
        if slot < mutator.slots.len() {
            let holder = mutator.slots[slot];
            if heap.kind_of(holder) == ObjectKind::Instance && rng.random_bool(0.5) {
                heap.store_field(holder, HEADER_WORDS + rng.random_range(0..2), obj);
            } else {
                mutator.slots[slot] = obj;
            }
        } else {
            mutator.slots.push(obj);
        }

        if rng.random_ratio(1, 64) {
            heap.identity_hash(obj);
            mutator.weak.push(obj);
            if mutator.weak.len() > live {
                mutator.weak.swap_remove(rng.random_range(0..mutator.weak.len()));
            }
        }

        if cli.full_every != 0 && (i + 1) % cli.full_every == 0 {
            let request = heap.request(GcCause::SystemGc);
            heap.collect(request, &mut mutator);
        }

        if i % 65_536 == 0 {
            let pending = heap.drain_pending_references();
            log::debug!("{i} allocations, {} references enqueued, {}", pending.len(), heap.usage());
        }
    }
    mutator.weak.retain(|value| !value.is_null());
    log::info!("{} weak roots still alive", mutator.weak.len());
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut heap = match Heap::new(settings(&cli)) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {err}");
            process::exit(2);
        }
    };

    if let Err(err) = churn(&cli, &mut heap) {
        eprintln!("Error: {err}");
        process::exit(1);
    }

    println!("{}", heap.stats());
    println!("{}", heap.usage());
    if let Some(last) = &heap.stats().last {
        println!("last: {last}");
    }
}
