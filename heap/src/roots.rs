use object::Value;

/// Root groups the runtime enumerates at a safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootCategory {
    /// VM-global handles and object tables.
    Handles,
    /// Thread stacks and thread-local handles.
    Threads,
    /// Monitor and other synchronization metadata.
    Synchronizer,
    Profiler,
    Management,
    Debugger,
    /// Loaded-klass tables.
    SystemDictionary,
    /// References embedded in compiled code.
    CodeCache,
}

impl RootCategory {
    pub const ALL: [RootCategory; 8] = [
        RootCategory::Handles,
        RootCategory::Threads,
        RootCategory::Synchronizer,
        RootCategory::Profiler,
        RootCategory::Management,
        RootCategory::Debugger,
        RootCategory::SystemDictionary,
        RootCategory::CodeCache,
    ];
}

/// Consumers implement this to provide GC roots.
///
/// Called at safepoints, once per [`RootCategory`]. The visitor receives
/// `&mut Value` so the collector can update root pointers in place after
/// relocating objects.
pub trait RootProvider {
    fn visit_roots(&mut self, category: RootCategory, visitor: &mut dyn FnMut(&mut Value));

    /// Roots that do not keep their referent alive. The collector clears
    /// them when the referent dies and updates them otherwise.
    fn visit_weak_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}

    /// Drops table entries (interned strings, symbols, klasses) whose object
    /// is dead. Returns whether any klass was purged.
    fn unlink_dead(&mut self, _is_alive: &dyn Fn(Value) -> bool) -> bool {
        false
    }

    /// Unloads compiled code that embeds dead objects. `purged_klass` tells
    /// whether [`unlink_dead`](RootProvider::unlink_dead) removed a klass.
    fn unload_code(&mut self, _is_alive: &dyn Fn(Value) -> bool, _purged_klass: bool) {}
}

/// A flat list of strong handles.
impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, category: RootCategory, visitor: &mut dyn FnMut(&mut Value)) {
        if category == RootCategory::Handles {
            for root in self.iter_mut() {
                visitor(root);
            }
        }
    }
}

/// Reads every strong root of every category into one list.
pub fn snapshot_roots(provider: &mut dyn RootProvider, into: &mut Vec<Value>) {
    for category in RootCategory::ALL {
        provider.visit_roots(category, &mut |root| {
            if root.is_heap_ref() {
                into.push(*root);
            }
        });
    }
}

/// Splits `roots` into `workers` chunks whose sizes differ by at most one.
pub fn distribute(roots: Vec<Value>, workers: usize) -> Vec<Vec<Value>> {
    let len = roots.len();
    let mut iter = roots.into_iter();
    (0..workers)
        .map(|i| {
            let count = len / workers + if i < len % workers { 1 } else { 0 };
            iter.by_ref().take(count).collect()
        })
        .collect()
}
