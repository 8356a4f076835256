use std::any::Any;
use std::sync::{Arc, RwLock};

use once_cell::sync::{Lazy, OnceCell};

use crate::runtime::Runtime;

/// Upper bound on registered frameworks; sizes the per-buffer opaque slot
/// array.
pub const MAX_FRAMEWORKS: usize = 4;

/// Index of a registered framework; keys the per-buffer private slots and
/// the per-runtime state table.
pub type FrameworkId = usize;

/// An accelerated-transport plugin.
///
/// `init` runs once per process, lazily, when the first runtime is created;
/// its handle is shared by every runtime and must be thread-safe. `create`
/// runs per runtime on that runtime's thread and may register protocols and
/// user polls; `destroy` mirrors it when the runtime goes away. `cleanup`
/// finalizes the process-wide handle.
///
/// Buffers carry one opaque slot per framework (see
/// [`BufferPool::framework_private`](crate::buffer::BufferPool::framework_private))
/// so drivers can cache e.g. memory-registration handles without the core
/// knowing their shape.
pub trait Framework: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn init(&self) -> Box<dyn Any + Send + Sync>;

    fn create(&self, runtime: &mut Runtime, handle: &(dyn Any + Send + Sync)) -> Box<dyn Any>;

    fn destroy(&self, runtime: &mut Runtime, state: Box<dyn Any>);

    fn cleanup(&self, handle: Box<dyn Any + Send + Sync>) {
        drop(handle);
    }
}

struct Registration {
    framework: Arc<dyn Framework>,
    handle: OnceCell<Box<dyn Any + Send + Sync>>,
}

static REGISTRY: Lazy<RwLock<Vec<Registration>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers a framework process-wide. Must happen before the first runtime
/// that should see it is created; the returned id indexes buffer private
/// slots.
pub fn register_framework(framework: impl Framework) -> FrameworkId {
    let mut registry = REGISTRY.write().expect("framework registry poisoned");
    assert!(
        registry.len() < MAX_FRAMEWORKS,
        "framework registry full ({MAX_FRAMEWORKS} max)"
    );
    registry.push(Registration {
        framework: Arc::new(framework),
        handle: OnceCell::new(),
    });
    registry.len() - 1
}

/// Runs `f` for every registered framework with its lazily-created
/// process-wide handle.
pub(crate) fn with_frameworks(
    mut f: impl FnMut(FrameworkId, &Arc<dyn Framework>, &(dyn Any + Send + Sync)),
) {
    let registry = REGISTRY.read().expect("framework registry poisoned");
    for (id, reg) in registry.iter().enumerate() {
        let handle = reg.handle.get_or_init(|| reg.framework.init());
        f(id, &reg.framework, handle.as_ref());
    }
}

pub(crate) fn framework(id: FrameworkId) -> Arc<dyn Framework> {
    let registry = REGISTRY.read().expect("framework registry poisoned");
    Arc::clone(&registry[id].framework)
}

/// Finalizes every framework's process-wide handle. Call at process exit,
/// after all runtimes are gone.
pub fn cleanup_frameworks() {
    let mut registry = REGISTRY.write().expect("framework registry poisoned");
    for reg in registry.iter_mut() {
        if let Some(handle) = reg.handle.take() {
            reg.framework.cleanup(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::Config;

    static INITS: AtomicUsize = AtomicUsize::new(0);
    static CREATES: AtomicUsize = AtomicUsize::new(0);
    static DESTROYS: AtomicUsize = AtomicUsize::new(0);

    struct CountingFramework;

    impl Framework for CountingFramework {
        fn name(&self) -> &'static str {
            "COUNTING"
        }

        fn init(&self) -> Box<dyn Any + Send + Sync> {
            INITS.fetch_add(1, Ordering::SeqCst);
            Box::new(7_u32)
        }

        fn create(&self, _: &mut Runtime, handle: &(dyn Any + Send + Sync)) -> Box<dyn Any> {
            assert_eq!(handle.downcast_ref::<u32>(), Some(&7));
            CREATES.fetch_add(1, Ordering::SeqCst);
            Box::new("per-runtime state")
        }

        fn destroy(&self, _: &mut Runtime, state: Box<dyn Any>) {
            assert!(state.downcast_ref::<&str>().is_some());
            DESTROYS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn init_once_create_per_runtime() {
        register_framework(CountingFramework);

        let before_creates = CREATES.load(Ordering::SeqCst);
        {
            let _a = Runtime::new(Config::default());
            let _b = Runtime::new(Config::default());
            assert!(CREATES.load(Ordering::SeqCst) >= before_creates + 2);
        }
        // One process-wide init no matter how many runtimes.
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
        assert!(DESTROYS.load(Ordering::SeqCst) >= 2);
    }
}
