//! The boundary to the managed runtime.
//!
//! Everything the profiler needs from the VM — method metadata, weak
//! references for liveness testing, heap figures, thread names — comes
//! through [`ManagedRuntime`], so the core stays independent of any
//! particular runtime's native interface. [`MockRuntime`] is the in-process
//! stand-in used by the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::os;

/// Opaque handle to a managed method, stable for the runtime's lifetime.
pub type MethodRef = u64;

/// Opaque handle to a managed object at a sampling site.
pub type ObjectRef = u64;

/// A weak reference issued by the runtime; does not keep its referent
/// alive, testable for liveness after each GC.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct WeakRef(pub u64);

#[derive(Debug, Clone, Default)]
pub struct ResolvedMethod {
    /// Slash-separated class name, empty for classless code.
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    pub modifiers: u32,
    /// `(start_bci, line)` pairs ordered by bci.
    pub line_numbers: Vec<(u32, u32)>,
    /// Whether this frame is a thread entry point (a main method or the
    /// root run method), used to mark complete stack traces.
    pub is_entry: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    pub args: Option<String>,
    pub flags: Option<String>,
    pub command: Option<String>,
    pub properties: Vec<(String, String)>,
    pub start_time_millis: u64,
    pub pid: u32,
}

pub trait ManagedRuntime: Send + Sync {
    /// Runtime feature version; subsystems gate themselves on it.
    fn version(&self) -> u32;

    fn available_processors(&self) -> i32 {
        os::available_processors()
    }

    /// `None` when the runtime cannot report a heap bound.
    fn max_heap(&self) -> Option<u64>;

    fn heap_used(&self) -> u64;

    /// Heap usage at the end of the last collection; `None` when the
    /// runtime cannot report it and the caller must snapshot on GC.
    fn used_at_last_gc(&self) -> Option<u64>;

    /// `None` when the reference could not be created (e.g. out of
    /// handles); the sample is then dropped.
    fn create_weak_ref(&self, object: ObjectRef) -> Option<WeakRef>;

    /// True once the referent has been collected.
    fn is_dead(&self, weak: &WeakRef) -> bool;

    fn release_weak(&self, weak: WeakRef);

    /// Materializes a local reference long enough to read the referent's
    /// class name; `None` if the referent is gone.
    fn class_name_of(&self, weak: &WeakRef) -> Option<String>;

    fn resolve_method(&self, method: MethodRef) -> Option<ResolvedMethod>;

    /// `(name, runtime thread id)` for a tid, if the runtime knows it.
    fn thread_info(&self, tid: i32) -> Option<(String, u64)>;

    fn runtime_info(&self) -> RuntimeInfo;
}

#[derive(Default)]
struct MockObject {
    class_name: String,
    alive: bool,
}

/// A scriptable runtime for tests: objects are registered, "collected" by
/// [`MockRuntime::kill`], and methods resolved from a fixed table.
#[derive(Default)]
pub struct MockRuntime {
    pub version: u32,
    pub max_heap: Option<u64>,
    pub heap_used: AtomicU64,
    pub last_gc_supported: bool,
    objects: Mutex<HashMap<u64, MockObject>>,
    methods: Mutex<HashMap<MethodRef, ResolvedMethod>>,
    threads: Mutex<HashMap<i32, (String, u64)>>,
    next_ref: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        MockRuntime {
            version: 17,
            max_heap: Some(1 << 30),
            last_gc_supported: false,
            ..Default::default()
        }
    }

    pub fn register_object(&self, class_name: &str) -> ObjectRef {
        let id = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        self.objects.lock().unwrap().insert(
            id,
            MockObject {
                class_name: class_name.to_string(),
                alive: true,
            },
        );
        id
    }

    /// Simulate the referent being collected.
    pub fn kill(&self, object: ObjectRef) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(&object) {
            obj.alive = false;
        }
    }

    pub fn register_method(&self, method: MethodRef, resolved: ResolvedMethod) {
        self.methods.lock().unwrap().insert(method, resolved);
    }

    pub fn register_thread(&self, tid: i32, name: &str, runtime_id: u64) {
        self.threads
            .lock()
            .unwrap()
            .insert(tid, (name.to_string(), runtime_id));
    }
}

impl ManagedRuntime for MockRuntime {
    fn version(&self) -> u32 {
        self.version
    }

    fn max_heap(&self) -> Option<u64> {
        self.max_heap
    }

    fn heap_used(&self) -> u64 {
        self.heap_used.load(Ordering::Relaxed)
    }

    fn used_at_last_gc(&self) -> Option<u64> {
        if self.last_gc_supported {
            Some(self.heap_used.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn create_weak_ref(&self, object: ObjectRef) -> Option<WeakRef> {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&object)
            .then_some(WeakRef(object))
    }

    fn is_dead(&self, weak: &WeakRef) -> bool {
        self.objects
            .lock()
            .unwrap()
            .get(&weak.0)
            .map(|obj| !obj.alive)
            .unwrap_or(true)
    }

    fn release_weak(&self, _weak: WeakRef) {}

    fn class_name_of(&self, weak: &WeakRef) -> Option<String> {
        let objects = self.objects.lock().unwrap();
        let obj = objects.get(&weak.0)?;
        obj.alive.then(|| obj.class_name.clone())
    }

    fn resolve_method(&self, method: MethodRef) -> Option<ResolvedMethod> {
        self.methods.lock().unwrap().get(&method).cloned()
    }

    fn thread_info(&self, tid: i32) -> Option<(String, u64)> {
        self.threads.lock().unwrap().get(&tid).cloned()
    }

    fn runtime_info(&self) -> RuntimeInfo {
        RuntimeInfo {
            name: "MockVM".to_string(),
            version: "17.0".to_string(),
            command: Some("mock-app".to_string()),
            properties: vec![("vm.flavor".to_string(), "mock".to_string())],
            pid: std::process::id(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_weak_ref_lifecycle() {
        let runtime = MockRuntime::new();
        let obj = runtime.register_object("com/example/Widget");
        let weak = runtime.create_weak_ref(obj).unwrap();
        assert!(!runtime.is_dead(&weak));
        assert_eq!(
            runtime.class_name_of(&weak).as_deref(),
            Some("com/example/Widget")
        );

        runtime.kill(obj);
        assert!(runtime.is_dead(&weak));
        assert!(runtime.class_name_of(&weak).is_none());
    }

    #[test]
    fn test_mock_method_resolution() {
        let runtime = MockRuntime::new();
        runtime.register_method(
            100,
            ResolvedMethod {
                class_name: "com/example/Main".to_string(),
                method_name: "main".to_string(),
                signature: "([Ljava/lang/String;)V".to_string(),
                modifiers: 0x9,
                is_entry: true,
                ..Default::default()
            },
        );
        assert!(runtime.resolve_method(100).unwrap().is_entry);
        assert!(runtime.resolve_method(101).is_none());
    }
}
