//! Correlates allocation samples with GC outcomes.
//!
//! Each tracked sample holds a weak reference to the allocated object; a
//! GC advances an epoch, and the cleanup pass compacts the table down to
//! survivors, aging them by the number of epochs they lived through. Flush
//! emits one live-object event per survivor through the recorder's
//! external-sample path. The table never pins garbage: dead referents are
//! dropped on the first cleanup after their collection.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::call_trace::Frame;
use crate::event::{AllocEvent, ContextSnapshot, MemLeakEvent};
use crate::os;
use crate::runtime::{ManagedRuntime, ObjectRef, WeakRef};
use crate::spinlock::RwSpinLock;
use crate::tsc;

/// Hard ceiling on tracked samples regardless of heap size.
pub const MAX_TRACKING_TABLE_SIZE: usize = 512 * 1024;

/// Liveness needs weak-reference support from the runtime.
const MIN_RUNTIME_VERSION: u32 = 11;

struct TrackingEntry {
    weak: WeakRef,
    tid: i32,
    alloc: AllocEvent,
    ctx: ContextSnapshot,
    start_ticks: u64,
    age: u64,
    frames: Vec<Frame>,
}

struct Table {
    slots: Vec<UnsafeCell<Option<TrackingEntry>>>,
}

/// Where flushed survivors go; implemented by the profiler.
pub trait LivenessSink {
    fn lookup_class(&self, name: &str) -> u32;
    fn record_live_object(&self, tid: i32, frames: &[Frame], ctx: ContextSnapshot, event: MemLeakEvent);
    fn record_heap_usage(&self, used: u64, at_last_gc: bool);
}

pub struct LivenessTracker {
    runtime: Arc<dyn ManagedRuntime>,
    table_lock: RwSpinLock,
    table: UnsafeCell<Table>,
    size: AtomicUsize,
    max_cap: usize,
    sampling_interval: u64,
    record_heap_usage: bool,
    gc_epoch: AtomicU64,
    last_gc_epoch: AtomicU64,
    used_after_last_gc: AtomicU64,
    dropped: AtomicU64,
}

unsafe impl Sync for LivenessTracker {}
unsafe impl Send for LivenessTracker {}

impl LivenessTracker {
    /// Sizing follows the heap: one entry per `sampling_interval` bytes of
    /// heap, capped. A runtime that is too old or cannot report its heap
    /// size gets a disabled tracker — recording proceeds without liveness.
    pub fn new(
        runtime: Arc<dyn ManagedRuntime>,
        sampling_interval: u64,
        record_heap_usage: bool,
    ) -> Self {
        let max_cap = Self::table_capacity(&*runtime, sampling_interval);
        let cap = if max_cap == 0 {
            0
        } else {
            (max_cap / 8).max(2048).min(max_cap)
        };

        LivenessTracker {
            runtime,
            table_lock: RwSpinLock::new(),
            table: UnsafeCell::new(Table {
                slots: (0..cap).map(|_| UnsafeCell::new(None)).collect(),
            }),
            size: AtomicUsize::new(0),
            max_cap,
            sampling_interval,
            record_heap_usage,
            gc_epoch: AtomicU64::new(0),
            last_gc_epoch: AtomicU64::new(0),
            used_after_last_gc: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn table_capacity(runtime: &dyn ManagedRuntime, sampling_interval: u64) -> usize {
        if sampling_interval == 0 {
            return 0;
        }
        if runtime.version() < MIN_RUNTIME_VERSION {
            warn!("liveness tracking requires runtime version {MIN_RUNTIME_VERSION}+, disabling");
            return 0;
        }
        let max_heap = match runtime.max_heap() {
            Some(heap) => heap,
            None => {
                warn!("liveness tracking requires heap size information, disabling");
                return 0;
            }
        };
        let required = (max_heap / sampling_interval) as usize;
        if required > MAX_TRACKING_TABLE_SIZE {
            warn!(
                "liveness table capped at {MAX_TRACKING_TABLE_SIZE} entries, \
                 interval {sampling_interval} cannot cover the full heap"
            );
        }
        required.min(MAX_TRACKING_TABLE_SIZE)
    }

    pub fn enabled(&self) -> bool {
        self.max_cap > 0
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.table_lock.lock_shared();
        let cap = unsafe { &*self.table.get() }.slots.len();
        self.table_lock.unlock_shared();
        cap
    }

    pub fn max_capacity(&self) -> usize {
        self.max_cap
    }

    pub fn gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }

    /// Track one allocation sample. The weak reference is always consumed:
    /// either stored in the table or released on the drop paths.
    pub fn track(
        &self,
        event: AllocEvent,
        tid: i32,
        object: ObjectRef,
        frames: &[Frame],
        ctx: ContextSnapshot,
    ) {
        if !self.enabled() {
            return;
        }
        let weak = match self.runtime.create_weak_ref(object) {
            Some(weak) => weak,
            None => return,
        };

        let mut weak = Some(weak);
        let mut retried = false;
        loop {
            if !self.table_lock.try_lock_shared() {
                break;
            }

            // Safety: shared lock pins the slot vector (growth takes the
            // exclusive side); the CAS below makes the claimed index ours.
            let table = unsafe { &*self.table.get() };
            let cap = table.slots.len();
            let mut idx;
            loop {
                idx = self.size.load(Ordering::Relaxed);
                if idx >= cap {
                    break;
                }
                if self
                    .size
                    .compare_exchange(idx, idx + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }

            if idx < cap {
                let entry = TrackingEntry {
                    weak: weak.take().unwrap(),
                    tid,
                    alloc: event,
                    ctx,
                    start_ticks: tsc::ticks(),
                    age: 0,
                    frames: frames.to_vec(),
                };
                unsafe { *table.slots[idx].get() = Some(entry) };
                self.table_lock.unlock_shared();
                return;
            }

            self.table_lock.unlock_shared();

            if retried {
                debug!("cannot add sampled object to liveness table, it's overflowing");
                break;
            }
            retried = true;

            // Cleanup frees space whenever a GC ran since the last pass.
            self.cleanup_table();

            if self.capacity() < self.max_cap {
                self.table_lock.lock();
                let table = unsafe { &mut *self.table.get() };
                let newcap = (table.slots.len() * 2).min(self.max_cap);
                if newcap > table.slots.len() {
                    table.slots.resize_with(newcap, || UnsafeCell::new(None));
                    debug!("increased liveness table capacity to {newcap} entries");
                }
                self.table_lock.unlock();
            }
        }

        if let Some(weak) = weak.take() {
            self.runtime.release_weak(weak);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Called by the runtime glue after every completed collection.
    pub fn on_gc(&self) {
        self.gc_epoch.fetch_add(1, Ordering::AcqRel);
        if self.runtime.used_at_last_gc().is_none() {
            self.used_after_last_gc
                .store(self.runtime.heap_used(), Ordering::Release);
        }
    }

    /// Compact the table down to survivors. Runs at most once per GC
    /// epoch: whoever wins the CAS on `last_gc_epoch` does the work.
    pub fn cleanup_table(&self) {
        let current = self.last_gc_epoch.load(Ordering::Acquire);
        let target = self.gc_epoch.load(Ordering::Acquire);
        if target == current
            || self
                .last_gc_epoch
                .compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        let start = os::nanotime();
        self.table_lock.lock();

        let epoch_diff = target - current;
        let table = unsafe { &mut *self.table.get() };
        let sz = self.size.load(Ordering::Relaxed);
        let mut newsz = 0;
        for i in 0..sz {
            let slot = unsafe { &mut *table.slots[i].get() };
            if let Some(mut entry) = slot.take() {
                if !self.runtime.is_dead(&entry.weak) {
                    entry.age += epoch_diff;
                    unsafe { *table.slots[newsz].get() = Some(entry) };
                    newsz += 1;
                } else {
                    self.runtime.release_weak(entry.weak);
                }
            }
        }
        self.size.store(newsz, Ordering::Relaxed);

        self.table_lock.unlock();
        let elapsed = os::nanotime() - start;
        debug!(
            "liveness cleanup took {:.2}ms ({} -> {} entries)",
            elapsed as f64 / 1e6,
            sz,
            newsz
        );
    }

    /// Emit a live-object event for every survivor. Cleans up first so as
    /// few false 'live' objects as possible make it into the recording.
    pub fn flush(&self, sink: &dyn LivenessSink, mut tracked_tids: Option<&mut Vec<i32>>) {
        if !self.enabled() {
            return;
        }
        let start = os::nanotime();
        self.cleanup_table();

        self.table_lock.lock_shared();
        let table = unsafe { &*self.table.get() };
        let sz = self.size.load(Ordering::Relaxed);
        for i in 0..sz {
            let slot = unsafe { &*table.slots[i].get() };
            let entry = match slot {
                Some(entry) => entry,
                None => continue,
            };
            // A local reference materialized just long enough to read the
            // class; referents collected since cleanup read as None.
            if let Some(class_name) = self.runtime.class_name_of(&entry.weak) {
                if let Some(tids) = tracked_tids.as_deref_mut() {
                    tids.push(entry.tid);
                }
                let event = MemLeakEvent {
                    start_ticks: entry.start_ticks,
                    age: entry.age,
                    class_id: sink.lookup_class(&class_name),
                    instance_size: entry.alloc.instance_size,
                    interval: self.sampling_interval,
                };
                sink.record_live_object(entry.tid, &entry.frames, entry.ctx, event);
            }
        }
        self.table_lock.unlock_shared();

        if self.record_heap_usage {
            let (used, at_last_gc) = match self.runtime.used_at_last_gc() {
                Some(used) if used > 0 => (used, true),
                _ => {
                    let snapshot = self.used_after_last_gc.load(Ordering::Acquire);
                    if snapshot > 0 {
                        (snapshot, false)
                    } else {
                        (self.runtime.heap_used(), false)
                    }
                }
            };
            sink.record_heap_usage(used, at_last_gc);
        }

        let elapsed = os::nanotime() - start;
        debug!("liveness flush took {:.2}ms ({sz} entries)", elapsed as f64 / 1e6);
    }

    /// Final flush at recording stop. GC notifications stay enabled — the
    /// tracker survives across recordings.
    pub fn stop(&self, sink: &dyn LivenessSink) {
        self.cleanup_table();
        self.flush(sink, None);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for LivenessTracker {
    fn drop(&mut self) {
        let sz = *self.size.get_mut();
        let table = self.table.get_mut();
        for slot in table.slots.iter_mut().take(sz) {
            if let Some(entry) = slot.get_mut().take() {
                self.runtime.release_weak(entry.weak);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        classes: crate::dictionary::Dictionary,
        events: Mutex<Vec<(i32, MemLeakEvent)>>,
        heap: Mutex<Vec<(u64, bool)>>,
    }

    impl LivenessSink for RecordingSink {
        fn lookup_class(&self, name: &str) -> u32 {
            self.classes.lookup(name)
        }
        fn record_live_object(
            &self,
            tid: i32,
            _frames: &[Frame],
            _ctx: ContextSnapshot,
            event: MemLeakEvent,
        ) {
            self.events.lock().unwrap().push((tid, event));
        }
        fn record_heap_usage(&self, used: u64, at_last_gc: bool) {
            self.heap.lock().unwrap().push((used, at_last_gc));
        }
    }

    fn tracker_with(runtime: Arc<MockRuntime>, interval: u64) -> LivenessTracker {
        LivenessTracker::new(runtime, interval, false)
    }

    fn frames() -> Vec<Frame> {
        vec![Frame {
            method_id: 1,
            bci: 0,
        }]
    }

    #[test]
    fn test_sizing_from_heap() {
        let runtime = Arc::new(MockRuntime::new());
        // 1 GiB heap, 512 KiB interval: 2048 entries required.
        let tracker = tracker_with(runtime, 512 * 1024);
        assert_eq!(tracker.max_capacity(), 2048);
        assert_eq!(tracker.capacity(), 2048);
        assert!(tracker.enabled());
    }

    #[test]
    fn test_disabled_without_heap_info() {
        let mut runtime = MockRuntime::new();
        runtime.max_heap = None;
        let tracker = tracker_with(Arc::new(runtime), 512 * 1024);
        assert!(!tracker.enabled());
        tracker.track(
            AllocEvent::default(),
            1,
            99,
            &frames(),
            ContextSnapshot::default(),
        );
        assert_eq!(tracker.size(), 0);
    }

    #[test]
    fn test_disabled_on_old_runtime() {
        let mut runtime = MockRuntime::new();
        runtime.version = 8;
        let tracker = tracker_with(Arc::new(runtime), 512 * 1024);
        assert!(!tracker.enabled());
    }

    #[test]
    fn test_cleanup_compacts_and_ages_survivors() {
        let runtime = Arc::new(MockRuntime::new());
        let tracker = tracker_with(runtime.clone(), 512 * 1024);

        let live = runtime.register_object("com/example/Live");
        let dead = runtime.register_object("com/example/Dead");
        for obj in [live, dead] {
            tracker.track(
                AllocEvent::default(),
                5,
                obj,
                &frames(),
                ContextSnapshot::default(),
            );
        }
        assert_eq!(tracker.size(), 2);

        runtime.kill(dead);
        tracker.on_gc();
        tracker.cleanup_table();

        assert_eq!(tracker.size(), 1);
        assert!(tracker.size() <= tracker.capacity());
        assert!(tracker.capacity() <= tracker.max_capacity());

        let sink = RecordingSink::default();
        tracker.flush(&sink, None);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 5);
        assert_eq!(events[0].1.age, 1);
    }

    #[test]
    fn test_cleanup_runs_once_per_epoch() {
        let runtime = Arc::new(MockRuntime::new());
        let tracker = tracker_with(runtime.clone(), 512 * 1024);
        let obj = runtime.register_object("X");
        tracker.track(
            AllocEvent::default(),
            1,
            obj,
            &frames(),
            ContextSnapshot::default(),
        );

        tracker.on_gc();
        tracker.cleanup_table();
        // Second pass in the same epoch is a no-op; age stays 1.
        tracker.cleanup_table();

        let sink = RecordingSink::default();
        tracker.flush(&sink, None);
        assert_eq!(sink.events.lock().unwrap()[0].1.age, 1);
    }

    #[test]
    fn test_flush_collects_tracked_tids() {
        let runtime = Arc::new(MockRuntime::new());
        let tracker = tracker_with(runtime.clone(), 512 * 1024);
        let obj = runtime.register_object("Y");
        tracker.track(
            AllocEvent::default(),
            42,
            obj,
            &frames(),
            ContextSnapshot::default(),
        );

        let sink = RecordingSink::default();
        let mut tids = Vec::new();
        tracker.flush(&sink, Some(&mut tids));
        assert_eq!(tids, vec![42]);
    }

    #[test]
    fn test_heap_usage_event_on_flush() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.heap_used.store(12345, Ordering::Relaxed);
        let tracker = LivenessTracker::new(runtime.clone(), 512 * 1024, true);
        tracker.on_gc();

        let sink = RecordingSink::default();
        tracker.flush(&sink, None);
        let heap = sink.heap.lock().unwrap();
        assert_eq!(heap.as_slice(), &[(12345, false)]);
    }

    #[test]
    fn test_overflow_grows_then_drops() {
        // 2 GiB heap over 512 KiB interval: max_cap 4096, initial 2048.
        let mut rt = MockRuntime::new();
        rt.max_heap = Some(2 << 30);
        let runtime = Arc::new(rt);
        let tracker = tracker_with(runtime.clone(), 512 * 1024);
        assert_eq!(tracker.capacity(), 2048);
        assert_eq!(tracker.max_capacity(), 4096);

        for i in 0..4097 {
            let obj = runtime.register_object("Z");
            tracker.track(
                AllocEvent::default(),
                i,
                obj,
                &frames(),
                ContextSnapshot::default(),
            );
        }
        // Grew once to max_cap, then the last sample was dropped.
        assert_eq!(tracker.capacity(), 4096);
        assert_eq!(tracker.size(), 4096);
        assert_eq!(tracker.dropped(), 1);
    }
}
