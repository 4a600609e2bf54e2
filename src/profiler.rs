//! Foreground orchestration: wires the sampling engines, dictionaries,
//! context table, liveness tracker and recorder together, and exposes the
//! operations the managed-runtime glue calls into.
//!
//! There is no hidden global: the embedder builds one [`Profiler`] at
//! recording start and passes it wherever samples originate. Errors cross
//! the runtime boundary as values with human-readable messages; the
//! sampling paths themselves never fail, they drop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use thiserror::Error;

use crate::call_trace::{CallTraceStorage, Frame};
use crate::code_cache::{pack_native_handle, CodeCache, CodeCacheArray};
use crate::context::Contexts;
use crate::dictionary::Dictionary;
use crate::event::{
    AllocEvent, ContextSnapshot, EventPayload, MemLeakEvent, QueueTimeEvent, TraceRootEvent,
    WallClockEpochEvent,
};
use crate::liveness::{LivenessSink, LivenessTracker};
use crate::os;
use crate::recorder::{Recorder, RecordingEnv};
use crate::runtime::{ManagedRuntime, ObjectRef};

pub const DEFAULT_WALL_INTERVAL: u64 = 50_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("recording output file is not specified")]
    MissingFile,
    #[error("chunk size must be at least 262144 bytes, got {0}")]
    ChunkSizeTooSmall(u64),
}

#[derive(Debug, Clone)]
pub struct ProfilerArgs {
    /// Recording output file; required.
    pub file: PathBuf,
    /// Chunk rotation threshold in bytes; 0 disables size-based rotation.
    pub chunk_size: u64,
    /// Chunk rotation threshold in seconds; 0 disables time-based rotation.
    pub chunk_time: u64,
    /// Execution sampling interval in nanoseconds; 0 disables.
    pub interval: u64,
    /// Wall-clock sampling interval in nanoseconds; 0 disables.
    pub wall_interval: u64,
    /// Allocation sampling interval in bytes; negative disables.
    pub alloc_interval: i64,
    /// Lock contention threshold in nanoseconds; negative disables.
    pub lock_threshold: i64,
    /// Liveness sampling interval in bytes; 0 disables the tracker.
    pub memleak_interval: u64,
    pub record_heap_usage: bool,
    pub cpu_load: bool,
    pub system_info: bool,
    pub system_props: bool,
    pub native_libs: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for ProfilerArgs {
    fn default() -> Self {
        ProfilerArgs {
            file: PathBuf::new(),
            chunk_size: 0,
            chunk_time: 0,
            interval: 10_000_000,
            wall_interval: DEFAULT_WALL_INTERVAL,
            alloc_interval: -1,
            lock_threshold: -1,
            memleak_interval: 0,
            record_heap_usage: false,
            cpu_load: true,
            system_info: true,
            system_props: true,
            native_libs: true,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl ProfilerArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file.as_os_str().is_empty() {
            return Err(ConfigError::MissingFile);
        }
        if self.chunk_size != 0 && self.chunk_size < 262144 {
            return Err(ConfigError::ChunkSizeTooSmall(self.chunk_size));
        }
        Ok(())
    }
}

pub struct Profiler {
    args: ProfilerArgs,
    runtime: Arc<dyn ManagedRuntime>,
    native_libs: Arc<CodeCacheArray>,
    call_traces: Arc<CallTraceStorage>,
    classes: Arc<Dictionary>,
    strings: Arc<Dictionary>,
    contexts: Contexts,
    recorder: Recorder,
    liveness: LivenessTracker,
}

impl Profiler {
    /// Configuration problems surface here, before anything is touched;
    /// a constructed profiler can always start.
    pub fn new(args: ProfilerArgs, runtime: Arc<dyn ManagedRuntime>) -> Result<Self> {
        args.validate().context("invalid profiler configuration")?;

        let liveness = LivenessTracker::new(
            runtime.clone(),
            args.memleak_interval,
            args.record_heap_usage,
        );

        Ok(Profiler {
            liveness,
            runtime: runtime.clone(),
            native_libs: Arc::new(CodeCacheArray::new()),
            call_traces: Arc::new(CallTraceStorage::new()),
            classes: Arc::new(Dictionary::new()),
            strings: Arc::new(Dictionary::new()),
            contexts: Contexts::default(),
            recorder: Recorder::new(),
            args,
        })
    }

    fn recording_env(&self) -> RecordingEnv {
        RecordingEnv {
            runtime: self.runtime.clone(),
            libs: self.native_libs.clone(),
            call_traces: self.call_traces.clone(),
            classes: self.classes.clone(),
            strings: self.strings.clone(),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.recorder.start(self.recording_env(), &self.args, true)
    }

    /// Flush the liveness table into the recording, then finalize the
    /// last chunk and close the file.
    pub fn stop(&self) {
        if self.recorder.active() {
            self.liveness.stop(self);
        }
        self.recorder.stop();
    }

    /// Dump the recording to `path`. The same path flushes in place; a
    /// different path copies the finished recording there and restarts.
    pub fn dump(&self, path: &std::path::Path) -> Result<()> {
        if self.recorder.active() {
            self.liveness.flush(self, None);
        }
        self.recorder.dump(path)
    }

    /// Periodic driver, called from the embedder's timer thread: runs the
    /// CPU monitor and rotates the chunk when a threshold tripped.
    pub fn timer_tick(&self) -> Result<()> {
        if self.recorder.timer_tick(os::micros()) {
            self.recorder.flush()?;
        }
        Ok(())
    }

    pub fn active(&self) -> bool {
        self.recorder.active()
    }

    // --- sampling operations -------------------------------------------

    /// The signal-handler entry: intern the trace and write one event
    /// into a per-slot buffer. Contention drops the sample.
    pub fn record_sample(
        &self,
        tid: i32,
        frames: &[Frame],
        truncated: bool,
        payload: &EventPayload,
    ) -> bool {
        let call_trace_id = self.call_traces.put(frames, truncated);
        self.recorder.record_event(tid, call_trace_id, payload)
    }

    /// Samples arriving outside signal context (liveness flush).
    pub fn record_external_sample(
        &self,
        tid: i32,
        frames: &[Frame],
        truncated: bool,
        payload: &EventPayload,
    ) -> bool {
        let call_trace_id = self.call_traces.put(frames, truncated);
        self.recorder.record_event(tid, call_trace_id, payload)
    }

    pub fn record_trace_root(&self, tid: i32, label: &str, local_root_span_id: u64) -> bool {
        let event = TraceRootEvent {
            label: self.strings.lookup(label),
            local_root_span_id,
        };
        self.recorder.record_trace_root(tid, &event)
    }

    pub fn record_queue_time(
        &self,
        tid: i32,
        start_ticks: u64,
        end_ticks: u64,
        task: &str,
        scheduler: &str,
        origin_tid: i32,
        queue_length: u64,
    ) -> bool {
        let event = QueueTimeEvent {
            start_ticks,
            end_ticks,
            task_class: self.classes.lookup(task),
            scheduler_class: self.classes.lookup(scheduler),
            origin_tid,
            queue_length,
        };
        self.recorder.record_queue_time(tid, &event)
    }

    pub fn record_wallclock_epoch(&self, event: &WallClockEpochEvent) -> bool {
        self.recorder.record_wallclock_epoch(event)
    }

    pub fn record_log(&self, level: log::Level, message: &str) {
        // log::Level orders Error=1..Trace=5; the recording wants
        // TRACE=1..ERROR=5.
        let level = 6 - level as u32;
        self.recorder.record_log(level, message);
    }

    /// Track an allocation sample for liveness correlation and emit the
    /// allocation event itself.
    pub fn record_allocation(
        &self,
        tid: i32,
        frames: &[Frame],
        truncated: bool,
        object: ObjectRef,
        event: AllocEvent,
        in_new_tlab: bool,
    ) -> bool {
        let payload = if in_new_tlab {
            EventPayload::AllocInNewTlab(event)
        } else {
            EventPayload::AllocOutsideTlab(event)
        };
        let written = self.record_sample(tid, frames, truncated, &payload);
        self.liveness
            .track(event, tid, object, frames, self.contexts.get(tid));
        written
    }

    /// GC-finish notification from the runtime glue.
    pub fn on_gc(&self) {
        self.liveness.on_gc();
    }

    // --- context -------------------------------------------------------

    pub fn contexts(&self) -> &Contexts {
        &self.contexts
    }

    pub fn set_context(&self, tid: i32, span_id: u64, root_span_id: u64, parallelism: u32) {
        self.contexts.set(tid, span_id, root_span_id, parallelism);
    }

    pub fn clear_context(&self, tid: i32) {
        self.contexts.clear(tid);
    }

    /// Intern a label through the bounded string table; `u32::MAX` means
    /// the table is full and the label is unusable.
    pub fn lookup_string(&self, label: &str, limit: usize) -> u32 {
        self.strings.bounded_lookup(label, limit)
    }

    pub fn lookup_class(&self, name: &str) -> u32 {
        self.classes.lookup(name)
    }

    // --- native symbol tables ------------------------------------------

    /// Publish a parsed (and sorted) library symbol table; returns its
    /// index in the registry.
    pub fn add_library(&self, cache: CodeCache) -> usize {
        self.native_libs.add(cache)
    }

    pub fn native_libs(&self) -> &CodeCacheArray {
        &self.native_libs
    }

    /// Map a PC to a frame `method_id`. Always succeeds: a PC outside
    /// every known library resolves to method id 0 ("unknown").
    pub fn resolve_native_pc(&self, pc: u64) -> u64 {
        for i in 0..self.native_libs.count() {
            let cache = match self.native_libs.get(i) {
                Some(cache) => cache,
                None => break,
            };
            if cache.contains(pc) {
                let blob = cache.binary_search_index(pc);
                return pack_native_handle(i as u16, blob);
            }
        }
        0
    }

    /// The library name owning a PC, if any.
    pub fn library_name(&self, pc: u64) -> Option<&str> {
        self.native_libs.find_by_address(pc).map(|cache| cache.name())
    }

    pub fn dropped_samples(&self) -> u64 {
        self.recorder.dropped_samples() + self.liveness.dropped()
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }
}

impl LivenessSink for Profiler {
    fn lookup_class(&self, name: &str) -> u32 {
        self.classes.lookup(name)
    }

    fn record_live_object(
        &self,
        tid: i32,
        frames: &[Frame],
        _ctx: ContextSnapshot,
        event: MemLeakEvent,
    ) {
        self.record_external_sample(tid, frames, false, &EventPayload::LiveObject(event));
    }

    fn record_heap_usage(&self, used: u64, at_last_gc: bool) {
        self.recorder.record_heap_usage(used, at_last_gc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExecutionEvent, ThreadState};
    use crate::runtime::MockRuntime;
    use tempfile::TempDir;

    fn test_args(dir: &TempDir) -> ProfilerArgs {
        ProfilerArgs {
            file: dir.path().join("test.flr"),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let args = ProfilerArgs::default();
        assert!(matches!(args.validate(), Err(ConfigError::MissingFile)));
        assert!(Profiler::new(args, Arc::new(MockRuntime::new())).is_err());
    }

    #[test]
    fn test_chunk_size_floor() {
        let args = ProfilerArgs {
            file: PathBuf::from("x.flr"),
            chunk_size: 1024,
            ..Default::default()
        };
        assert!(matches!(
            args.validate(),
            Err(ConfigError::ChunkSizeTooSmall(1024))
        ));
    }

    #[test]
    fn test_sample_without_recording_is_dropped() {
        let dir = TempDir::new().unwrap();
        let profiler = Profiler::new(test_args(&dir), Arc::new(MockRuntime::new())).unwrap();
        let written = profiler.record_sample(
            1,
            &[Frame { method_id: 0, bci: 0 }],
            false,
            &EventPayload::Execution(ExecutionEvent {
                thread_state: ThreadState::Runnable,
                weight: 1,
                context: ContextSnapshot::default(),
            }),
        );
        assert!(!written);
        assert_eq!(profiler.dropped_samples(), 1);
    }

    #[test]
    fn test_start_stop_produces_file() {
        let dir = TempDir::new().unwrap();
        let args = test_args(&dir);
        let file = args.file.clone();
        let profiler = Profiler::new(args, Arc::new(MockRuntime::new())).unwrap();
        profiler.start().unwrap();
        assert!(profiler.active());
        profiler.stop();
        assert!(!profiler.active());

        let data = std::fs::read(&file).unwrap();
        assert!(data.len() > 68);
        assert_eq!(&data[0..4], b"FLR\0");
    }

    #[test]
    fn test_double_start_fails() {
        let dir = TempDir::new().unwrap();
        let profiler = Profiler::new(test_args(&dir), Arc::new(MockRuntime::new())).unwrap();
        profiler.start().unwrap();
        assert!(profiler.start().is_err());
        profiler.stop();
    }

    #[test]
    fn test_resolve_native_pc() {
        let dir = TempDir::new().unwrap();
        let profiler = Profiler::new(test_args(&dir), Arc::new(MockRuntime::new())).unwrap();

        let mut cache = CodeCache::new("libfoo.so", 0);
        cache.add(0x1000, 0x100, "foo", false);
        cache.add(0x1100, 0x100, "bar", false);
        cache.sort();
        profiler.add_library(cache);

        let foo = profiler.resolve_native_pc(0x10ff);
        let bar = profiler.resolve_native_pc(0x1100);
        assert_ne!(foo, bar);
        assert_eq!(profiler.library_name(0x1050), Some("libfoo.so"));

        // Beyond the library bounds nothing resolves.
        assert_eq!(profiler.resolve_native_pc(0x1200), 0);
        assert_eq!(profiler.library_name(0x1200), None);
    }

    #[test]
    fn test_context_roundtrip() {
        let dir = TempDir::new().unwrap();
        let profiler = Profiler::new(test_args(&dir), Arc::new(MockRuntime::new())).unwrap();
        profiler.set_context(5, 100, 200, 2);
        let ctx = profiler.contexts().get(5);
        assert_eq!((ctx.span_id, ctx.root_span_id, ctx.parallelism), (100, 200, 2));
        profiler.clear_context(5);
        assert_eq!(profiler.contexts().get(5), ContextSnapshot::default());
    }
}
