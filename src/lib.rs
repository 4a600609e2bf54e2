//! flare - always-on, low-overhead profiler core for managed runtimes.
//!
//! The crate implements the sampling and event pipeline of a continuous
//! profiler: PC-to-symbol resolution over per-library code caches, a
//! wait-free per-thread context table, allocation liveness tracking
//! against GC epochs, and a recorder that streams events from many
//! threads into a chunked, self-describing binary file.
//!
//! # Modules
//!
//! - [`code_cache`] - per-library symbol tables and the process registry
//! - [`context`] - signal-safe per-thread trace context
//! - [`liveness`] - allocation samples correlated with GC survival
//! - [`recorder`] - the chunked event recorder
//! - [`profiler`] - orchestration and the runtime-facing operations
//! - [`inspect`] - offline chunk walking for the `flare` binary
//!
//! The managed runtime itself stays behind the [`runtime::ManagedRuntime`]
//! trait; the stack walker and perf-event wiring live in the embedder.

pub mod buffer;
pub mod call_trace;
pub mod code_cache;
pub mod context;
pub mod dictionary;
pub mod event;
pub mod inspect;
pub mod liveness;
pub mod metadata;
pub mod os;
pub mod profiler;
pub mod recorder;
pub mod runtime;
pub mod spinlock;
pub mod thread_filter;
pub mod tsc;

// Re-export for convenience
pub use call_trace::{CallTrace, CallTraceStorage, Frame};
pub use code_cache::{CodeCache, CodeCacheArray};
pub use context::Contexts;
pub use event::{ContextSnapshot, EventPayload, ThreadState};
pub use liveness::LivenessTracker;
pub use profiler::{ConfigError, Profiler, ProfilerArgs};
pub use recorder::Recorder;
pub use runtime::{ManagedRuntime, MockRuntime};
