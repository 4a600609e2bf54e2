//! The chunked event recorder.
//!
//! A recording is a sequence of self-contained chunks in one file. Each
//! chunk opens with a fixed header and the metadata event, streams events
//! from per-slot buffers, and closes with a constant pool holding every
//! dictionary the chunk's events reference. The header is patched in place
//! on close, so a reader can consume completed chunks while the file is
//! still being appended to.
//!
//! Concurrency: event producers (signal handlers among them) take the
//! shared side of the recording lock and one of [`CONCURRENCY_LEVEL`] slot
//! locks; rotation, stop, and dump take the exclusive side. A producer
//! that cannot get the shared lock drops its sample — it is sampled data.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::warn;

use crate::buffer::{Buffer, BUFFER_LIMIT, MAX_STRING_LENGTH, RECORDING_BUFFER_LIMIT};
use crate::call_trace::{CallTrace, CallTraceStorage, Frame};
use crate::code_cache::{is_native_handle, unpack_native_handle, CodeCacheArray};
use crate::dictionary::Dictionary;
use crate::event::{
    AllocEvent, EventPayload, ExecutionEvent, FrameType, LockEvent, MemLeakEvent, QueueTimeEvent,
    TraceRootEvent, WallClockEpochEvent, BCI_LINE_ONLY_BIT,
};
use crate::metadata::{self, Metadata};
use crate::os::{self, CpuTime, NO_CPU_TIME};
use crate::profiler::ProfilerArgs;
use crate::runtime::ManagedRuntime;
use crate::spinlock::RwSpinLock;
use crate::thread_filter::ThreadFilter;
use crate::tsc;

pub const CONCURRENCY_LEVEL: usize = 16;

const CHUNK_HEADER_SIZE: u64 = 68;
const MIN_CHUNK_SIZE: u64 = 262144;
const MIN_CHUNK_TIME_SECS: u64 = 5;
const MAX_JLONG: u64 = 0x7fff_ffff_ffff_ffff;
const MIN_JLONG: u64 = 0x8000_0000_0000_0000;

const PROFILER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything the recorder borrows from the rest of the profiler while a
/// recording is active.
#[derive(Clone)]
pub struct RecordingEnv {
    pub runtime: Arc<dyn ManagedRuntime>,
    pub libs: Arc<CodeCacheArray>,
    pub call_traces: Arc<CallTraceStorage>,
    pub classes: Arc<Dictionary>,
    pub strings: Arc<Dictionary>,
}

#[derive(Clone, Copy, Default)]
struct CpuTimes {
    proc: CpuTime,
    total: CpuTime,
}

fn ratio(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

#[derive(Default)]
struct MethodInfo {
    mark: bool,
    is_entry: bool,
    key: u32,
    class_id: u32,
    name_id: u32,
    sig_id: u32,
    modifiers: u32,
    line_numbers: Vec<(u32, u32)>,
    frame_type: FrameType,
}

impl MethodInfo {
    fn line_number(&self, bci: u32) -> u32 {
        if self.line_numbers.is_empty() {
            return 0;
        }
        let mut i = 1;
        while i < self.line_numbers.len() && bci >= self.line_numbers[i].0 {
            i += 1;
        }
        self.line_numbers[i - 1].1
    }

    fn is_hidden(&self) -> bool {
        // ACC_SYNTHETIC | ACC_BRIDGE, or no modifiers at all.
        self.modifiers == 0 || self.modifiers & 0x1040 != 0
    }
}

type MethodMap = BTreeMap<u64, MethodInfo>;

/// Strip the outermost balanced argument list from a demangled name.
fn cut_arguments(name: &str) -> &str {
    let bytes = name.as_bytes();
    let Some(end) = name.rfind(')') else {
        return name;
    };
    let mut balance = 1;
    let mut p = end;
    while p > 0 {
        p -= 1;
        match bytes[p] {
            b'(' => {
                balance -= 1;
                if balance == 0 {
                    return &name[..p];
                }
            }
            b')' => balance += 1,
            _ => {}
        }
    }
    name
}

fn fill_native_method_info(
    mi: &mut MethodInfo,
    name: &str,
    classes: &Dictionary,
    symbols: &Dictionary,
) {
    mi.modifiers = 0x100;
    mi.line_numbers = Vec::new();

    if name.starts_with("_Z") || name.starts_with("_R") {
        if let Ok(demangled) = rustc_demangle::try_demangle(name) {
            let demangled = format!("{demangled:#}");
            mi.class_id = classes.lookup("");
            mi.name_id = symbols.lookup(cut_arguments(&demangled));
            mi.sig_id = symbols.lookup("()L;");
            mi.frame_type = FrameType::Cpp;
            return;
        }
    }

    if let Some(stripped) = name.strip_suffix("_[k]") {
        mi.class_id = classes.lookup("(k)");
        mi.name_id = symbols.lookup(stripped);
        mi.sig_id = symbols.lookup("(Lk;)L;");
        mi.frame_type = FrameType::Kernel;
    } else {
        mi.class_id = classes.lookup("");
        mi.name_id = symbols.lookup(name);
        mi.sig_id = symbols.lookup("()L;");
        mi.frame_type = FrameType::Native;
    }
}

fn fill_managed_method_info(
    mi: &mut MethodInfo,
    method_id: u64,
    first_time: bool,
    runtime: &dyn ManagedRuntime,
    classes: &Dictionary,
    symbols: &Dictionary,
) {
    match runtime.resolve_method(method_id) {
        Some(resolved) => {
            mi.class_id = classes.lookup(&resolved.class_name);
            mi.name_id = symbols.lookup(&resolved.method_name);
            mi.sig_id = symbols.lookup(&resolved.signature);
            if first_time {
                mi.modifiers = resolved.modifiers;
                mi.line_numbers = resolved.line_numbers;
                mi.is_entry = resolved.is_entry;
            }
        }
        None => {
            mi.class_id = classes.lookup("");
            mi.name_id = symbols.lookup("unresolved");
            mi.sig_id = symbols.lookup("()L;");
        }
    }
    mi.frame_type = FrameType::Interpreted;
}

/// Per-chunk method resolution: a persistent method map with per-chunk
/// mark bits, plus the symbol/package dictionaries that live only for one
/// constant pool.
struct Lookup<'a> {
    method_map: &'a mut MethodMap,
    env: &'a RecordingEnv,
    packages: Dictionary,
    symbols: Dictionary,
}

impl<'a> Lookup<'a> {
    fn new(method_map: &'a mut MethodMap, env: &'a RecordingEnv) -> Self {
        Lookup {
            method_map,
            env,
            packages: Dictionary::new(),
            symbols: Dictionary::new(),
        }
    }

    fn resolve(&mut self, frame: Frame) -> &MethodInfo {
        let method_id = frame.method_id;
        let first_time = !self.method_map.contains_key(&method_id);
        if first_time {
            let key = self.method_map.len() as u32 + 1;
            self.method_map.insert(
                method_id,
                MethodInfo {
                    key,
                    ..Default::default()
                },
            );
        }

        let env = self.env;
        let symbols = &self.symbols;
        let mi = self.method_map.get_mut(&method_id).unwrap();
        if !mi.mark {
            mi.mark = true;
            if method_id == 0 {
                fill_native_method_info(mi, "unknown", &env.classes, symbols);
            } else if is_native_handle(method_id) {
                let (lib_index, blob_index) = unpack_native_handle(method_id);
                let name = match env.libs.get(lib_index as usize) {
                    Some(cache) => cache.blob_name(blob_index).to_string(),
                    None => "unknown".to_string(),
                };
                fill_native_method_info(mi, &name, &env.classes, symbols);
            } else {
                fill_managed_method_info(
                    mi,
                    method_id,
                    first_time,
                    &*env.runtime,
                    &env.classes,
                    symbols,
                );
            }
        }
        self.method_map.get(&method_id).unwrap()
    }

    /// Package portion of a slash-separated class name; hidden-class
    /// numeric suffixes collapse into the enclosing package, array classes
    /// skip their bracket prefix.
    fn package_id(&self, class_name: &str) -> u32 {
        let bytes = class_name.as_bytes();
        let mut package = match class_name.rfind('/') {
            Some(p) => p,
            None => return 0,
        };
        if bytes.get(package + 1).is_some_and(|c| c.is_ascii_digit()) {
            loop {
                if package == 0 {
                    return 0;
                }
                package -= 1;
                if bytes[package] == b'/' {
                    break;
                }
            }
        }
        let start = if bytes[0] == b'[' {
            match class_name.find('L') {
                Some(l) => l + 1,
                None => return 0,
            }
        } else {
            0
        };
        if package <= start {
            return 0;
        }
        self.packages.lookup(&class_name[start..package])
    }

    fn symbol_id(&self, name: &str) -> u32 {
        self.symbols.lookup(name)
    }
}

fn flush_buffer(file: &File, bytes_written: &AtomicU64, buf: &mut Buffer) {
    let len = buf.offset() as u64;
    if len > 0 && (&*file).write_all(buf.data()).is_ok() {
        bytes_written.fetch_add(len, Ordering::Relaxed);
    }
    buf.reset();
}

fn flush_buffer_if_needed(file: &File, bytes_written: &AtomicU64, buf: &mut Buffer, limit: usize) {
    if buf.offset() >= limit {
        flush_buffer(file, bytes_written, buf);
    }
}

pub struct Recording {
    env: RecordingEnv,
    args: ProfilerArgs,
    filename: PathBuf,
    file: File,
    chunk_start: u64,

    bufs: Box<[std::cell::UnsafeCell<Buffer>]>,
    cpu_buf: std::cell::UnsafeCell<Buffer>,
    thread_set: ThreadFilter,
    method_map: MethodMap,
    metadata: Metadata,

    start_time: u64,
    start_ticks: u64,
    recording_start_time: u64,
    recording_start_ticks: u64,
    stop_time: u64,
    stop_ticks: u64,

    base_id: u64,
    bytes_written: AtomicU64,
    chunk_size: u64,
    chunk_time: u64,

    tid: i32,
    available_processors: i32,
    recorded_lib_count: i64,

    cpu_monitor_enabled: bool,
    last_times: std::cell::UnsafeCell<CpuTimes>,
}

// Per-slot buffers are written under per-slot locks, the cpu buffer and
// last_times only from the timer thread; everything else is either
// immutable, atomic, or touched under the exclusive recording lock.
unsafe impl Sync for Recording {}
unsafe impl Send for Recording {}

impl Recording {
    fn new(mut file: File, filename: PathBuf, env: RecordingEnv, args: ProfilerArgs) -> Result<Self> {
        let chunk_start = file.seek(SeekFrom::End(0))?;
        let start_time = os::micros();
        let start_ticks = tsc::ticks();

        let chunk_size = if args.chunk_size == 0 {
            MAX_JLONG
        } else {
            args.chunk_size.max(MIN_CHUNK_SIZE)
        };
        let chunk_time = if args.chunk_time == 0 {
            MAX_JLONG
        } else {
            args.chunk_time.max(MIN_CHUNK_TIME_SECS) * 1_000_000
        };

        let bufs = (0..CONCURRENCY_LEVEL)
            .map(|_| std::cell::UnsafeCell::new(Buffer::recording()))
            .collect();

        let mut rec = Recording {
            available_processors: env.runtime.available_processors(),
            env,
            filename,
            file,
            chunk_start,
            bufs,
            cpu_buf: std::cell::UnsafeCell::new(Buffer::small()),
            thread_set: ThreadFilter::default(),
            method_map: MethodMap::new(),
            metadata: Metadata::build(),
            start_time,
            start_ticks,
            recording_start_time: start_time,
            recording_start_ticks: start_ticks,
            stop_time: 0,
            stop_ticks: 0,
            base_id: 0,
            bytes_written: AtomicU64::new(0),
            chunk_size,
            chunk_time,
            tid: os::thread_id(),
            recorded_lib_count: if args.native_libs { 0 } else { -1 },
            cpu_monitor_enabled: args.cpu_load,
            last_times: std::cell::UnsafeCell::new(CpuTimes::default()),
            args,
        };

        rec.thread_set.add(rec.tid);

        let mut buf = Buffer::recording();
        rec.write_header(&mut buf);
        rec.metadata.write(&mut buf, rec.start_ticks);
        rec.write_settings(&mut buf);
        if rec.args.system_info {
            rec.write_os_cpu_info(&mut buf);
            rec.write_runtime_info(&mut buf);
        }
        if rec.args.system_props {
            rec.write_system_properties(&mut buf);
        }
        rec.write_native_libraries(&mut buf);
        flush_buffer(&rec.file, &rec.bytes_written, &mut buf);

        if rec.cpu_monitor_enabled {
            let times = CpuTimes {
                proc: os::process_cpu_time(),
                total: os::total_cpu_time(),
            };
            rec.last_times = std::cell::UnsafeCell::new(times);
        }

        Ok(rec)
    }

    fn write_header(&self, buf: &mut Buffer) {
        buf.put(b"FLR\0");
        buf.put_u16(2); // major
        buf.put_u16(0); // minor
        buf.put_u64(1024 * 1024 * 1024); // chunk size, patched on close
        buf.put_u64(0); // cpool offset
        buf.put_u64(0); // meta offset
        buf.put_u64(self.start_time * 1000); // start time, ns
        buf.put_u64(0); // duration, ns
        buf.put_u64(self.start_ticks);
        buf.put_u64(tsc::frequency());
        buf.put_u32(1); // features
    }

    fn write_string_setting(&self, buf: &mut Buffer, category: u32, key: &str, value: &str) {
        let start = buf.skip(5);
        buf.put_var64(metadata::T_ACTIVE_SETTING as u64);
        buf.put_var64(self.start_ticks);
        buf.put_u8(0);
        buf.put_var64(self.tid as u64);
        buf.put_u8(0);
        buf.put_var64(category as u64);
        buf.put_utf8(key);
        buf.put_utf8(value);
        buf.patch_var32(start, (buf.offset() - start) as u32);
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }

    fn write_bool_setting(&self, buf: &mut Buffer, category: u32, key: &str, value: bool) {
        self.write_string_setting(buf, category, key, if value { "true" } else { "false" });
    }

    fn write_int_setting(&self, buf: &mut Buffer, category: u32, key: &str, value: i64) {
        self.write_string_setting(buf, category, key, &value.to_string());
    }

    fn write_list_setting(&self, buf: &mut Buffer, category: u32, key: &str, values: &[String]) {
        for value in values {
            self.write_string_setting(buf, category, key, value);
        }
    }

    fn write_settings(&self, buf: &mut Buffer) {
        use crate::metadata::*;
        let args = &self.args;

        self.write_string_setting(buf, T_ACTIVE_RECORDING, "version", PROFILER_VERSION);
        self.write_int_setting(buf, T_ACTIVE_RECORDING, "chunksize", args.chunk_size as i64);
        self.write_int_setting(buf, T_ACTIVE_RECORDING, "chunktime", args.chunk_time as i64);
        self.write_string_setting(buf, T_ACTIVE_RECORDING, "loglevel", &log::max_level().to_string());
        self.write_list_setting(buf, T_ACTIVE_RECORDING, "include", &args.include);
        self.write_list_setting(buf, T_ACTIVE_RECORDING, "exclude", &args.exclude);

        let cpu_enabled = args.interval > 0;
        self.write_bool_setting(buf, T_EXECUTION_SAMPLE, "enabled", cpu_enabled);
        if cpu_enabled {
            self.write_int_setting(buf, T_EXECUTION_SAMPLE, "interval", args.interval as i64);
        }

        let wall_enabled = args.wall_interval > 0;
        self.write_bool_setting(buf, T_METHOD_SAMPLE, "enabled", wall_enabled);
        if wall_enabled {
            self.write_int_setting(buf, T_METHOD_SAMPLE, "interval", args.wall_interval as i64);
        }

        let alloc_enabled = args.alloc_interval >= 0;
        self.write_bool_setting(buf, T_ALLOC_IN_NEW_TLAB, "enabled", alloc_enabled);
        self.write_bool_setting(buf, T_ALLOC_OUTSIDE_TLAB, "enabled", alloc_enabled);
        if alloc_enabled {
            self.write_int_setting(buf, T_ALLOC_IN_NEW_TLAB, "alloc", args.alloc_interval);
        }

        let lock_enabled = args.lock_threshold >= 0;
        self.write_bool_setting(buf, T_MONITOR_ENTER, "enabled", lock_enabled);
        self.write_bool_setting(buf, T_THREAD_PARK, "enabled", lock_enabled);
        if lock_enabled {
            self.write_int_setting(buf, T_MONITOR_ENTER, "lock", args.lock_threshold);
        }

        let memleak_enabled = args.memleak_interval > 0;
        self.write_bool_setting(buf, T_HEAP_LIVE_OBJECT, "enabled", memleak_enabled);
        if memleak_enabled {
            self.write_int_setting(
                buf,
                T_HEAP_LIVE_OBJECT,
                "memleak",
                args.memleak_interval as i64,
            );
        }

        self.write_bool_setting(buf, T_CPU_LOAD, "enabled", args.cpu_load);
    }

    fn write_os_cpu_info(&self, buf: &mut Buffer) {
        let uts = match nix::sys::utsname::uname() {
            Ok(uts) => uts,
            Err(_) => return,
        };
        let description = format!(
            "uname: {} {} {} {}",
            uts.sysname().to_string_lossy(),
            uts.release().to_string_lossy(),
            uts.version().to_string_lossy(),
            uts.machine().to_string_lossy()
        );

        let start = buf.skip(5);
        buf.put_var64(metadata::T_OS_INFORMATION as u64);
        buf.put_var64(self.start_ticks);
        buf.put_utf8(&description);
        buf.patch_var32(start, (buf.offset() - start) as u32);

        let start = buf.skip(5);
        buf.put_var64(metadata::T_CPU_INFORMATION as u64);
        buf.put_var64(self.start_ticks);
        buf.put_utf8(&uts.machine().to_string_lossy());
        buf.put_utf8(os::cpu_description().as_deref().unwrap_or(""));
        buf.put_u8(1);
        buf.put_var64(self.available_processors as u64);
        buf.put_var64(self.available_processors as u64);
        buf.patch_var32(start, (buf.offset() - start) as u32);
    }

    fn write_runtime_info(&self, buf: &mut Buffer) {
        let info = self.env.runtime.runtime_info();

        flush_buffer_if_needed(
            &self.file,
            &self.bytes_written,
            buf,
            RECORDING_BUFFER_LIMIT - 5 * MAX_STRING_LENGTH,
        );
        let start = buf.skip(5);
        buf.put_var64(metadata::T_RUNTIME_INFORMATION as u64);
        buf.put_var64(self.start_ticks);
        buf.put_utf8(&info.name);
        buf.put_utf8(&info.version);
        buf.put_utf8_opt(info.args.as_deref());
        buf.put_utf8_opt(info.flags.as_deref());
        buf.put_utf8_opt(info.command.as_deref());
        buf.put_var64(info.start_time_millis);
        buf.put_var64(info.pid as u64);
        buf.patch_var32(start, (buf.offset() - start) as u32);
    }

    fn write_system_properties(&self, buf: &mut Buffer) {
        let info = self.env.runtime.runtime_info();
        for (key, value) in &info.properties {
            flush_buffer_if_needed(
                &self.file,
                &self.bytes_written,
                buf,
                RECORDING_BUFFER_LIMIT - 2 * MAX_STRING_LENGTH,
            );
            let start = buf.skip(5);
            buf.put_var64(metadata::T_INITIAL_SYSTEM_PROPERTY as u64);
            buf.put_var64(self.start_ticks);
            buf.put_utf8(key);
            buf.put_utf8(value);
            buf.patch_var32(start, (buf.offset() - start) as u32);
        }
    }

    /// Incremental: only libraries registered since the last call.
    fn write_native_libraries(&mut self, buf: &mut Buffer) {
        if self.recorded_lib_count < 0 {
            return;
        }

        let lib_count = self.env.libs.count() as i64;
        for i in self.recorded_lib_count..lib_count {
            let lib = match self.env.libs.get(i as usize) {
                Some(lib) => lib,
                None => break,
            };
            flush_buffer_if_needed(
                &self.file,
                &self.bytes_written,
                buf,
                RECORDING_BUFFER_LIMIT - MAX_STRING_LENGTH,
            );
            let start = buf.skip(5);
            buf.put_var64(metadata::T_NATIVE_LIBRARY as u64);
            buf.put_var64(self.start_ticks);
            buf.put_utf8(lib.name());
            buf.put_var64(lib.min_address());
            buf.put_var64(lib.max_address());
            buf.patch_var32(start, (buf.offset() - start) as u32);
        }

        self.recorded_lib_count = lib_count;
    }

    fn write_recording_info(&self, buf: &mut Buffer) {
        let start = buf.skip(5);
        buf.put_var64(metadata::T_ACTIVE_RECORDING as u64);
        buf.put_var64(self.recording_start_ticks);
        buf.put_var64(self.stop_ticks - self.recording_start_ticks);
        buf.put_var64(self.tid as u64);
        buf.put_utf8(&format!("flare {PROFILER_VERSION}"));
        buf.put_utf8(&self.filename.to_string_lossy());
        buf.put_var64(MAX_JLONG);
        buf.put_var64(MAX_JLONG);
        buf.put_var64(self.recording_start_time / 1000);
        buf.put_var64((self.stop_time - self.recording_start_time) / 1000);
        buf.patch_var32(start, (buf.offset() - start) as u32);
    }

    fn write_cpool(&mut self, buf: &mut Buffer) {
        // 5-byte size slot; patched at the file level once the final
        // offset is known.
        buf.skip(5);
        buf.put_var64(metadata::T_CPOOL as u64);
        buf.put_var64(self.start_ticks);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(1);
        buf.put_u8(10); // pool count, bump when a new pool is added

        let file = &self.file;
        let bytes_written = &self.bytes_written;
        let base_id = self.base_id;
        let env = self.env.clone();
        let mut lookup = Lookup::new(&mut self.method_map, &env);

        write_frame_types(buf);
        write_thread_states(buf);
        write_threads(buf, file, bytes_written, &env, &self.thread_set);
        write_stack_traces(buf, file, bytes_written, &env, &mut lookup);
        write_methods(buf, file, bytes_written, base_id, &mut lookup);
        write_classes(buf, file, bytes_written, base_id, &env, &lookup);
        write_packages(buf, file, bytes_written, base_id, &lookup);
        write_dictionary_pool(
            buf,
            file,
            bytes_written,
            base_id,
            metadata::T_SYMBOL,
            &lookup.symbols,
        );
        write_dictionary_pool(
            buf,
            file,
            bytes_written,
            base_id,
            metadata::T_STRING_POOL,
            &env.strings,
        );
        write_log_levels(buf);
    }

    /// Close the current chunk: flush everything, append the constant
    /// pool, then patch the pool size and the header tail in place.
    fn finish_chunk(&mut self, end_recording: bool) -> Result<u64> {
        let mut buf = Buffer::recording();

        let cpu_buf = self.cpu_buf.get_mut();
        if cpu_buf.offset() > 0 {
            let data = cpu_buf.data().to_vec();
            buf.put(&data);
            cpu_buf.reset();
        }

        self.write_native_libraries(&mut buf);

        self.stop_time = os::micros();
        self.stop_ticks = tsc::ticks();

        if end_recording {
            flush_buffer(&self.file, &self.bytes_written, &mut buf);
            self.write_recording_info(&mut buf);
        }

        flush_buffer(&self.file, &self.bytes_written, &mut buf);
        for slot in self.bufs.iter_mut() {
            flush_buffer(&self.file, &self.bytes_written, slot.get_mut());
        }

        let cpool_offset = (&self.file).stream_position()?;
        self.write_cpool(&mut buf);
        flush_buffer(&self.file, &self.bytes_written, &mut buf);

        let chunk_end = (&self.file).stream_position()?;

        // Patch the cpool size varint.
        buf.reset();
        buf.skip(5);
        buf.patch_var32(0, (chunk_end - cpool_offset) as u32);
        self.file.write_all_at(buf.data(), cpool_offset)?;

        let tsc_frequency = tsc::frequency();
        // Hook: re-derive the frequency from this chunk's tick and wall
        // deltas if the calibrated value proves wrong. Disabled.

        // Patch the 56-byte header tail.
        buf.reset();
        buf.put_u64(chunk_end - self.chunk_start);
        buf.put_u64(cpool_offset - self.chunk_start);
        buf.put_u64(CHUNK_HEADER_SIZE);
        buf.put_u64(self.start_time * 1000);
        buf.put_u64((self.stop_time - self.start_time) * 1000);
        buf.put_u64(self.start_ticks);
        buf.put_u64(tsc_frequency);
        self.file.write_all_at(buf.data(), self.chunk_start + 8)?;

        os::free_page_cache(&self.file, chunk_end);

        Ok(chunk_end)
    }

    /// Rotate: close the current chunk and open the next one in the same
    /// file. Dictionary id spaces advance so per-chunk ids never collide.
    fn switch_chunk(&mut self) -> Result<()> {
        self.chunk_start = self.finish_chunk(false)?;
        self.start_time = self.stop_time;
        self.start_ticks = self.stop_ticks;
        self.base_id += 0x100_0000;
        self.bytes_written.store(0, Ordering::Relaxed);

        let mut buf = Buffer::recording();
        self.write_header(&mut buf);
        self.metadata.write(&mut buf, self.start_ticks);
        flush_buffer(&self.file, &self.bytes_written, &mut buf);
        Ok(())
    }

    fn need_switch_chunk(&self, wall_time: u64) -> bool {
        self.bytes_written.load(Ordering::Acquire) >= self.chunk_size
            || wall_time.saturating_sub(self.start_time) >= self.chunk_time
    }

    /// Runs on the timer thread only, under the shared recording lock.
    fn cpu_monitor_cycle(&self) {
        if !self.cpu_monitor_enabled {
            return;
        }

        let times = CpuTimes {
            proc: os::process_cpu_time(),
            total: os::total_cpu_time(),
        };
        // Safety: single writer by the timer-thread convention.
        let last = unsafe { &mut *self.last_times.get() };

        let mut proc_user = 0.0;
        let mut proc_system = 0.0;
        let mut machine_total = 0.0;

        if times.proc.real != NO_CPU_TIME && times.proc.real > last.proc.real {
            let delta = (times.proc.real - last.proc.real) as f32 * self.available_processors as f32;
            proc_user = ratio((times.proc.user - last.proc.user) as f32 / delta);
            proc_system = ratio((times.proc.system - last.proc.system) as f32 / delta);
        }

        if times.total.real != NO_CPU_TIME && times.total.real > last.total.real {
            let delta = (times.total.real - last.total.real) as f32;
            machine_total = ratio(
                ((times.total.user + times.total.system)
                    - (last.total.user + last.total.system)) as f32
                    / delta,
            );
            // Machine-wide load can never be below our own share; correct
            // for sampling skew between the two snapshots.
            if machine_total < proc_user + proc_system {
                machine_total = ratio(proc_user + proc_system);
            }
        }

        let buf = unsafe { &mut *self.cpu_buf.get() };
        let start = buf.skip(1);
        buf.put_var64(metadata::T_CPU_LOAD as u64);
        buf.put_var64(tsc::ticks());
        buf.put_float(proc_user);
        buf.put_float(proc_system);
        buf.put_float(machine_total);
        buf.patch_u8(start, (buf.offset() - start) as u8);
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, BUFFER_LIMIT);

        *last = times;
    }

    /// Per-slot buffer, written under that slot's lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_buffer(&self, slot: usize) -> &mut Buffer {
        &mut *self.bufs[slot].get()
    }

    fn record_event(&self, slot: usize, tid: i32, call_trace_id: u32, payload: &EventPayload) {
        // Safety: the caller holds slot lock `slot`.
        let buf = unsafe { self.slot_buffer(slot) };
        match payload {
            EventPayload::Execution(event) => self.record_execution_sample(buf, tid, call_trace_id, event),
            EventPayload::Wall(event) => self.record_method_sample(buf, tid, call_trace_id, event),
            EventPayload::AllocInNewTlab(event) => self.record_alloc_in_new_tlab(buf, tid, call_trace_id, event),
            EventPayload::AllocOutsideTlab(event) => self.record_alloc_outside_tlab(buf, tid, call_trace_id, event),
            EventPayload::LiveObject(event) => self.record_heap_live_object(buf, tid, call_trace_id, event),
            EventPayload::MonitorEnter(event) => self.record_monitor_enter(buf, tid, call_trace_id, event),
            EventPayload::ThreadPark(event) => self.record_thread_park(buf, tid, call_trace_id, event),
        }
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, RECORDING_BUFFER_LIMIT);
        self.thread_set.add(tid);
    }

    fn record_execution_sample(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &ExecutionEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_EXECUTION_SAMPLE as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(tid as u64);
        buf.put_var64(call_trace_id as u64);
        buf.put_var64(event.thread_state as u64);
        buf.put_var64(event.context.span_id);
        buf.put_var64(event.context.root_span_id);
        buf.put_var64(event.weight);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_method_sample(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &ExecutionEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_METHOD_SAMPLE as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(tid as u64);
        buf.put_var64(call_trace_id as u64);
        buf.put_var64(event.thread_state as u64);
        buf.put_var64(event.context.span_id);
        buf.put_var64(event.context.root_span_id);
        buf.put_var64(event.weight);
        buf.put_var64(event.context.parallelism as u64);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_alloc_in_new_tlab(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &AllocEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_ALLOC_IN_NEW_TLAB as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(tid as u64);
        buf.put_var64(call_trace_id as u64);
        buf.put_var64(event.class_id as u64);
        buf.put_var64(event.instance_size);
        buf.put_var64(event.total_size);
        buf.put_var64(event.context.span_id);
        buf.put_var64(event.context.root_span_id);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_alloc_outside_tlab(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &AllocEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_ALLOC_OUTSIDE_TLAB as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(tid as u64);
        buf.put_var64(call_trace_id as u64);
        buf.put_var64(event.class_id as u64);
        buf.put_var64(event.total_size);
        buf.put_var64(event.context.span_id);
        buf.put_var64(event.context.root_span_id);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_heap_live_object(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &MemLeakEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_HEAP_LIVE_OBJECT as u64);
        buf.put_var64(event.start_ticks);
        buf.put_var32(tid as u32);
        buf.put_var32(call_trace_id);
        buf.put_var32(event.class_id);
        buf.put_var64(event.age);
        buf.put_var64(event.instance_size);
        buf.put_var64(event.interval);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_monitor_enter(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &LockEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_MONITOR_ENTER as u64);
        buf.put_var64(event.start_ticks);
        buf.put_var64(event.end_ticks - event.start_ticks);
        buf.put_var64(tid as u64);
        buf.put_var64(call_trace_id as u64);
        buf.put_var64(event.class_id as u64);
        buf.put_u8(0); // previous owner unknown
        buf.put_var64(event.address);
        buf.put_var64(event.context.span_id);
        buf.put_var64(event.context.root_span_id);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_thread_park(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, event: &LockEvent) {
        let start = buf.skip(1);
        buf.put_var64(metadata::T_THREAD_PARK as u64);
        buf.put_var64(event.start_ticks);
        buf.put_var64(event.end_ticks - event.start_ticks);
        buf.put_var64(tid as u64);
        buf.put_var64(call_trace_id as u64);
        buf.put_var64(event.class_id as u64);
        buf.put_var64(event.timeout as u64);
        buf.put_var64(MIN_JLONG);
        buf.put_var64(event.address);
        buf.patch_u8(start, (buf.offset() - start) as u8);
    }

    fn record_trace_root(&self, slot: usize, tid: i32, event: &TraceRootEvent) {
        let buf = unsafe { self.slot_buffer(slot) };
        let start = buf.skip(1);
        buf.put_var64(metadata::T_ENDPOINT as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(0);
        buf.put_var32(tid as u32);
        buf.put_var32(event.label);
        buf.put_var64(event.local_root_span_id);
        buf.patch_u8(start, (buf.offset() - start) as u8);
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, RECORDING_BUFFER_LIMIT);
        self.thread_set.add(tid);
    }

    fn record_queue_time(&self, slot: usize, tid: i32, event: &QueueTimeEvent) {
        let buf = unsafe { self.slot_buffer(slot) };
        let start = buf.skip(1);
        buf.put_var64(metadata::T_QUEUE_TIME as u64);
        buf.put_var64(event.start_ticks);
        buf.put_var64(event.end_ticks - event.start_ticks);
        buf.put_var32(event.origin_tid as u32);
        buf.put_var32(event.task_class);
        buf.put_var32(event.scheduler_class);
        buf.put_var64(event.queue_length);
        buf.patch_u8(start, (buf.offset() - start) as u8);
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, RECORDING_BUFFER_LIMIT);
        self.thread_set.add(tid);
        self.thread_set.add(event.origin_tid);
    }

    fn record_wallclock_epoch(&self, slot: usize, event: &WallClockEpochEvent) {
        let buf = unsafe { self.slot_buffer(slot) };
        let start = buf.skip(1);
        buf.put_var64(metadata::T_WALLCLOCK_EPOCH as u64);
        buf.put_var64(event.start_ticks);
        buf.put_var64(event.duration_millis);
        buf.put_var64(event.num_samplable_threads);
        buf.put_var64(event.num_successful_samples);
        buf.put_var64(event.num_failed_samples);
        buf.put_var64(event.num_exited_threads);
        buf.put_var64(event.num_permission_denied);
        buf.patch_u8(start, (buf.offset() - start) as u8);
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }

    fn record_heap_usage(&self, slot: usize, used: u64, at_last_gc: bool) {
        let buf = unsafe { self.slot_buffer(slot) };
        let start = buf.skip(1);
        buf.put_var64(metadata::T_HEAP_USAGE as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(used);
        buf.put_u8(at_last_gc as u8);
        buf.patch_u8(start, (buf.offset() - start) as u8);
        flush_buffer_if_needed(&self.file, &self.bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }

    fn record_log(&self, level: u32, message: &str) {
        let len = message.len().min(MAX_STRING_LENGTH);
        let mut buf = Buffer::with_capacity(len + 64);
        let start = buf.skip(5);
        buf.put_var64(metadata::T_LOG as u64);
        buf.put_var64(tsc::ticks());
        buf.put_var64(level as u64);
        buf.put_utf8(message);
        buf.patch_var32(start, (buf.offset() - start) as u32);
        flush_buffer(&self.file, &self.bytes_written, &mut buf);
    }

    fn copy_to(&mut self, target: &File) -> Result<u64> {
        let end = self.finish_chunk(true)?;
        os::copy_file(&self.file, target, 0, end).context("copying recording")?;
        Ok(end)
    }
}

fn write_frame_types(buf: &mut Buffer) {
    buf.put_var32(metadata::T_FRAME_TYPE);
    buf.put_var32(7);
    for (ty, name) in [
        (FrameType::Interpreted, "Interpreted"),
        (FrameType::JitCompiled, "JIT compiled"),
        (FrameType::Inlined, "Inlined"),
        (FrameType::Native, "Native"),
        (FrameType::Cpp, "C++"),
        (FrameType::Kernel, "Kernel"),
        (FrameType::C1Compiled, "C1 compiled"),
    ] {
        buf.put_var32(ty as u32);
        buf.put_utf8(name);
    }
}

fn write_thread_states(buf: &mut Buffer) {
    buf.put_var64(metadata::T_THREAD_STATE as u64);
    buf.put_u8(2);
    buf.put_var64(crate::event::ThreadState::Runnable as u64);
    buf.put_utf8("STATE_RUNNABLE");
    buf.put_var64(crate::event::ThreadState::Sleeping as u64);
    buf.put_utf8("STATE_SLEEPING");
}

fn write_threads(
    buf: &mut Buffer,
    file: &File,
    bytes_written: &AtomicU64,
    env: &RecordingEnv,
    thread_set: &ThreadFilter,
) {
    let mut threads = Vec::new();
    thread_set.collect(&mut threads);

    buf.put_var64(metadata::T_THREAD as u64);
    buf.put_var64(threads.len() as u64);
    for tid in threads {
        let (name, runtime_id) = env
            .runtime
            .thread_info(tid)
            .unwrap_or_else(|| (format!("[tid={tid}]"), 0));

        buf.put_var64(tid as u64);
        buf.put_utf8(&name);
        buf.put_var64(tid as u64);
        if runtime_id == 0 {
            buf.put_u8(0);
        } else {
            buf.put_utf8(&name);
        }
        buf.put_var64(runtime_id);
        flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }
}

fn write_stack_traces(
    buf: &mut Buffer,
    file: &File,
    bytes_written: &AtomicU64,
    env: &RecordingEnv,
    lookup: &mut Lookup,
) {
    let mut traces: BTreeMap<u32, Arc<CallTrace>> = BTreeMap::new();
    env.call_traces.collect(&mut traces);

    buf.put_var64(metadata::T_STACK_TRACE as u64);
    buf.put_var64(traces.len() as u64);
    for (id, trace) in &traces {
        buf.put_var64(*id as u64);
        if let Some(last) = trace.frames.last() {
            let mi = lookup.resolve(*last);
            if mi.frame_type.is_managed() {
                buf.put_u8(if mi.is_entry { 0 } else { 1 });
            } else {
                buf.put_u8(trace.truncated as u8);
            }
        }
        buf.put_var64(trace.frames.len() as u64);
        for frame in &trace.frames {
            let mi = lookup.resolve(*frame);
            buf.put_var64(mi.key as u64);
            if mi.frame_type.is_managed() {
                let frame_type = FrameType::decode(frame.bci);
                let bci = if frame.bci & BCI_LINE_ONLY_BIT != 0 {
                    0
                } else {
                    (frame.bci & 0xffff) as u32
                };
                buf.put_var32(mi.line_number(bci));
                buf.put_var32(bci);
                buf.put_u8(frame_type as u8);
            } else {
                buf.put_var32(0);
                buf.put_var32(frame.bci as u32);
                buf.put_u8(mi.frame_type as u8);
            }
            flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
        }
        flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }
}

/// Only methods referenced by this chunk's stack traces are emitted; the
/// mark bits set during resolution are consumed here.
fn write_methods(
    buf: &mut Buffer,
    file: &File,
    bytes_written: &AtomicU64,
    base_id: u64,
    lookup: &mut Lookup,
) {
    let marked_count = lookup.method_map.values().filter(|mi| mi.mark).count();

    buf.put_var64(metadata::T_METHOD as u64);
    buf.put_var64(marked_count as u64);
    for mi in lookup.method_map.values_mut() {
        if mi.mark {
            mi.mark = false;
            buf.put_var64(mi.key as u64);
            buf.put_var64(mi.class_id as u64);
            buf.put_var64(mi.name_id as u64 | base_id);
            buf.put_var64(mi.sig_id as u64 | base_id);
            buf.put_var64(mi.modifiers as u64);
            buf.put_var64(mi.is_hidden() as u64);
            flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
        }
    }
}

fn write_classes(
    buf: &mut Buffer,
    file: &File,
    bytes_written: &AtomicU64,
    base_id: u64,
    env: &RecordingEnv,
    lookup: &Lookup,
) {
    let mut classes = BTreeMap::new();
    env.classes.collect(&mut classes);

    buf.put_var64(metadata::T_CLASS as u64);
    buf.put_var64(classes.len() as u64);
    for (id, name) in &classes {
        buf.put_var64(*id as u64);
        buf.put_var64(0); // class loader
        buf.put_var64(lookup.symbol_id(name) as u64 | base_id);
        let package = lookup.package_id(name);
        buf.put_var64(if package == 0 {
            0
        } else {
            package as u64 | base_id
        });
        buf.put_var64(0); // access flags
        flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }
}

fn write_packages(
    buf: &mut Buffer,
    file: &File,
    bytes_written: &AtomicU64,
    base_id: u64,
    lookup: &Lookup,
) {
    let mut packages = BTreeMap::new();
    lookup.packages.collect(&mut packages);

    buf.put_var32(metadata::T_PACKAGE);
    buf.put_var32(packages.len() as u32);
    for (id, name) in &packages {
        buf.put_var64(*id as u64 | base_id);
        buf.put_var64(lookup.symbol_id(name) as u64 | base_id);
        flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }
}

fn write_dictionary_pool(
    buf: &mut Buffer,
    file: &File,
    bytes_written: &AtomicU64,
    base_id: u64,
    pool_type: u32,
    dictionary: &Dictionary,
) {
    let mut constants = BTreeMap::new();
    dictionary.collect(&mut constants);

    buf.put_var64(pool_type as u64);
    buf.put_var64(constants.len() as u64);
    for (id, value) in &constants {
        buf.put_var64(*id as u64 | base_id);
        buf.put_utf8(value);
        flush_buffer_if_needed(file, bytes_written, buf, RECORDING_BUFFER_LIMIT);
    }
}

fn write_log_levels(buf: &mut Buffer) {
    let levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
    buf.put_var64(metadata::T_LOG_LEVEL as u64);
    buf.put_var64(levels.len() as u64);
    for (i, name) in levels.iter().enumerate() {
        buf.put_var32(i as u32 + 1);
        buf.put_utf8(name);
    }
}

/// The recording lifecycle: owns the active [`Recording`] behind a
/// reader/writer spinlock. The lock starts exclusively held ("no
/// recording"); `start` releases it, `stop` re-takes it, so every emit
/// path's `try_lock_shared` fails cleanly whenever there is nothing to
/// write to.
pub struct Recorder {
    lock: RwSpinLock,
    rec: std::cell::UnsafeCell<Option<Recording>>,
    slot_locks: [RwSpinLock; CONCURRENCY_LEVEL],
    dropped_samples: AtomicU64,
}

unsafe impl Sync for Recorder {}
unsafe impl Send for Recorder {}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            lock: RwSpinLock::new_locked(),
            rec: std::cell::UnsafeCell::new(None),
            slot_locks: std::array::from_fn(|_| RwSpinLock::new()),
            dropped_samples: AtomicU64::new(0),
        }
    }

    /// While no recording exists the lock sits in the exclusive state, so
    /// a successful shared probe means a recording is (or just was)
    /// active. Control operations (start/stop/dump/flush) are serialized
    /// by the caller; only the emit paths and the timer race with them.
    fn probe_active(&self) -> bool {
        if !self.lock.try_lock_shared() {
            return false;
        }
        let active = unsafe { &*self.rec.get() }.is_some();
        self.lock.unlock_shared();
        active
    }

    pub fn start(&self, env: RecordingEnv, args: &ProfilerArgs, reset: bool) -> Result<()> {
        if args.file.as_os_str().is_empty() {
            bail!("recording output file is not specified");
        }
        if self.probe_active() {
            bail!("recording already in progress");
        }
        if !tsc::initialized() {
            tsc::initialize();
        }

        // Safety: no recording exists, so no emit path can get past the
        // lock; the slot is ours.
        let rec = unsafe { &mut *self.rec.get() };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(reset)
            .open(&args.file)
            .with_context(|| format!("could not open recording file {}", args.file.display()))?;

        *rec = Some(Recording::new(file, args.file.clone(), env, args.clone())?);
        self.lock.unlock();
        Ok(())
    }

    pub fn stop(&self) {
        if !self.probe_active() {
            return;
        }
        self.lock.lock();
        let rec = unsafe { &mut *self.rec.get() };
        if let Some(mut recording) = rec.take() {
            if let Err(e) = recording.finish_chunk(true) {
                warn!("failed to finalize recording: {e}");
            }
        }
        // The lock stays held until the next start.
    }

    pub fn active(&self) -> bool {
        self.probe_active()
    }

    /// Rotate the current chunk.
    pub fn flush(&self) -> Result<()> {
        if !self.probe_active() {
            return Ok(());
        }
        self.lock.lock();
        let rec = unsafe { &mut *self.rec.get() };
        let (result, still_active) = match rec.as_mut() {
            Some(recording) => (recording.switch_chunk(), true),
            None => (Ok(()), false),
        };
        if still_active {
            self.lock.unlock();
        }
        result
    }

    /// Dump to `path`: same file as the recording flushes in place, a
    /// different file gets a copy and the recording restarts fresh.
    pub fn dump(&self, path: &Path) -> Result<()> {
        if !self.probe_active() {
            bail!("no active recording");
        }
        self.lock.lock();
        let rec = unsafe { &mut *self.rec.get() };
        let result = (|| {
            let recording = match rec.as_mut() {
                Some(recording) => recording,
                None => bail!("no active recording"),
            };
            if path == recording.filename {
                return recording.switch_chunk();
            }

            let target = File::create(path)
                .with_context(|| format!("could not create {}", path.display()))?;
            let mut old = rec.take().unwrap();
            old.copy_to(&target)?;

            let env = old.env.clone();
            let args = old.args.clone();
            drop(old);
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(true)
                .open(&args.file)?;
            *rec = Some(Recording::new(file, args.file.clone(), env, args)?);
            Ok(())
        })();
        if unsafe { &*self.rec.get() }.is_some() {
            self.lock.unlock();
        }
        result
    }

    /// Periodic driver: CPU monitor plus the rotation policy check.
    /// Returns true when the caller should rotate via `flush`.
    pub fn timer_tick(&self, wall_time: u64) -> bool {
        if !self.lock.try_lock_shared() {
            return false;
        }
        let need_switch = match unsafe { &*self.rec.get() } {
            Some(recording) => {
                recording.cpu_monitor_cycle();
                recording.need_switch_chunk(wall_time)
            }
            None => false,
        };
        self.lock.unlock_shared();
        need_switch
    }

    fn with_slot<F: FnOnce(&Recording, usize)>(&self, tid: i32, f: F) -> bool {
        if !self.lock.try_lock_shared() {
            self.dropped_samples.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let written = match unsafe { &*self.rec.get() } {
            Some(recording) => {
                let base = tid as u32 as usize;
                let mut written = false;
                for i in 0..CONCURRENCY_LEVEL {
                    let slot = (base + i) & (CONCURRENCY_LEVEL - 1);
                    if self.slot_locks[slot].try_lock() {
                        f(recording, slot);
                        self.slot_locks[slot].unlock();
                        written = true;
                        break;
                    }
                }
                written
            }
            None => false,
        };
        self.lock.unlock_shared();
        if !written {
            self.dropped_samples.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    pub fn record_event(&self, tid: i32, call_trace_id: u32, payload: &EventPayload) -> bool {
        self.with_slot(tid, |rec, slot| rec.record_event(slot, tid, call_trace_id, payload))
    }

    pub fn record_trace_root(&self, tid: i32, event: &TraceRootEvent) -> bool {
        self.with_slot(tid, |rec, slot| rec.record_trace_root(slot, tid, event))
    }

    pub fn record_queue_time(&self, tid: i32, event: &QueueTimeEvent) -> bool {
        self.with_slot(tid, |rec, slot| rec.record_queue_time(slot, tid, event))
    }

    pub fn record_wallclock_epoch(&self, event: &WallClockEpochEvent) -> bool {
        self.with_slot(0, |rec, slot| rec.record_wallclock_epoch(slot, event))
    }

    pub fn record_heap_usage(&self, used: u64, at_last_gc: bool) -> bool {
        self.with_slot(0, |rec, slot| rec.record_heap_usage(slot, used, at_last_gc))
    }

    pub fn record_log(&self, level: u32, message: &str) {
        if !self.lock.try_lock_shared() {
            return;
        }
        if let Some(recording) = unsafe { &*self.rec.get() } {
            recording.record_log(level, message);
        }
        self.lock.unlock_shared();
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.rec.get_mut().is_some() {
            self.stop();
        }
    }
}
