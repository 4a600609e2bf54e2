//! End-to-end tests of the recording pipeline: record samples through a
//! mock runtime, rotate chunks, and verify the on-disk chunk structure.

use std::path::PathBuf;
use std::sync::Arc;

use flare::event::{EventPayload, ExecutionEvent};
use flare::inspect;
use flare::runtime::ResolvedMethod;
use flare::{CodeCache, ContextSnapshot, Frame, MockRuntime, Profiler, ProfilerArgs, ThreadState};
use tempfile::TempDir;

fn test_args(dir: &TempDir) -> ProfilerArgs {
    ProfilerArgs {
        file: dir.path().join("recording.flr"),
        // Keep the open sequence lean so assertions about chunk contents
        // stay focused on what the tests emit.
        system_props: false,
        cpu_load: false,
        ..Default::default()
    }
}

fn runtime_with_fixtures() -> Arc<MockRuntime> {
    let runtime = Arc::new(MockRuntime::new());
    runtime.register_thread(42, "worker-42", 1042);
    runtime.register_method(
        7,
        ResolvedMethod {
            class_name: "com/example/Worker".to_string(),
            method_name: "doWork".to_string(),
            signature: "(I)V".to_string(),
            modifiers: 0x1,
            line_numbers: vec![(0, 10), (8, 12), (20, 15)],
            is_entry: false,
        },
    );
    runtime
}

fn record_one_sample(profiler: &Profiler) -> bool {
    let native_method = {
        let mut cache = CodeCache::new("libmath.so", 0);
        cache.add(0x7000, 0x100, "fast_sqrt", false);
        cache.sort();
        profiler.add_library(cache);
        profiler.resolve_native_pc(0x7010)
    };

    let frames = [
        Frame {
            method_id: native_method,
            bci: flare::event::BCI_NATIVE_FRAME,
        },
        Frame { method_id: 7, bci: 8 },
    ];
    profiler.record_sample(
        42,
        &frames,
        false,
        &EventPayload::Execution(ExecutionEvent {
            thread_state: ThreadState::Runnable,
            weight: 1,
            context: ContextSnapshot {
                span_id: 1,
                root_span_id: 2,
                parallelism: 3,
            },
        }),
    )
}

fn chunk_bytes(data: &[u8], chunk: &inspect::ChunkHeader) -> Vec<u8> {
    data[chunk.offset as usize..(chunk.offset + chunk.chunk_size) as usize].to_vec()
}

fn cpool_bytes(data: &[u8], chunk: &inspect::ChunkHeader) -> Vec<u8> {
    let start = (chunk.offset + chunk.cpool_offset) as usize;
    let end = (chunk.offset + chunk.chunk_size) as usize;
    data[start..end].to_vec()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_single_chunk_recording_is_valid() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    assert!(record_one_sample(&profiler));
    profiler.stop();

    let chunks = inspect::read_chunks(&file).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].major, 2);
    assert_eq!(chunks[0].minor, 0);
    assert_eq!(chunks[0].meta_offset, 68);
    assert!(chunks[0].ticks_per_sec > 0);
    assert!(inspect::validate(&file).unwrap().is_empty());
}

#[test]
fn test_chunk_rotation_writes_two_standalone_chunks() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    assert!(record_one_sample(&profiler));
    // Dumping to the recording's own path rotates in place.
    profiler.dump(&file).unwrap();
    profiler.stop();

    let data = std::fs::read(&file).unwrap();
    let chunks = inspect::read_chunks(&file).unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(inspect::validate(&file).unwrap().is_empty());

    // Both chunks open with the magic.
    for chunk in &chunks {
        assert_eq!(&data[chunk.offset as usize..chunk.offset as usize + 4], b"FLR\0");
    }

    // The second chunk picks up exactly where the first stopped.
    assert_eq!(
        chunks[1].start_time_ns,
        chunks[0].start_time_ns + chunks[0].duration_ns
    );

    // Chunk 1's constant pool resolves everything the sample referenced:
    // the sampled thread, the managed method, its class, and the native
    // symbol.
    let cpool = cpool_bytes(&data, &chunks[0]);
    assert!(contains(&cpool, b"worker-42"));
    assert!(contains(&cpool, b"doWork"));
    assert!(contains(&cpool, b"com/example/Worker"));
    assert!(contains(&cpool, b"fast_sqrt"));
    assert!(contains(&cpool, b"STATE_RUNNABLE"));

    // The method was emitted in chunk 1 and is not re-emitted in chunk 2,
    // which saw no reference to it.
    let cpool2 = cpool_bytes(&data, &chunks[1]);
    assert!(!contains(&cpool2, b"doWork"));
}

#[test]
fn test_native_library_listed_in_chunk() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    assert!(record_one_sample(&profiler));
    profiler.stop();

    let data = std::fs::read(&file).unwrap();
    let chunks = inspect::read_chunks(&file).unwrap();
    let chunk = chunk_bytes(&data, &chunks[0]);
    assert!(contains(&chunk, b"libmath.so"));
}

#[test]
fn test_log_message_truncated_at_limit() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    let message = "x".repeat(10_000);
    profiler.record_log(log::Level::Warn, &message);
    profiler.stop();

    let data = std::fs::read(&file).unwrap();
    let longest_run = data
        .split(|b| *b != b'x')
        .map(|run| run.len())
        .max()
        .unwrap_or(0);
    assert_eq!(longest_run, 8191);
}

#[test]
fn test_dump_to_other_path_restarts_recording() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let copy = dir.path().join("snapshot.flr");
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    assert!(record_one_sample(&profiler));
    profiler.dump(&copy).unwrap();

    // The snapshot is complete and standalone.
    assert!(inspect::validate(&copy).unwrap().is_empty());

    // The working file was restarted: record again and stop.
    assert!(record_one_sample(&profiler));
    profiler.stop();
    assert!(inspect::validate(&file).unwrap().is_empty());
    assert_eq!(inspect::read_chunks(&file).unwrap().len(), 1);
}

#[test]
fn test_settings_and_metadata_in_every_chunk() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    assert!(record_one_sample(&profiler));
    profiler.dump(&file).unwrap();
    profiler.stop();

    let data = std::fs::read(&file).unwrap();
    let chunks = inspect::read_chunks(&file).unwrap();

    // The metadata element tree declares the event types in each chunk.
    for chunk in &chunks {
        let bytes = chunk_bytes(&data, chunk);
        assert!(contains(&bytes, b"profiler.ExecutionSample"));
        assert!(contains(&bytes, b"profiler.HeapLiveObject"));
    }
    // Settings are written once, when the recording opens.
    let first = chunk_bytes(&data, &chunks[0]);
    assert!(contains(&first, b"chunksize"));
}

#[test]
fn test_stop_without_samples_still_valid() {
    let dir = TempDir::new().unwrap();
    let args = test_args(&dir);
    let file = args.file.clone();
    let profiler = Profiler::new(args, runtime_with_fixtures()).unwrap();

    profiler.start().unwrap();
    profiler.stop();

    assert!(inspect::validate(&file).unwrap().is_empty());
    let chunks = inspect::read_chunks(&file).unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].cpool_offset > 68);
}
