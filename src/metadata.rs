//! The self-describing layer of the recording format.
//!
//! Every chunk opens with a metadata event carrying an element tree that
//! declares each event type and its fields against a string table, so a
//! reader needs nothing but the chunk itself to decode it. Type tags are a
//! stable enum; renumbering them would break recordings already on disk.

use std::collections::HashMap;

use crate::buffer::{decode_var64, Buffer};

pub const T_METADATA: u32 = 0;
pub const T_CPOOL: u32 = 1;

// Primitive classes referenced by field declarations.
pub const T_BOOLEAN: u32 = 4;
pub const T_CHAR: u32 = 5;
pub const T_FLOAT: u32 = 6;
pub const T_DOUBLE: u32 = 7;
pub const T_BYTE: u32 = 8;
pub const T_SHORT: u32 = 9;
pub const T_INT: u32 = 10;
pub const T_LONG: u32 = 11;
pub const T_STRING: u32 = 20;

// Constant-pool types, in chunk emission order.
pub const T_FRAME_TYPE: u32 = 24;
pub const T_THREAD_STATE: u32 = 25;
pub const T_THREAD: u32 = 26;
pub const T_STACK_TRACE: u32 = 27;
pub const T_METHOD: u32 = 28;
pub const T_CLASS: u32 = 29;
pub const T_PACKAGE: u32 = 30;
pub const T_SYMBOL: u32 = 31;
pub const T_STRING_POOL: u32 = 32;
pub const T_LOG_LEVEL: u32 = 33;

// Event types.
pub const T_EXECUTION_SAMPLE: u32 = 101;
pub const T_METHOD_SAMPLE: u32 = 102;
pub const T_ALLOC_IN_NEW_TLAB: u32 = 103;
pub const T_ALLOC_OUTSIDE_TLAB: u32 = 104;
pub const T_MONITOR_ENTER: u32 = 105;
pub const T_THREAD_PARK: u32 = 106;
pub const T_HEAP_LIVE_OBJECT: u32 = 107;
pub const T_QUEUE_TIME: u32 = 108;
pub const T_ENDPOINT: u32 = 109;
pub const T_CPU_LOAD: u32 = 110;
pub const T_WALLCLOCK_EPOCH: u32 = 111;
pub const T_LOG: u32 = 112;
pub const T_ACTIVE_RECORDING: u32 = 113;
pub const T_ACTIVE_SETTING: u32 = 114;
pub const T_OS_INFORMATION: u32 = 115;
pub const T_CPU_INFORMATION: u32 = 116;
pub const T_RUNTIME_INFORMATION: u32 = 117;
pub const T_INITIAL_SYSTEM_PROPERTY: u32 = 118;
pub const T_NATIVE_LIBRARY: u32 = 119;
pub const T_HEAP_USAGE: u32 = 120;

struct FieldDef {
    name: &'static str,
    class_id: u32,
    constant_pool: bool,
}

struct TypeDef {
    id: u32,
    name: &'static str,
    fields: &'static [FieldDef],
}

const fn field(name: &'static str, class_id: u32) -> FieldDef {
    FieldDef {
        name,
        class_id,
        constant_pool: false,
    }
}

const fn cpool_field(name: &'static str, class_id: u32) -> FieldDef {
    FieldDef {
        name,
        class_id,
        constant_pool: true,
    }
}

/// Declares everything the recorder emits. The encoders in the recorder
/// module follow these layouts field for field.
const TYPES: &[TypeDef] = &[
    TypeDef { id: T_BOOLEAN, name: "boolean", fields: &[] },
    TypeDef { id: T_CHAR, name: "char", fields: &[] },
    TypeDef { id: T_FLOAT, name: "float", fields: &[] },
    TypeDef { id: T_DOUBLE, name: "double", fields: &[] },
    TypeDef { id: T_BYTE, name: "byte", fields: &[] },
    TypeDef { id: T_SHORT, name: "short", fields: &[] },
    TypeDef { id: T_INT, name: "int", fields: &[] },
    TypeDef { id: T_LONG, name: "long", fields: &[] },
    TypeDef { id: T_STRING, name: "java.lang.String", fields: &[] },
    TypeDef {
        id: T_FRAME_TYPE,
        name: "profiler.types.FrameType",
        fields: &[field("description", T_STRING)],
    },
    TypeDef {
        id: T_THREAD_STATE,
        name: "profiler.types.ThreadState",
        fields: &[field("name", T_STRING)],
    },
    TypeDef {
        id: T_THREAD,
        name: "profiler.types.Thread",
        fields: &[
            field("osName", T_STRING),
            field("osThreadId", T_LONG),
            field("javaName", T_STRING),
            field("javaThreadId", T_LONG),
        ],
    },
    TypeDef {
        id: T_STACK_TRACE,
        name: "profiler.types.StackTrace",
        fields: &[
            field("truncated", T_BOOLEAN),
            cpool_field("frames", T_METHOD),
        ],
    },
    TypeDef {
        id: T_METHOD,
        name: "profiler.types.Method",
        fields: &[
            cpool_field("type", T_CLASS),
            cpool_field("name", T_SYMBOL),
            cpool_field("descriptor", T_SYMBOL),
            field("modifiers", T_INT),
            field("hidden", T_BOOLEAN),
        ],
    },
    TypeDef {
        id: T_CLASS,
        name: "java.lang.Class",
        fields: &[
            cpool_field("classLoader", T_CLASS),
            cpool_field("name", T_SYMBOL),
            cpool_field("package", T_PACKAGE),
            field("modifiers", T_INT),
        ],
    },
    TypeDef {
        id: T_PACKAGE,
        name: "profiler.types.Package",
        fields: &[cpool_field("name", T_SYMBOL)],
    },
    TypeDef {
        id: T_SYMBOL,
        name: "profiler.types.Symbol",
        fields: &[field("string", T_STRING)],
    },
    TypeDef {
        id: T_STRING_POOL,
        name: "profiler.types.StringLabel",
        fields: &[field("string", T_STRING)],
    },
    TypeDef {
        id: T_LOG_LEVEL,
        name: "profiler.types.LogLevel",
        fields: &[field("name", T_STRING)],
    },
    TypeDef {
        id: T_EXECUTION_SAMPLE,
        name: "profiler.ExecutionSample",
        fields: &[
            field("startTime", T_LONG),
            cpool_field("sampledThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("state", T_THREAD_STATE),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
            field("weight", T_LONG),
        ],
    },
    TypeDef {
        id: T_METHOD_SAMPLE,
        name: "profiler.MethodSample",
        fields: &[
            field("startTime", T_LONG),
            cpool_field("sampledThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("state", T_THREAD_STATE),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
            field("weight", T_LONG),
            field("parallelism", T_INT),
        ],
    },
    TypeDef {
        id: T_ALLOC_IN_NEW_TLAB,
        name: "profiler.ObjectAllocationInNewTLAB",
        fields: &[
            field("startTime", T_LONG),
            cpool_field("sampledThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("objectClass", T_CLASS),
            field("allocationSize", T_LONG),
            field("tlabSize", T_LONG),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
        ],
    },
    TypeDef {
        id: T_ALLOC_OUTSIDE_TLAB,
        name: "profiler.ObjectAllocationOutsideTLAB",
        fields: &[
            field("startTime", T_LONG),
            cpool_field("sampledThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("objectClass", T_CLASS),
            field("allocationSize", T_LONG),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
        ],
    },
    TypeDef {
        id: T_MONITOR_ENTER,
        name: "profiler.JavaMonitorEnter",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            cpool_field("eventThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("monitorClass", T_CLASS),
            cpool_field("previousOwner", T_THREAD),
            field("address", T_LONG),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
        ],
    },
    TypeDef {
        id: T_THREAD_PARK,
        name: "profiler.ThreadPark",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            cpool_field("eventThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("parkedClass", T_CLASS),
            field("timeout", T_LONG),
            field("until", T_LONG),
            field("address", T_LONG),
        ],
    },
    TypeDef {
        id: T_HEAP_LIVE_OBJECT,
        name: "profiler.HeapLiveObject",
        fields: &[
            field("startTime", T_LONG),
            cpool_field("eventThread", T_THREAD),
            cpool_field("stackTrace", T_STACK_TRACE),
            cpool_field("objectClass", T_CLASS),
            field("objectAge", T_LONG),
            field("allocationSize", T_LONG),
            field("samplingInterval", T_LONG),
        ],
    },
    TypeDef {
        id: T_QUEUE_TIME,
        name: "profiler.QueueTime",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            cpool_field("origin", T_THREAD),
            cpool_field("task", T_CLASS),
            cpool_field("scheduler", T_CLASS),
            field("queueLength", T_LONG),
        ],
    },
    TypeDef {
        id: T_ENDPOINT,
        name: "profiler.Endpoint",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            cpool_field("eventThread", T_THREAD),
            cpool_field("label", T_STRING_POOL),
            field("localRootSpanId", T_LONG),
        ],
    },
    TypeDef {
        id: T_CPU_LOAD,
        name: "profiler.CPULoad",
        fields: &[
            field("startTime", T_LONG),
            field("jvmUser", T_FLOAT),
            field("jvmSystem", T_FLOAT),
            field("machineTotal", T_FLOAT),
        ],
    },
    TypeDef {
        id: T_WALLCLOCK_EPOCH,
        name: "profiler.WallClockEpoch",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            field("samplableThreads", T_LONG),
            field("successfulSamples", T_LONG),
            field("failedSamples", T_LONG),
            field("exitedThreads", T_LONG),
            field("permissionDenied", T_LONG),
        ],
    },
    TypeDef {
        id: T_LOG,
        name: "profiler.Log",
        fields: &[
            field("startTime", T_LONG),
            cpool_field("level", T_LOG_LEVEL),
            field("message", T_STRING),
        ],
    },
    TypeDef {
        id: T_ACTIVE_RECORDING,
        name: "profiler.ActiveRecording",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            cpool_field("eventThread", T_THREAD),
            field("name", T_STRING),
            field("destination", T_STRING),
            field("maxAge", T_LONG),
            field("maxSize", T_LONG),
            field("recordingStart", T_LONG),
            field("recordingDuration", T_LONG),
        ],
    },
    TypeDef {
        id: T_ACTIVE_SETTING,
        name: "profiler.ActiveSetting",
        fields: &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            cpool_field("eventThread", T_THREAD),
            field("id", T_LONG),
            field("name", T_STRING),
            field("value", T_STRING),
        ],
    },
    TypeDef {
        id: T_OS_INFORMATION,
        name: "profiler.OSInformation",
        fields: &[field("startTime", T_LONG), field("osVersion", T_STRING)],
    },
    TypeDef {
        id: T_CPU_INFORMATION,
        name: "profiler.CPUInformation",
        fields: &[
            field("startTime", T_LONG),
            field("cpu", T_STRING),
            field("description", T_STRING),
            field("sockets", T_INT),
            field("cores", T_INT),
            field("hwThreads", T_INT),
        ],
    },
    TypeDef {
        id: T_RUNTIME_INFORMATION,
        name: "profiler.RuntimeInformation",
        fields: &[
            field("startTime", T_LONG),
            field("vmName", T_STRING),
            field("vmVersion", T_STRING),
            field("vmArguments", T_STRING),
            field("vmFlags", T_STRING),
            field("command", T_STRING),
            field("vmStartTime", T_LONG),
            field("pid", T_LONG),
        ],
    },
    TypeDef {
        id: T_INITIAL_SYSTEM_PROPERTY,
        name: "profiler.InitialSystemProperty",
        fields: &[
            field("startTime", T_LONG),
            field("key", T_STRING),
            field("value", T_STRING),
        ],
    },
    TypeDef {
        id: T_NATIVE_LIBRARY,
        name: "profiler.NativeLibrary",
        fields: &[
            field("startTime", T_LONG),
            field("name", T_STRING),
            field("baseAddress", T_LONG),
            field("topAddress", T_LONG),
        ],
    },
    TypeDef {
        id: T_HEAP_USAGE,
        name: "profiler.HeapUsage",
        fields: &[
            field("startTime", T_LONG),
            field("used", T_LONG),
            field("atLastGC", T_BOOLEAN),
        ],
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: u32,
    pub attributes: Vec<(u32, u32)>,
    pub children: Vec<Element>,
}

/// The metadata element tree plus the string table it indexes into, built
/// once per recording from [`TYPES`].
pub struct Metadata {
    strings: Vec<String>,
    root: Element,
}

struct Interner {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl Interner {
    fn new() -> Self {
        Interner {
            strings: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.index.get(s) {
            return *idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::build()
    }
}

impl Metadata {
    pub fn build() -> Self {
        let mut interner = Interner::new();

        let mut classes = Vec::with_capacity(TYPES.len());
        for ty in TYPES {
            let mut attributes = vec![
                (interner.intern("name"), interner.intern(ty.name)),
                (interner.intern("id"), interner.intern(&ty.id.to_string())),
            ];
            if ty.fields.is_empty() {
                attributes.push((interner.intern("simpleType"), interner.intern("true")));
            }
            let children = ty
                .fields
                .iter()
                .map(|f| {
                    let mut attrs = vec![
                        (interner.intern("name"), interner.intern(f.name)),
                        (
                            interner.intern("class"),
                            interner.intern(&f.class_id.to_string()),
                        ),
                    ];
                    if f.constant_pool {
                        attrs.push((interner.intern("constantPool"), interner.intern("true")));
                    }
                    Element {
                        name: interner.intern("field"),
                        attributes: attrs,
                        children: Vec::new(),
                    }
                })
                .collect();
            classes.push(Element {
                name: interner.intern("class"),
                attributes,
                children,
            });
        }

        let metadata = Element {
            name: interner.intern("metadata"),
            attributes: Vec::new(),
            children: classes,
        };
        let region = Element {
            name: interner.intern("region"),
            attributes: Vec::new(),
            children: Vec::new(),
        };
        let root = Element {
            name: interner.intern("root"),
            attributes: Vec::new(),
            children: vec![metadata, region],
        };

        Metadata {
            strings: interner.strings,
            root,
        }
    }

    /// The full metadata event: reserved size slot, type tag, ticks, the
    /// string table, then the element tree.
    pub fn write(&self, buf: &mut Buffer, start_ticks: u64) {
        let start = buf.skip(5);
        buf.put_var64(T_METADATA as u64);
        buf.put_var64(start_ticks);
        buf.put_u8(0);
        buf.put_u8(1);

        buf.put_var64(self.strings.len() as u64);
        for s in &self.strings {
            buf.put_utf8(s);
        }

        write_element(buf, &self.root);

        buf.patch_var32(start, (buf.offset() - start) as u32);
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }
}

pub fn write_element(buf: &mut Buffer, e: &Element) {
    buf.put_var64(e.name as u64);

    buf.put_var64(e.attributes.len() as u64);
    for (key, value) in &e.attributes {
        buf.put_var64(*key as u64);
        buf.put_var64(*value as u64);
    }

    buf.put_var64(e.children.len() as u64);
    for child in &e.children {
        write_element(buf, child);
    }
}

/// Mirror of [`write_element`], used by the inspection tool and the
/// round-trip tests.
pub fn read_element(data: &[u8], pos: &mut usize) -> Option<Element> {
    let name = decode_var64(data, pos)? as u32;

    let num_attributes = decode_var64(data, pos)?;
    let mut attributes = Vec::with_capacity(num_attributes as usize);
    for _ in 0..num_attributes {
        let key = decode_var64(data, pos)? as u32;
        let value = decode_var64(data, pos)? as u32;
        attributes.push((key, value));
    }

    let num_children = decode_var64(data, pos)?;
    let mut children = Vec::with_capacity(num_children as usize);
    for _ in 0..num_children {
        children.push(read_element(data, pos)?);
    }

    Some(Element {
        name,
        attributes,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_tree_roundtrip() {
        let metadata = Metadata::build();
        let mut buf = Buffer::with_capacity(256 * 1024);
        write_element(&mut buf, metadata.root());

        let mut pos = 0;
        let decoded = read_element(buf.data(), &mut pos).unwrap();
        assert_eq!(pos, buf.offset());
        assert_eq!(&decoded, metadata.root());
    }

    #[test]
    fn test_every_event_type_declared() {
        let metadata = Metadata::build();
        let names = metadata.strings();
        let metadata_elem = &metadata.root().children[0];
        let declared: Vec<&str> = metadata_elem
            .children
            .iter()
            .map(|class| {
                let name_key = class.attributes[0].1;
                names[name_key as usize].as_str()
            })
            .collect();
        for expected in [
            "profiler.ExecutionSample",
            "profiler.MethodSample",
            "profiler.HeapLiveObject",
            "profiler.CPULoad",
            "profiler.Log",
            "profiler.QueueTime",
            "profiler.NativeLibrary",
        ] {
            assert!(declared.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_string_table_deduplicates() {
        let metadata = Metadata::build();
        let mut sorted = metadata.strings().to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), metadata.strings().len());
    }

    #[test]
    fn test_metadata_event_size_patched() {
        let metadata = Metadata::build();
        let mut buf = Buffer::with_capacity(256 * 1024);
        metadata.write(&mut buf, 12345);

        let mut pos = 0;
        let size = decode_var64(buf.data(), &mut pos).unwrap();
        assert_eq!(size as usize, buf.offset());
        assert_eq!(decode_var64(buf.data(), &mut pos).unwrap(), T_METADATA as u64);
        assert_eq!(decode_var64(buf.data(), &mut pos).unwrap(), 12345);
    }
}
