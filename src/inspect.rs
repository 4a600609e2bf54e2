//! Offline reading of recording files: chunk-header walking and the
//! structural checks behind `flare validate`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};

pub const CHUNK_HEADER_SIZE: usize = 68;
pub const MAGIC: &[u8; 4] = b"FLR\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub offset: u64,
    pub major: u16,
    pub minor: u16,
    pub chunk_size: u64,
    pub cpool_offset: u64,
    pub meta_offset: u64,
    pub start_time_ns: u64,
    pub duration_ns: u64,
    pub start_ticks: u64,
    pub ticks_per_sec: u64,
    pub features: u32,
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes(data[at..at + 2].try_into().unwrap())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(data[at..at + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(data[at..at + 8].try_into().unwrap())
}

impl ChunkHeader {
    pub fn parse(data: &[u8], offset: u64) -> Result<Self> {
        if data.len() < CHUNK_HEADER_SIZE {
            bail!("truncated chunk header at offset {offset}");
        }
        if &data[0..4] != MAGIC {
            bail!("bad magic at offset {offset}");
        }
        Ok(ChunkHeader {
            offset,
            major: read_u16(data, 4),
            minor: read_u16(data, 6),
            chunk_size: read_u64(data, 8),
            cpool_offset: read_u64(data, 16),
            meta_offset: read_u64(data, 24),
            start_time_ns: read_u64(data, 32),
            duration_ns: read_u64(data, 40),
            start_ticks: read_u64(data, 48),
            ticks_per_sec: read_u64(data, 56),
            features: read_u32(data, 64),
        })
    }
}

/// Walk every chunk header in a recording file.
pub fn read_chunks(path: &Path) -> Result<Vec<ChunkHeader>> {
    let mut file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let len = file.metadata()?.len();
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut chunks = Vec::new();
    let mut offset = 0u64;
    while offset < len {
        let header = ChunkHeader::parse(&data[offset as usize..], offset)?;
        if header.chunk_size == 0 {
            bail!("zero-sized chunk at offset {offset}");
        }
        chunks.push(header);
        offset += header.chunk_size;
    }
    Ok(chunks)
}

/// Structural invariants of a finished recording: magic per chunk, chunk
/// sizes chaining exactly to EOF, and the constant pool inside the chunk.
pub fn validate(path: &Path) -> Result<Vec<String>> {
    let len = std::fs::metadata(path)?.len();
    let mut problems = Vec::new();

    let chunks = read_chunks(path)?;
    if chunks.is_empty() {
        problems.push("no chunks in file".to_string());
        return Ok(problems);
    }

    let mut expected_offset = 0u64;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.offset != expected_offset {
            problems.push(format!(
                "chunk {i}: starts at {} instead of {expected_offset}",
                chunk.offset
            ));
        }
        if chunk.meta_offset != CHUNK_HEADER_SIZE as u64 {
            problems.push(format!(
                "chunk {i}: metadata offset {} (expected {CHUNK_HEADER_SIZE})",
                chunk.meta_offset
            ));
        }
        if chunk.cpool_offset == 0 || chunk.cpool_offset >= chunk.chunk_size {
            problems.push(format!(
                "chunk {i}: constant pool offset {} outside chunk of {} bytes",
                chunk.cpool_offset, chunk.chunk_size
            ));
        }
        if chunk.ticks_per_sec == 0 {
            problems.push(format!("chunk {i}: zero tick frequency"));
        }
        expected_offset += chunk.chunk_size;
    }
    if expected_offset != len {
        problems.push(format!(
            "chunks cover {expected_offset} bytes but the file is {len}"
        ));
    }

    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_bad_magic() {
        let data = vec![0u8; CHUNK_HEADER_SIZE];
        assert!(ChunkHeader::parse(&data, 0).is_err());
    }

    #[test]
    fn test_parse_reads_fields() {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&1000u64.to_be_bytes()); // chunk size
        data.extend_from_slice(&900u64.to_be_bytes()); // cpool
        data.extend_from_slice(&68u64.to_be_bytes()); // meta
        data.extend_from_slice(&123u64.to_be_bytes()); // start ns
        data.extend_from_slice(&456u64.to_be_bytes()); // duration
        data.extend_from_slice(&789u64.to_be_bytes()); // ticks
        data.extend_from_slice(&1_000_000_000u64.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());

        let header = ChunkHeader::parse(&data, 0).unwrap();
        assert_eq!(header.major, 2);
        assert_eq!(header.chunk_size, 1000);
        assert_eq!(header.cpool_offset, 900);
        assert_eq!(header.start_time_ns, 123);
        assert_eq!(header.duration_ns, 456);
        assert_eq!(header.ticks_per_sec, 1_000_000_000);
        assert_eq!(header.features, 1);
    }
}
