use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use nix::sys::resource::{getrusage, UsageWho};

/// Sentinel for "could not read" in CPU time snapshots, mirrored in the
/// ratio computations which skip deltas against it.
pub const NO_CPU_TIME: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTime {
    pub real: u64,
    pub user: u64,
    pub system: u64,
}

fn clock_value(clock_id: libc::c_int) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// Wall clock, microseconds since the epoch.
pub fn micros() -> u64 {
    clock_value(libc::CLOCK_REALTIME) / 1_000
}

/// Monotonic clock, nanoseconds.
pub fn nanotime() -> u64 {
    clock_value(libc::CLOCK_MONOTONIC)
}

pub fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub fn available_processors() -> i32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        1
    } else {
        n as i32
    }
}

/// CPU time consumed by this process. `real` is the monotonic clock so the
/// caller can compute utilization ratios against wall time.
pub fn process_cpu_time() -> CpuTime {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let user = usage.user_time();
            let system = usage.system_time();
            CpuTime {
                real: nanotime(),
                user: user.tv_sec() as u64 * 1_000_000_000 + user.tv_usec() as u64 * 1_000,
                system: system.tv_sec() as u64 * 1_000_000_000 + system.tv_usec() as u64 * 1_000,
            }
        }
        Err(_) => CpuTime {
            real: NO_CPU_TIME,
            ..CpuTime::default()
        },
    }
}

/// Machine-wide CPU time from /proc/stat, in jiffies. `real` includes idle
/// time, so user/system deltas over a real delta give a machine load ratio.
pub fn total_cpu_time() -> CpuTime {
    let buf = match std::fs::read_to_string("/proc/stat") {
        Ok(buf) => buf,
        Err(_) => {
            return CpuTime {
                real: NO_CPU_TIME,
                ..CpuTime::default()
            }
        }
    };

    let line = match buf.lines().next() {
        Some(line) if line.starts_with("cpu ") => line,
        _ => {
            return CpuTime {
                real: NO_CPU_TIME,
                ..CpuTime::default()
            }
        }
    };

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 7 {
        return CpuTime {
            real: NO_CPU_TIME,
            ..CpuTime::default()
        };
    }

    // cpu user nice system idle iowait irq softirq ...
    CpuTime {
        real: fields.iter().sum(),
        user: fields[0] + fields[1],
        system: fields[2] + fields[5] + fields[6],
    }
}

/// First "model name" entry from /proc/cpuinfo.
pub fn cpu_description() -> Option<String> {
    let buf = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in buf.lines() {
        if line.starts_with("model name") {
            return line.split(':').nth(1).map(|s| s.trim().to_string());
        }
    }
    None
}

/// Copy `[start, end)` of `src` to the current end of `dst`.
pub fn copy_file(src: &File, dst: &File, start: u64, end: u64) -> io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut src_off = start;
    let mut dst_off = dst.metadata()?.len();
    let mut copied = 0u64;

    while src_off < end {
        let want = ((end - src_off) as usize).min(buf.len());
        let n = src.read_at(&mut buf[..want], src_off)?;
        if n == 0 {
            break;
        }
        dst.write_all_at(&buf[..n], dst_off)?;
        src_off += n as u64;
        dst_off += n as u64;
        copied += n as u64;
    }
    Ok(copied)
}

/// Hint the kernel to drop the first `len` bytes of the file from the page
/// cache. Recording files are write-once, so keeping them cached only evicts
/// more useful pages.
pub fn free_page_cache(file: &File, len: u64) {
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            0,
            len as libc::off_t,
            libc::POSIX_FADV_DONTNEED,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clocks_advance() {
        let a = nanotime();
        let b = nanotime();
        assert!(b >= a);
        assert!(micros() > 0);
    }

    #[test]
    fn test_process_cpu_time() {
        let t = process_cpu_time();
        assert_ne!(t.real, NO_CPU_TIME);
    }

    #[test]
    fn test_copy_file_range() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        let mut src = File::create(&src_path).unwrap();
        src.write_all(b"0123456789").unwrap();
        let src = File::open(&src_path).unwrap();
        let dst = File::create(&dst_path).unwrap();

        let copied = copy_file(&src, &dst, 2, 7).unwrap();
        assert_eq!(copied, 5);
        assert_eq!(std::fs::read(&dst_path).unwrap(), b"23456");
    }
}
