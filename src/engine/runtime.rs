// AXON IOK — ENGINE: RUNTIME MODULE
// Infrastructure under the egress path that isn't the datapath itself:
// fatal exit diagnostics, monotonic clock, rate-limited warnings, prefetch,
// CPU pinning, and the SHM-mapped telemetry counters + monitor.

use std::ffi::CString;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use libc::{
    close, ftruncate, mmap, off_t, shm_open, MAP_FAILED, MAP_SHARED, O_CREAT, O_RDWR, PROT_READ,
    PROT_WRITE, S_IRUSR, S_IWUSR,
};

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Boot, 0x20-0x2F = Runtime, 0x30-0x3F = Transport

pub const E_NO_ISOLATED_CORES: i32 = 0x10;
pub const E_AFFINITY_FAIL: i32 = 0x11;
pub const E_AFFINITY_VERIFY: i32 = 0x12;
pub const E_SHM_MAP_FAIL: i32 = 0x13;
pub const E_CTL_SOCK_FAIL: i32 = 0x14;
pub const E_BAD_CONFIG: i32 = 0x15;
pub const E_UMEM_ALLOC_FAIL: i32 = 0x30;
pub const E_XSK_BIND_FAIL: i32 = 0x31;

/// Structured fatal exit: no heap allocation, no unwinding, no formatting.
/// Emits "[AXON FATAL 0xHH] msg\n" to stderr in a single writev, then exits
/// with the code.
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    let prefix = b"[AXON FATAL 0x";
    let hex = [
        b"0123456789ABCDEF"[((code >> 4) & 0xF) as usize],
        b"0123456789ABCDEF"[(code & 0xF) as usize],
    ];
    let suffix = b"] ";
    let newline = b"\n";
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut _, iov_len: prefix.len() },
        libc::iovec { iov_base: hex.as_ptr() as *mut _, iov_len: 2 },
        libc::iovec { iov_base: suffix.as_ptr() as *mut _, iov_len: suffix.len() },
        libc::iovec { iov_base: msg.as_ptr() as *mut _, iov_len: msg.len() },
        libc::iovec { iov_base: newline.as_ptr() as *mut _, iov_len: 1 },
    ];
    // SAFETY: writev(2, ...) to stderr; every iovec points at live stack or
    // static bytes with correct lengths.
    unsafe { libc::writev(2, iov.as_ptr(), 5) };
    std::process::exit(code);
}

// ============================================================================
// CLOCK + RATE-LIMITED WARNINGS
// ============================================================================

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: FFI call with a valid mutable timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Interval gate for hot-path warnings: a runtime that wedges its ingress
/// ring must not turn stderr into the bottleneck. Tracks how many events the
/// gate swallowed since the last pass.
pub struct WarnLimiter {
    interval_ns: u64,
    last_ns: u64,
    suppressed: u64,
}

pub const WARN_INTERVAL_NS: u64 = 100_000_000; // 100ms = 10/sec max

impl WarnLimiter {
    pub fn new(interval_ns: u64) -> WarnLimiter {
        WarnLimiter { interval_ns, last_ns: 0, suppressed: 0 }
    }

    /// Returns Some(events swallowed since the last pass) when the caller may
    /// log, None when the event should stay silent.
    #[inline(always)]
    pub fn allow(&mut self, now_ns: u64) -> Option<u64> {
        if now_ns.saturating_sub(self.last_ns) < self.interval_ns {
            self.suppressed += 1;
            return None;
        }
        self.last_ns = now_ns;
        let swallowed = self.suppressed;
        self.suppressed = 0;
        Some(swallowed)
    }
}

// ============================================================================
// PREFETCH (HOT PATH CACHE HINT)
// ============================================================================

/// # Safety
/// `addr` must be a valid readable pointer. Prefetch is a hint; an invalid
/// address faults nowhere on x86_64/aarch64 but may pollute cache.
#[inline(always)]
pub unsafe fn prefetch_read_l1(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    {
        core::arch::x86_64::_mm_prefetch(addr as *const i8, core::arch::x86_64::_MM_HINT_T0);
    }
    #[cfg(target_arch = "aarch64")]
    {
        core::arch::asm!("prfm pldl1keep, [{addr}]", addr = in(reg) addr, options(nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = addr;
    }
}

// ============================================================================
// CPU MANAGEMENT (core discovery, pinning, affinity verification)
// ============================================================================

pub fn discover_isolated_cores() -> Vec<usize> {
    if let Ok(mock) = std::env::var("AXON_MOCK_CMDLINE") {
        if let Some(part) = mock.split_whitespace().find(|p| p.starts_with("isolcpus=")) {
            return parse_cpu_list(part.strip_prefix("isolcpus=").unwrap_or(""));
        }
        return Vec::new();
    }
    match std::fs::read_to_string("/sys/devices/system/cpu/isolated") {
        Ok(s) => parse_cpu_list(s.trim()),
        Err(_) => Vec::new(),
    }
}

pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    for part in list.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = match lo.parse() {
                    Ok(v) => v,
                    Err(_) => fatal(E_NO_ISOLATED_CORES, "Invalid CPU range in isolcpus"),
                };
                let hi: usize = match hi.parse() {
                    Ok(v) => v,
                    Err(_) => fatal(E_NO_ISOLATED_CORES, "Invalid CPU range in isolcpus"),
                };
                cores.extend(lo..=hi);
            }
            None => {
                if let Ok(id) = part.parse::<usize>() {
                    cores.push(id);
                }
            }
        }
    }
    cores.sort();
    cores.dedup();
    cores
}

pub fn pin_to_core(core_id: usize) {
    // SAFETY: cpu_set_t is repr(C) and all-zeroes is a valid bit pattern.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            fatal(E_AFFINITY_FAIL, "sched_setaffinity failed");
        }
    }
}

pub fn verify_affinity(expected_core: usize) {
    use std::io::BufRead;
    if std::env::var("AXON_MOCK_CMDLINE").is_ok() {
        return;
    }
    let file = match std::fs::File::open("/proc/self/status") {
        Ok(f) => f,
        Err(_) => fatal(E_AFFINITY_VERIFY, "Cannot open /proc/self/status"),
    };
    for l in std::io::BufReader::new(file).lines().map_while(Result::ok) {
        if let Some(mask) = l.strip_prefix("Cpus_allowed_list:") {
            if mask.trim() != expected_core.to_string() {
                fatal(E_AFFINITY_VERIFY, "Core affinity mismatch");
            }
            return;
        }
    }
    fatal(E_AFFINITY_VERIFY, "Could not verify affinity");
}

// ============================================================================
// TELEMETRY — SHM-mapped egress counters
// ============================================================================

pub const SHM_NAME_PREFIX: &str = "/axon_telem_";

#[repr(align(128))]
pub struct CachePadded<T> {
    pub value: T,
}

/// Egress-path telemetry. Memory-mapped via /dev/shm for zero-copy
/// cross-process reads; all fields are atomics under Relaxed ordering
/// (diagnostic, not synchronization).
#[repr(C)]
pub struct Telemetry {
    pub pid: CachePadded<AtomicU32>,
    /// Descriptors pulled from egress rings.
    pub tx_pulled: CachePadded<AtomicU64>,
    /// Driver-ready segments produced (pass-through + GSO).
    pub tx_segs: CachePadded<AtomicU64>,
    /// tx_burst calls that moved work.
    pub tx_bursts: CachePadded<AtomicU64>,
    /// Segments the driver refused and the engine carried over.
    pub tx_backpressure: CachePadded<AtomicU64>,
    /// Segments counted as failed transmissions (pool exhaustion).
    pub tx_fail: CachePadded<AtomicU64>,
    /// Descriptors dropped as malformed (error completion delivered).
    pub tx_malformed: CachePadded<AtomicU64>,
    /// Completions enqueued to ingress rings (direct path).
    pub compl_enqueued: CachePadded<AtomicU64>,
    /// Completions spilled into overflow queues.
    pub compl_overflow: CachePadded<AtomicU64>,
    /// Completions moved out of overflow queues by the drain.
    pub compl_drained: CachePadded<AtomicU64>,
    /// Completions lost to a full overflow queue.
    pub compl_dropped: CachePadded<AtomicU64>,
    /// Completions suppressed because the runtime was killed.
    pub compl_killed: CachePadded<AtomicU64>,
    /// Runtimes terminated for protocol violations.
    pub procs_killed: CachePadded<AtomicU64>,
}

/// Raw pointer wrapper for the shared-memory telemetry block. Deliberately
/// not &'static mut: several processes map the same /dev/shm page, and all
/// access goes through the atomic fields.
pub struct TelemetryPtr(*mut Telemetry);

// SAFETY: all fields are atomics; one writer + N readers across processes.
unsafe impl Send for TelemetryPtr {}

impl std::ops::Deref for TelemetryPtr {
    type Target = Telemetry;
    // SAFETY: the pointer came from mmap of an object sized >= Telemetry and
    // the mapping lives for the process lifetime.
    fn deref(&self) -> &Telemetry {
        unsafe { &*self.0 }
    }
}

impl Telemetry {
    pub fn map(is_owner: bool) -> TelemetryPtr {
        match Self::map_named(&format!("{}tx", SHM_NAME_PREFIX), is_owner) {
            Some(t) => t,
            None => fatal(E_SHM_MAP_FAIL, "Telemetry shm map failed"),
        }
    }

    pub fn try_map() -> Option<TelemetryPtr> {
        Self::map_named(&format!("{}tx", SHM_NAME_PREFIX), false)
    }

    fn map_named(name: &str, is_owner: bool) -> Option<TelemetryPtr> {
        // SAFETY: shm_open/ftruncate/mmap FFI; the mapping is MAP_SHARED and
        // never unmapped; owner zeroes the fresh object before first use.
        unsafe {
            let c_name = CString::new(name).ok()?;
            let mut fd = shm_open(c_name.as_ptr(), O_RDWR, 0);
            if is_owner {
                if fd < 0 {
                    fd = shm_open(c_name.as_ptr(), O_CREAT | O_RDWR, S_IRUSR | S_IWUSR);
                }
                if fd < 0 {
                    return None;
                }
                if ftruncate(fd, mem::size_of::<Telemetry>() as off_t) != 0 {
                    close(fd);
                    return None;
                }
            } else if fd < 0 {
                return None;
            }
            let p = mmap(
                ptr::null_mut(),
                mem::size_of::<Telemetry>(),
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            );
            close(fd);
            if p == MAP_FAILED {
                return None;
            }
            if is_owner {
                ptr::write_bytes(p, 0, mem::size_of::<Telemetry>());
            }
            Some(TelemetryPtr(p as *mut Telemetry))
        }
    }
}

// ============================================================================
// MONITOR (cross-process telemetry reader)
// ============================================================================

pub fn run_monitor() {
    eprintln!("[AXON-MON] Waiting for transmit thread telemetry...");
    let telem = loop {
        if let Some(t) = Telemetry::try_map() {
            break t;
        }
        std::thread::sleep(Duration::from_millis(500));
    };
    eprintln!("[AXON-MON] Attached (tx pid {}).", telem.pid.value.load(Ordering::Relaxed));
    eprintln!("----------------------------------------------------------------------");
    let mut last_segs = 0u64;
    loop {
        let pulled = telem.tx_pulled.value.load(Ordering::Relaxed);
        let segs = telem.tx_segs.value.load(Ordering::Relaxed);
        let bp = telem.tx_backpressure.value.load(Ordering::Relaxed);
        let fail = telem.tx_fail.value.load(Ordering::Relaxed);
        let mal = telem.tx_malformed.value.load(Ordering::Relaxed);
        let enq = telem.compl_enqueued.value.load(Ordering::Relaxed);
        let ovf = telem.compl_overflow.value.load(Ordering::Relaxed);
        let drn = telem.compl_drained.value.load(Ordering::Relaxed);
        let lost = telem.compl_dropped.value.load(Ordering::Relaxed);
        let kills = telem.procs_killed.value.load(Ordering::Relaxed);
        let pps = segs - last_segs;
        last_segs = segs;
        eprint!(
            "\r[TELEM] PULL:{:<11} SEG:{:<11} PPS:{:<9} BP:{:<8} FAIL:{:<7} MAL:{:<6} CMPL:{:<11} OVF:{}/{}/{} KILL:{}   ",
            pulled, segs, pps, bp, fail, mal, enq, ovf, drn, lost, kills
        );
        std::thread::sleep(Duration::from_secs(1));
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_list_parsing() {
        assert_eq!(parse_cpu_list(""), Vec::<usize>::new());
        assert_eq!(parse_cpu_list("3"), vec![3]);
        assert_eq!(parse_cpu_list("1,3,5"), vec![1, 3, 5]);
        assert_eq!(parse_cpu_list("2-5"), vec![2, 3, 4, 5]);
        assert_eq!(parse_cpu_list("5,2-3,2"), vec![2, 3, 5]);
    }

    #[test]
    fn warn_limiter_gates_and_counts() {
        let mut w = WarnLimiter::new(1_000);
        assert_eq!(w.allow(10_000), Some(0));
        assert_eq!(w.allow(10_100), None);
        assert_eq!(w.allow(10_200), None);
        assert_eq!(w.allow(11_500), Some(2), "must report swallowed events");
        assert_eq!(w.allow(13_000), Some(0));
    }

    #[test]
    fn clock_is_monotonic() {
        let a = clock_ns();
        let b = clock_ns();
        assert!(b >= a);
    }
}
