// AXON IOK — ENGINE: PROCESS TABLE & SHARED-MEMORY PROTOCOL
// Everything about the runtimes the kernel transmits for: wire records,
// region layout and offset translation, 2 MiB page-frame tables, the flat
// process table with refcount/kill lifecycle, per-thread ring attachment,
// and the bounded completion overflow queue.

use std::ffi::CString;
use std::io::{Read, Seek, SeekFrom};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use libc::{close, mmap, munmap, shm_open, MAP_FAILED, MAP_SHARED, O_RDWR, PROT_READ, PROT_WRITE};

use crate::engine::ring::{ring_bytes, RingConsumer, RingMsg, RingProducer, RING_ORDER_MAX};

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

/// Egress ring command: transmit the TxNetHdr block at the payload offset.
/// The only legal egress tag; anything else kills the runtime.
pub const TXCMD_NET_XMIT: u64 = 0x01;

/// Ingress ring command: the NIC released the buffer for this token.
pub const RXCMD_NET_COMPLETE: u64 = 0x01;
/// Ingress ring command: the descriptor for this token was malformed and
/// dropped before reaching the wire.
pub const RXCMD_NET_ERROR: u64 = 0x02;

// Offload flag bits carried in TxNetHdr.olflags, forwarded to the driver.
pub const OLFLAG_IP_CKSUM: u32 = 1 << 0;
pub const OLFLAG_TCP_CKSUM: u32 = 1 << 1;
pub const OLFLAG_IPV4: u32 = 1 << 2;
pub const OLFLAG_IPV6: u32 = 1 << 3;

/// Descriptor header block, placed by the runtime in its region immediately
/// before the L2 frame it describes. `len` is the total on-wire length
/// including the Ethernet header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct TxNetHdr {
    pub completion_data: u64,
    pub olflags: u32,
    pub len: u32,
}

pub const TX_HDR_BYTES: usize = mem::size_of::<TxNetHdr>();
const _: () = assert!(TX_HDR_BYTES == 16);

impl TxNetHdr {
    /// # Safety
    /// `p` must be valid for a 16-byte read. No alignment requirement: header
    /// blocks land on arbitrary offsets after in-place segmentation.
    #[inline(always)]
    pub unsafe fn read(p: *const u8) -> TxNetHdr {
        ptr::read_unaligned(p as *const TxNetHdr)
    }

    /// # Safety
    /// `p` must be valid for a 16-byte write.
    #[inline(always)]
    pub unsafe fn write(p: *mut u8, hdr: TxNetHdr) {
        ptr::write_unaligned(p as *mut TxNetHdr, hdr)
    }
}

// ============================================================================
// REGION LAYOUT
// ============================================================================

pub const REGION_MAGIC: u32 = 0x4158_4F4E; // "AXON"
pub const REGION_VERSION: u32 = 1;

/// Region header at offset 0 of every registered shared-memory region.
/// `arena_off`/`arena_len` describe the descriptor arena the runtime carves
/// its packets from; the kernel only bounds-checks against the full region.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RegionHdr {
    pub magic: u32,
    pub version: u32,
    pub nr_threads: u32,
    pub ring_order: u32,
    pub arena_off: u64,
    pub arena_len: u64,
}

pub const REGION_HDR_BYTES: usize = mem::size_of::<RegionHdr>();
const _: () = assert!(REGION_HDR_BYTES == 32);

/// Thread blocks start one cache line in, leaving the header room to grow.
pub const REGION_THREADS_OFF: usize = 64;
/// Per-thread control block: active flag (AtomicU32 at +0) + padding.
pub const THREAD_CTRL_BYTES: usize = 64;

pub const MAX_KTHREADS: usize = 32;

pub const fn thread_block_bytes(order: u32) -> usize {
    THREAD_CTRL_BYTES + 2 * ring_bytes(order)
}

pub const fn thread_block_off(t: usize, order: u32) -> usize {
    REGION_THREADS_OFF + t * thread_block_bytes(order)
}

pub const fn egress_ring_off(t: usize, order: u32) -> usize {
    thread_block_off(t, order) + THREAD_CTRL_BYTES
}

pub const fn ingress_ring_off(t: usize, order: u32) -> usize {
    egress_ring_off(t, order) + ring_bytes(order)
}

/// Minimum region length for the given geometry (header + thread blocks; the
/// arena begins after this).
pub const fn region_min_len(nr_threads: usize, order: u32) -> usize {
    thread_block_off(nr_threads, order)
}

// ============================================================================
// 2 MiB PAGE TRANSLATION
// ============================================================================

pub const PGSHIFT_2MB: u32 = 21;
pub const PGSIZE_2MB: usize = 1 << PGSHIFT_2MB;
pub const PGMASK_2MB: u64 = (PGSIZE_2MB as u64) - 1;

#[inline(always)]
pub fn pgn_2mb(off: u64) -> usize {
    (off >> PGSHIFT_2MB) as usize
}

#[inline(always)]
pub fn pgoff_2mb(off: u64) -> u64 {
    off & PGMASK_2MB
}

/// Resolve the physical address of each 2 MiB page backing [base, base+len)
/// via /proc/self/pagemap. Returns None when the pagemap is unreadable or a
/// page is not present (the caller decides whether that is fatal; copy-mode
/// drivers never dereference the result).
pub fn lookup_page_paddrs(base: *const u8, len: usize) -> Option<Vec<u64>> {
    const PAGEMAP_ENTRY: u64 = 8;
    const PFN_MASK: u64 = (1 << 55) - 1;
    const PAGE_PRESENT: u64 = 1 << 63;

    let mut f = std::fs::File::open("/proc/self/pagemap").ok()?;
    let pages = len.div_ceil(PGSIZE_2MB);
    let mut paddrs = Vec::with_capacity(pages);
    for i in 0..pages {
        let va = base as u64 + (i as u64) * PGSIZE_2MB as u64;
        f.seek(SeekFrom::Start((va / 4096) * PAGEMAP_ENTRY)).ok()?;
        let mut e = [0u8; 8];
        f.read_exact(&mut e).ok()?;
        let e = u64::from_le_bytes(e);
        if e & PAGE_PRESENT == 0 {
            return None;
        }
        paddrs.push((e & PFN_MASK) * 4096);
    }
    Some(paddrs)
}

// ============================================================================
// SHARED-MEMORY REGION
// ============================================================================

/// A runtime's shared region as mapped into the kernel. `map_named` attaches
/// an existing POSIX shm object; `from_raw` wraps caller-owned memory (tests,
/// in-process runtimes).
pub struct ShmRegion {
    base: *mut u8,
    len: usize,
    mapped: bool,
}

// SAFETY: the region is plain memory; the ring protocol, not the type system,
// arbitrates concurrent access. Handles move with the transmit thread.
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Map an existing shm object read-write. The runtime created and sized
    /// it; a length mismatch is the runtime's protocol error.
    pub fn map_named(name: &str, len: usize) -> Option<ShmRegion> {
        if len == 0 {
            return None;
        }
        let c_name = CString::new(name).ok()?;
        // SAFETY: shm_open/mmap/close FFI on a validated C string; the fd is
        // closed after mmap (the mapping keeps the object alive).
        unsafe {
            let fd = shm_open(c_name.as_ptr(), O_RDWR, 0);
            if fd < 0 {
                return None;
            }
            let p = mmap(ptr::null_mut(), len, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0);
            close(fd);
            if p == MAP_FAILED {
                return None;
            }
            Some(ShmRegion { base: p as *mut u8, len, mapped: true })
        }
    }

    /// # Safety
    /// `base` must be valid read-write for `len` bytes, 8-byte aligned, and
    /// outlive the region handle.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> ShmRegion {
        ShmRegion { base, len, mapped: false }
    }

    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translate a region offset to a host pointer, checking that `size`
    /// bytes starting there lie inside the region. Overflow-safe; a None here
    /// is a runtime protocol violation.
    #[inline(always)]
    pub fn to_ptr(&self, off: u64, size: usize) -> Option<*mut u8> {
        let end = off.checked_add(size as u64)?;
        if end > self.len as u64 {
            return None;
        }
        // SAFETY: off < len checked above.
        Some(unsafe { self.base.add(off as usize) })
    }

    /// Read the region header, if the region is large enough to hold one.
    pub fn hdr(&self) -> Option<RegionHdr> {
        if self.len < REGION_HDR_BYTES {
            return None;
        }
        // SAFETY: length checked; unaligned read of a Pod struct.
        Some(unsafe { ptr::read_unaligned(self.base as *const RegionHdr) })
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.mapped {
            // SAFETY: base/len come from a successful mmap.
            unsafe { munmap(self.base as *mut libc::c_void, self.len) };
        }
    }
}

/// Write a fresh region header and zero the thread blocks. Runtime-side
/// setup; the kernel only ever validates, never formats.
pub fn format_region(region: &ShmRegion, nr_threads: u32, ring_order: u32) -> bool {
    if nr_threads == 0 || nr_threads as usize > MAX_KTHREADS || ring_order > RING_ORDER_MAX {
        return false;
    }
    let need = region_min_len(nr_threads as usize, ring_order);
    if region.len() < need {
        return false;
    }
    // SAFETY: `need <= len` checked; zeroing resets all ring indices and
    // active flags.
    unsafe {
        ptr::write_bytes(region.base(), 0, need);
        let arena_off = (need + 63) & !63;
        ptr::write_unaligned(
            region.base() as *mut RegionHdr,
            RegionHdr {
                magic: REGION_MAGIC,
                version: REGION_VERSION,
                nr_threads,
                ring_order,
                arena_off: arena_off as u64,
                arena_len: (region.len().saturating_sub(arena_off)) as u64,
            },
        );
    }
    true
}

// ============================================================================
// KERNEL- AND RUNTIME-SIDE THREAD ATTACHMENT
// ============================================================================

/// Kernel-side view of one runtime thread: consumes its egress ring, produces
/// into its ingress ring, reads its shared active flag. Lives inside the
/// owning Proc and exactly as long as it.
pub struct Kthread {
    pub egress: RingConsumer,
    pub ingress: RingProducer,
    active: *const AtomicU32,
}

// SAFETY: single transmit thread drives all Kthreads; the active flag is an
// atomic in shared memory.
unsafe impl Send for Kthread {}

impl Kthread {
    /// # Safety
    /// The region must be formatted for at least `t + 1` threads at `order`.
    pub unsafe fn attach(region: &ShmRegion, t: usize, order: u32) -> Kthread {
        let base = region.base();
        Kthread {
            egress: RingConsumer::attach(base.add(egress_ring_off(t, order)), order),
            ingress: RingProducer::attach(base.add(ingress_ring_off(t, order)), order),
            active: base.add(thread_block_off(t, order)) as *const AtomicU32,
        }
    }

    /// Whether the runtime is currently polling its ingress ring.
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        // SAFETY: points at the thread control word inside the live region.
        unsafe { (*self.active).load(Ordering::Acquire) != 0 }
    }
}

/// Runtime-side mirror of a Kthread: produces descriptors, consumes
/// completions, raises/lowers the active flag. Used by in-process runtimes
/// and the test suite.
pub struct RuntimeEndpoint {
    pub egress: RingProducer,
    pub ingress: RingConsumer,
    active: *const AtomicU32,
}

// SAFETY: one runtime thread drives the endpoint.
unsafe impl Send for RuntimeEndpoint {}

impl RuntimeEndpoint {
    /// # Safety
    /// Same contract as [`Kthread::attach`].
    pub unsafe fn attach(region: &ShmRegion, t: usize, order: u32) -> RuntimeEndpoint {
        let base = region.base();
        RuntimeEndpoint {
            egress: RingProducer::attach(base.add(egress_ring_off(t, order)), order),
            ingress: RingConsumer::attach(base.add(ingress_ring_off(t, order)), order),
            active: base.add(thread_block_off(t, order)) as *const AtomicU32,
        }
    }

    pub fn set_active(&self, active: bool) {
        // SAFETY: points at the thread control word inside the live region.
        unsafe { (*self.active).store(active as u32, Ordering::Release) };
    }

    /// Enqueue one transmit descriptor for the block at `hdr_off`.
    pub fn send_xmit(&mut self, hdr_off: u64) -> bool {
        self.egress.try_push(RingMsg { cmd: TXCMD_NET_XMIT, payload: hdr_off })
    }
}

// ============================================================================
// OVERFLOW QUEUE — bounded FIFO of deferred completion records
// ============================================================================

/// Per-process spill buffer for completions the ingress rings refused.
/// Strict FIFO: records leave in exactly the order the driver released their
/// buffers. Stores full records so error completions keep their tag.
pub struct OverflowRing {
    buf: Box<[RingMsg]>,
    head: usize,
    len: usize,
}

impl OverflowRing {
    pub fn new(capacity: usize) -> OverflowRing {
        OverflowRing {
            buf: vec![RingMsg { cmd: 0, payload: 0 }; capacity.max(1)].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one record. Returns false (record lost) when full.
    #[inline(always)]
    pub fn push(&mut self, msg: RingMsg) -> bool {
        if self.len == self.buf.len() {
            return false;
        }
        let tail = (self.head + self.len) % self.buf.len();
        self.buf[tail] = msg;
        self.len += 1;
        true
    }

    /// Oldest record without removing it. Drain peeks first so a ring refusal
    /// leaves the order intact.
    #[inline(always)]
    pub fn front(&self) -> Option<RingMsg> {
        if self.len == 0 {
            None
        } else {
            Some(self.buf[self.head])
        }
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Option<RingMsg> {
        let msg = self.front()?;
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        Some(msg)
    }
}

// ============================================================================
// PROCESS TABLE
// ============================================================================

pub const MAX_PROCS: usize = 64;
pub const DEFAULT_OVERFLOW_CAP: usize = 1024;

/// One registered runtime process.
pub struct Proc {
    pub region: ShmRegion,
    pub page_paddrs: Vec<u64>,
    pub threads: Vec<Kthread>,
    /// Registration holds one reference; every in-flight NIC buffer holds one
    /// more. The slot is reclaimed when this reaches zero.
    pub refcnt: u32,
    pub kill: bool,
    pub overflow: OverflowRing,
    /// Ingress round-robin cursor for completions whose home thread is
    /// inactive.
    pub next_thread_rr: u32,
}

impl Proc {
    #[inline(always)]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Round-robin delivery target for completions whose home thread cannot
    /// take them. Prefers an active thread at or after the cursor; falls back
    /// to the cursor position when the whole process is parked.
    pub fn rr_target(&mut self) -> usize {
        let n = self.threads.len();
        let start = self.next_thread_rr as usize;
        self.next_thread_rr = self.next_thread_rr.wrapping_add(1);
        for j in 0..n {
            let cand = (start + j) % n;
            if self.threads[cand].is_active() {
                return cand;
            }
        }
        start % n
    }
}

/// Flat table of runtime processes, indexed by slot. Owned by the transmit
/// thread; no interior locking.
pub struct ProcTable {
    slots: Vec<Option<Proc>>,
    count: usize,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTable {
    pub fn new() -> ProcTable {
        ProcTable {
            slots: (0..MAX_PROCS).map(|_| None).collect(),
            count: 0,
        }
    }

    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Register a mapped region. Validates the header geometry, attaches all
    /// thread rings, and takes the registration reference. Returns the slot.
    pub fn register(
        &mut self,
        region: ShmRegion,
        page_paddrs: Vec<u64>,
        overflow_cap: usize,
    ) -> Option<u16> {
        let hdr = region.hdr()?;
        if hdr.magic != REGION_MAGIC || hdr.version != REGION_VERSION {
            return None;
        }
        if hdr.nr_threads == 0
            || hdr.nr_threads as usize > MAX_KTHREADS
            || hdr.ring_order > RING_ORDER_MAX
        {
            return None;
        }
        if region.len() < region_min_len(hdr.nr_threads as usize, hdr.ring_order) {
            return None;
        }
        let slot = self.slots.iter().position(|s| s.is_none())?;
        let threads = (0..hdr.nr_threads as usize)
            // SAFETY: geometry validated against the region length above.
            .map(|t| unsafe { Kthread::attach(&region, t, hdr.ring_order) })
            .collect();
        self.slots[slot] = Some(Proc {
            region,
            page_paddrs,
            threads,
            refcnt: 1,
            kill: false,
            overflow: OverflowRing::new(overflow_cap),
            next_thread_rr: 0,
        });
        self.count += 1;
        Some(slot as u16)
    }

    #[inline(always)]
    pub fn get(&self, slot: u16) -> Option<&Proc> {
        self.slots.get(slot as usize)?.as_ref()
    }

    #[inline(always)]
    pub fn get_mut(&mut self, slot: u16) -> Option<&mut Proc> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    /// True while the slot is occupied and not killed.
    #[inline(always)]
    pub fn is_live(&self, slot: u16) -> bool {
        matches!(self.get(slot), Some(p) if !p.kill)
    }

    /// Take one reference on behalf of an in-flight buffer.
    #[inline(always)]
    pub fn proc_get(&mut self, slot: u16) {
        if let Some(p) = self.get_mut(slot) {
            p.refcnt += 1;
        }
    }

    /// Drop one reference. Reclaims the slot at zero (which requires the kill
    /// flag: the registration reference is only dropped by `kill`). Returns
    /// true when the slot was reclaimed.
    pub fn proc_put(&mut self, slot: u16) -> bool {
        let Some(p) = self.get_mut(slot) else {
            return false;
        };
        debug_assert!(p.refcnt > 0, "proc_put on drained refcount");
        p.refcnt -= 1;
        if p.refcnt == 0 {
            debug_assert!(p.kill, "refcount hit zero without kill");
            self.slots[slot as usize] = None;
            self.count -= 1;
            return true;
        }
        false
    }

    /// Terminate a runtime: set the kill flag and drop the registration
    /// reference. In-flight buffers keep the slot alive until they drain.
    pub fn kill(&mut self, slot: u16) -> bool {
        match self.get_mut(slot) {
            Some(p) if !p.kill => {
                p.kill = true;
                self.proc_put(slot);
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Heap-backed region: Vec<u64> guarantees 8-byte alignment.
    struct HeapRegion {
        words: Vec<u64>,
    }

    impl HeapRegion {
        fn new(len: usize) -> HeapRegion {
            HeapRegion { words: vec![0u64; len.div_ceil(8)] }
        }
        fn region(&mut self) -> ShmRegion {
            // SAFETY: heap buffer is valid, aligned, and outlives the handle
            // within each test.
            unsafe { ShmRegion::from_raw(self.words.as_mut_ptr() as *mut u8, self.words.len() * 8) }
        }
    }

    fn formatted(mem: &mut HeapRegion, nr_threads: u32, order: u32) -> ShmRegion {
        let r = mem.region();
        assert!(format_region(&r, nr_threads, order));
        r
    }

    #[test]
    fn layout_constants() {
        assert_eq!(TX_HDR_BYTES, 16);
        assert_eq!(REGION_HDR_BYTES, 32);
        // One thread, order 2: ctrl + 2 rings of (128 + 4*16).
        assert_eq!(thread_block_bytes(2), 64 + 2 * (128 + 64));
        assert!(region_min_len(2, 4) > region_min_len(1, 4));
    }

    #[test]
    fn page_translation_math() {
        assert_eq!(pgn_2mb(0), 0);
        assert_eq!(pgn_2mb((2 << 20) as u64), 1);
        assert_eq!(pgoff_2mb((2 << 20) as u64 + 77), 77);
    }

    #[test]
    fn to_ptr_bounds() {
        let mut mem = HeapRegion::new(4096);
        let r = mem.region();
        assert!(r.to_ptr(0, 16).is_some());
        assert!(r.to_ptr(4080, 16).is_some());
        assert!(r.to_ptr(4081, 16).is_none());
        assert!(r.to_ptr(u64::MAX, 16).is_none(), "offset overflow must not wrap");
        assert!(r.to_ptr(4096, 0).is_some());
    }

    #[test]
    fn format_and_register() {
        let mut mem = HeapRegion::new(region_min_len(2, 3) + 4096);
        let r = formatted(&mut mem, 2, 3);
        let hdr = r.hdr().unwrap();
        assert_eq!(hdr.magic, REGION_MAGIC);
        assert_eq!(hdr.nr_threads, 2);

        let mut procs = ProcTable::new();
        let slot = procs.register(r, vec![0], 8).unwrap();
        let p = procs.get(slot).unwrap();
        assert_eq!(p.thread_count(), 2);
        assert_eq!(p.refcnt, 1);
        assert!(!p.kill);
    }

    #[test]
    fn register_rejects_bad_geometry() {
        let mut procs = ProcTable::new();

        // Too short for its declared thread count.
        let mut mem = HeapRegion::new(region_min_len(1, 3));
        let r = formatted(&mut mem, 1, 3);
        // SAFETY: same buffer, shorter view.
        let short = unsafe { ShmRegion::from_raw(r.base(), REGION_HDR_BYTES) };
        assert!(procs.register(short, vec![], 8).is_none());

        // Wrong magic.
        let mut mem2 = HeapRegion::new(region_min_len(1, 3));
        let r2 = mem2.region();
        assert!(procs.register(r2, vec![], 8).is_none());
    }

    #[test]
    fn refcount_lifecycle() {
        let mut mem = HeapRegion::new(region_min_len(1, 2) + 64);
        let r = formatted(&mut mem, 1, 2);
        let mut procs = ProcTable::new();
        let slot = procs.register(r, vec![], 4).unwrap();

        // Two in-flight buffers.
        procs.proc_get(slot);
        procs.proc_get(slot);
        assert_eq!(procs.get(slot).unwrap().refcnt, 3);

        // Kill drops the registration ref; the slot survives on in-flight refs.
        assert!(procs.kill(slot));
        assert!(procs.get(slot).is_some());
        assert!(!procs.proc_put(slot));
        assert!(procs.proc_put(slot), "last ref must reclaim the slot");
        assert!(procs.get(slot).is_none());
        assert_eq!(procs.count(), 0);
    }

    #[test]
    fn kill_is_idempotent() {
        let mut mem = HeapRegion::new(region_min_len(1, 2) + 64);
        let r = formatted(&mut mem, 1, 2);
        let mut procs = ProcTable::new();
        let slot = procs.register(r, vec![], 4).unwrap();
        procs.proc_get(slot);
        assert!(procs.kill(slot));
        assert!(!procs.kill(slot), "second kill must be a no-op");
        assert!(procs.get(slot).is_some());
        procs.proc_put(slot);
        assert!(procs.get(slot).is_none());
    }

    #[test]
    fn endpoint_and_kthread_share_rings() {
        let mut mem = HeapRegion::new(region_min_len(1, 3) + 64);
        let r = formatted(&mut mem, 1, 3);
        // SAFETY: region formatted for one thread at order 3.
        let mut ep = unsafe { RuntimeEndpoint::attach(&r, 0, 3) };
        let mut kt = unsafe { Kthread::attach(&r, 0, 3) };

        assert!(!kt.is_active());
        ep.set_active(true);
        assert!(kt.is_active());

        assert!(ep.send_xmit(0x1000));
        let msg = kt.egress.try_pop().unwrap();
        assert_eq!(msg.cmd, TXCMD_NET_XMIT);
        assert_eq!(msg.payload, 0x1000);

        assert!(kt.ingress.try_push(RingMsg { cmd: RXCMD_NET_COMPLETE, payload: 0xAA }));
        assert_eq!(ep.ingress.try_pop().unwrap().payload, 0xAA);
    }

    #[test]
    fn overflow_fifo_and_capacity() {
        let mut q = OverflowRing::new(4);
        for i in 0..4u64 {
            assert!(q.push(RingMsg { cmd: RXCMD_NET_COMPLETE, payload: i }));
        }
        assert!(!q.push(RingMsg { cmd: RXCMD_NET_COMPLETE, payload: 99 }), "5th push into cap-4 queue must fail");
        assert_eq!(q.front().unwrap().payload, 0);
        for i in 0..4u64 {
            assert_eq!(q.pop().unwrap().payload, i);
        }
        assert!(q.pop().is_none());

        // Wrap around the backing buffer.
        for i in 10..13u64 {
            assert!(q.push(RingMsg { cmd: RXCMD_NET_COMPLETE, payload: i }));
        }
        assert_eq!(q.pop().unwrap().payload, 10);
        assert!(q.push(RingMsg { cmd: RXCMD_NET_ERROR, payload: 13 }));
        assert_eq!(q.pop().unwrap().payload, 11);
        assert_eq!(q.pop().unwrap().payload, 12);
        let last = q.pop().unwrap();
        assert_eq!((last.cmd, last.payload), (RXCMD_NET_ERROR, 13));
    }
}
