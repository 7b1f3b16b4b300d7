// AXON IOK — NETWORK: TRANSMIT BURST ENGINE
//
// The egress hot path, three components on one pinned thread:
//   Poller — round-robins the registered runtime threads, bulk-dequeues
//            transmit descriptors up to the burst cap. The fairness cursor
//            advances only on non-saturating bursts, so a runtime that fills
//            the burst cannot rotate starved peers out of the head position.
//   Segmenter — gso::segment, invoked per pulled descriptor.
//   Completion Router — on every NIC buffer release, delivers exactly one
//            completion to the owning runtime (unless suppressed or killed),
//            spilling to the per-process overflow queue when its ingress
//            ring refuses, and drains the overflow when the path is idle.
//
// No preemption points inside a burst; no call here blocks. Errors never
// propagate upward: runtimes that violate the protocol are killed, resource
// exhaustion is counted and rate-limit logged.

use crate::engine::proc::{
    pgn_2mb, pgoff_2mb, ProcTable, TxNetHdr, MAX_PROCS, RXCMD_NET_COMPLETE, RXCMD_NET_ERROR,
    TXCMD_NET_XMIT, TX_HDR_BYTES,
};
use crate::engine::ring::RingMsg;
use crate::engine::runtime::{clock_ns, prefetch_read_l1, Telemetry, WarnLimiter, WARN_INTERVAL_NS};
use crate::network::driver::{BufTrailer, CompletionPool, FrameDesc, NicDriver};
use crate::network::gso::{self, SegError, Segment};

use std::sync::atomic::Ordering;

pub const TX_BURST_MAX: usize = 32;
/// Global cap on overflow records moved per drain_completions call.
pub const DRAIN_BATCH: usize = 32;
const TX_PREFETCH_STRIDE: usize = 2;

/// One descriptor pulled off an egress ring, pre-translation-checked for the
/// TxNetHdr extent.
#[derive(Clone, Copy, Debug)]
struct PulledDesc {
    proc_slot: u16,
    kthread: u16,
    hdr_off: u64,
}

#[derive(Clone, Copy)]
struct SegRef {
    proc_slot: u16,
    kthread: u16,
    seg: Segment,
}

/// Cumulative egress counters. Plain integers: the hot loop owns them and
/// bridges to the SHM telemetry once per cycle.
#[derive(Default, Clone, Debug)]
pub struct TxStats {
    pub pulled: u64,
    pub segs: u64,
    pub bursts: u64,
    pub backpressure: u64,
    pub fail: u64,
    pub malformed: u64,
    pub compl_enqueued: u64,
    pub compl_overflow: u64,
    pub compl_drained: u64,
    pub compl_dropped: u64,
    pub compl_killed: u64,
    pub compl_suppressed: u64,
    pub procs_killed: u64,
}

pub struct TxEngine {
    burst: usize,
    /// Poll set: (proc slot, thread index), rotated by `pos`.
    polled: Vec<(u16, u16)>,
    /// Threads observed inactive with an empty ring; re-admitted by repoll().
    parked: Vec<(u16, u16)>,
    pos: usize,
    drain_pos: usize,
    pool: CompletionPool,
    /// Frames the driver refused; re-offered before any new polling.
    carry: Vec<FrameDesc>,
    pulled: Vec<PulledDesc>,
    seg_scratch: Vec<Segment>,
    segs: Vec<SegRef>,
    bufs: Vec<u32>,
    frames: Vec<FrameDesc>,
    reaped: Vec<u32>,
    warn_pool: WarnLimiter,
    warn_overflow: WarnLimiter,
    pub stats: TxStats,
}

impl TxEngine {
    pub fn new(burst: usize, pool_capacity: usize) -> TxEngine {
        let burst = burst.clamp(1, TX_BURST_MAX);
        TxEngine {
            burst,
            polled: Vec::new(),
            parked: Vec::new(),
            pos: 0,
            drain_pos: 0,
            pool: CompletionPool::new(pool_capacity),
            carry: Vec::new(),
            pulled: Vec::with_capacity(burst),
            seg_scratch: Vec::with_capacity(gso::MAX_SEGS),
            segs: Vec::with_capacity(burst * gso::MAX_SEGS),
            bufs: Vec::with_capacity(burst * gso::MAX_SEGS),
            frames: Vec::with_capacity(burst * gso::MAX_SEGS),
            reaped: Vec::with_capacity(pool_capacity),
            warn_pool: WarnLimiter::new(WARN_INTERVAL_NS),
            warn_overflow: WarnLimiter::new(WARN_INTERVAL_NS),
            stats: TxStats::default(),
        }
    }

    #[inline(always)]
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    /// Admit a freshly registered process's threads to the poll set.
    pub fn attach_proc(&mut self, slot: u16, nr_threads: usize) {
        for t in 0..nr_threads {
            self.polled.push((slot, t as u16));
        }
    }

    /// Remove every poll entry for a process (kill or deregistration).
    pub fn detach_proc(&mut self, slot: u16) {
        self.polled.retain(|&(s, _)| s != slot);
        self.parked.retain(|&(s, _)| s != slot);
    }

    fn kill_proc(&mut self, procs: &mut ProcTable, slot: u16, why: &str) {
        if procs.kill(slot) {
            self.stats.procs_killed += 1;
            eprintln!("[AXON-TX] runtime {} terminated: {}", slot, why);
        }
        self.detach_proc(slot);
    }

    // ========================================================================
    // EGRESS POLLER
    // ========================================================================

    /// Collect up to `burst` descriptors across the poll set. Returns whether
    /// any were pulled. Fairness: visiting order rotates through `pos`, and
    /// `pos` advances only when the burst was not filled.
    fn poll_once(&mut self, procs: &mut ProcTable) -> bool {
        self.pulled.clear();
        let nrts = self.polled.len();
        if nrts == 0 {
            return false;
        }

        let mut killed: Vec<u16> = Vec::new();
        let mut parked: Vec<(u16, u16)> = Vec::new();
        let mut filled = false;

        for i in 0..nrts {
            let (ps, kt) = self.polled[(self.pos + i) % nrts];
            if killed.contains(&ps) {
                continue;
            }
            let Some(p) = procs.get_mut(ps) else { continue };
            let t = &mut p.threads[kt as usize];
            while self.pulled.len() < self.burst {
                match t.egress.try_pop() {
                    None => {
                        if !t.is_active() {
                            parked.push((ps, kt));
                        }
                        break;
                    }
                    Some(msg) => {
                        if msg.cmd != TXCMD_NET_XMIT {
                            killed.push(ps);
                            break;
                        }
                        if p.region.to_ptr(msg.payload, TX_HDR_BYTES).is_none() {
                            killed.push(ps);
                            break;
                        }
                        self.pulled.push(PulledDesc {
                            proc_slot: ps,
                            kthread: kt,
                            hdr_off: msg.payload,
                        });
                    }
                }
            }
            if self.pulled.len() >= self.burst {
                filled = true;
                break;
            }
        }

        for ps in killed {
            self.pulled.retain(|d| d.proc_slot != ps);
            self.kill_proc(procs, ps, "egress protocol violation");
        }
        for (ps, kt) in parked {
            if procs.is_live(ps) {
                if let Some(i) = self.polled.iter().position(|&e| e == (ps, kt)) {
                    self.polled.remove(i);
                    self.parked.push((ps, kt));
                }
            }
        }

        if !filled {
            self.pos = self.pos.wrapping_add(1);
        }
        self.stats.pulled += self.pulled.len() as u64;
        !self.pulled.is_empty()
    }

    /// Re-admit parked threads whose runtime raised the active flag again.
    /// Called from the idle path; rings carry no doorbell.
    pub fn repoll(&mut self, procs: &ProcTable) -> usize {
        let mut moved = 0;
        let mut i = 0;
        while i < self.parked.len() {
            let (ps, kt) = self.parked[i];
            match procs.get(ps) {
                Some(p) if !p.kill => {
                    if p.threads[kt as usize].is_active() {
                        self.polled.push((ps, kt));
                        self.parked.swap_remove(i);
                        moved += 1;
                    } else {
                        i += 1;
                    }
                }
                _ => {
                    self.parked.swap_remove(i);
                }
            }
        }
        moved
    }

    // ========================================================================
    // SEGMENTATION STAGE
    // ========================================================================

    fn segment_batch(&mut self, procs: &mut ProcTable) {
        self.segs.clear();
        let mut killed: Vec<u16> = Vec::new();
        for i in 0..self.pulled.len() {
            let d = self.pulled[i];
            if killed.contains(&d.proc_slot) {
                continue;
            }
            let mut error_token: Option<u64> = None;
            {
                let Some(p) = procs.get_mut(d.proc_slot) else { continue };
                self.seg_scratch.clear();
                match gso::segment(&p.region, d.hdr_off, &mut self.seg_scratch) {
                    Ok(_) => {
                        for &seg in &self.seg_scratch {
                            self.segs.push(SegRef {
                                proc_slot: d.proc_slot,
                                kthread: d.kthread,
                                seg,
                            });
                        }
                    }
                    Err(SegError::Malformed) => {
                        // Echo the token with the error tag; extent for the
                        // header was validated at pull time.
                        let hp = p.region.to_ptr(d.hdr_off, TX_HDR_BYTES).unwrap_or(p.region.base());
                        // SAFETY: 16-byte extent validated by the poller.
                        let tok = unsafe { TxNetHdr::read(hp) }.completion_data;
                        self.stats.malformed += 1;
                        error_token = Some(tok);
                    }
                    Err(SegError::BadLayout) => {
                        killed.push(d.proc_slot);
                    }
                }
            }
            if let Some(tok) = error_token {
                self.deliver(procs, d.proc_slot, d.kthread, RXCMD_NET_ERROR, tok);
            }
        }
        for ps in killed {
            self.segs.retain(|s| s.proc_slot != ps);
            self.kill_proc(procs, ps, "descriptor layout violation");
        }
    }

    // ========================================================================
    // TRANSMIT BURST
    // ========================================================================

    /// One burst cycle: flush carry-over, poll, segment, attach buffers, hand
    /// to the driver. Returns whether any work was performed.
    pub fn tx_burst<D: NicDriver>(&mut self, procs: &mut ProcTable, driver: &mut D) -> bool {
        // Back-pressure: deferred frames go first, and no new polling happens
        // until the driver has taken them all.
        let mut flushed = false;
        if !self.carry.is_empty() {
            let offered = self.carry.len();
            let sent = driver.tx_burst(&self.carry);
            self.carry.drain(..sent);
            flushed = sent > 0;
            if sent < offered {
                self.stats.backpressure += (offered - sent) as u64;
                return true;
            }
        }

        if !self.poll_once(procs) {
            return flushed;
        }
        self.stats.bursts += 1;

        self.segment_batch(procs);
        if self.segs.is_empty() {
            return true;
        }

        // All-or-nothing buffer acquire: a partial batch would transmit some
        // segments of a group and silently drop the rest.
        self.bufs.clear();
        if !self.pool.alloc_bulk(&mut self.bufs, self.segs.len()) {
            self.stats.fail += self.segs.len() as u64;
            if let Some(sup) = self.warn_pool.allow(clock_ns()) {
                eprintln!(
                    "[AXON-TX] buffer pool empty; dropping {} segments ({} warnings suppressed)",
                    self.segs.len(),
                    sup
                );
            }
            return true;
        }

        // Attach each segment to a buffer: trailer, proc reference, physical
        // address from the 2 MiB page-frame table.
        self.frames.clear();
        let mut killed: Vec<u16> = Vec::new();
        for i in 0..self.segs.len() {
            let sref = self.segs[i];
            let buf = self.bufs[i];
            if killed.contains(&sref.proc_slot) {
                self.pool.free(buf);
                continue;
            }
            if i + TX_PREFETCH_STRIDE < self.segs.len() {
                let next = self.segs[i + TX_PREFETCH_STRIDE];
                if let Some(np) = procs.get(next.proc_slot) {
                    if let Some(nptr) = np.region.to_ptr(next.seg.hdr_off, TX_HDR_BYTES) {
                        // SAFETY: translated pointer into a live region.
                        unsafe { prefetch_read_l1(nptr) };
                    }
                }
            }
            let Some(p) = procs.get_mut(sref.proc_slot) else {
                self.pool.free(buf);
                continue;
            };
            let frame_off = sref.seg.hdr_off + TX_HDR_BYTES as u64;
            let Some(addr) = p.region.to_ptr(frame_off, sref.seg.wire_len as usize) else {
                self.pool.free(buf);
                killed.push(sref.proc_slot);
                continue;
            };
            let paddr = match p.page_paddrs.get(pgn_2mb(frame_off)) {
                Some(&base) => base + pgoff_2mb(frame_off),
                None => {
                    self.pool.free(buf);
                    killed.push(sref.proc_slot);
                    continue;
                }
            };
            *self.pool.trailer_mut(buf) = BufTrailer {
                proc_slot: sref.proc_slot,
                kthread: sref.kthread,
                completion_data: sref.seg.completion_data,
            };
            procs.proc_get(sref.proc_slot);
            self.frames.push(FrameDesc {
                buf,
                addr,
                paddr,
                len: sref.seg.wire_len,
                olflags: sref.seg.olflags,
            });
        }
        for ps in killed {
            self.kill_proc(procs, ps, "page frame lookup failed");
        }
        if self.frames.is_empty() {
            return true;
        }
        self.stats.segs += self.frames.len() as u64;

        let sent = driver.tx_burst(&self.frames);
        if sent < self.frames.len() {
            self.stats.backpressure += (self.frames.len() - sent) as u64;
            self.carry.extend(self.frames[sent..].iter().copied());
        }
        true
    }

    // ========================================================================
    // COMPLETION ROUTER
    // ========================================================================

    /// Consume the driver's release stream and route one completion per
    /// buffer. Returns how many buffers were reaped.
    pub fn reap_completions<D: NicDriver>(&mut self, procs: &mut ProcTable, driver: &mut D) -> usize {
        self.reaped.clear();
        let n = driver.reap(&mut self.reaped);
        for i in 0..n {
            let idx = self.reaped[i];
            let tr = *self.pool.trailer(idx);
            self.pool.free(idx);
            self.complete(procs, tr);
        }
        n
    }

    /// Per-buffer free callback. Always drops exactly one reference on the
    /// owning process, on every path.
    fn complete(&mut self, procs: &mut ProcTable, tr: BufTrailer) {
        let Some(p) = procs.get(tr.proc_slot) else {
            // A live buffer holds a reference; a missing slot is a logic bug.
            debug_assert!(false, "completion for unreferenced proc slot");
            return;
        };
        if p.kill {
            self.stats.compl_killed += 1;
            procs.proc_put(tr.proc_slot);
            return;
        }
        if tr.completion_data == 0 {
            // Intermediate GSO segment; the group's last segment completes.
            self.stats.compl_suppressed += 1;
            procs.proc_put(tr.proc_slot);
            return;
        }
        self.deliver(procs, tr.proc_slot, tr.kthread, RXCMD_NET_COMPLETE, tr.completion_data);
        procs.proc_put(tr.proc_slot);
    }

    /// Route one ingress record: home thread if active, else the process's
    /// round-robin thread, spilling to the overflow queue on refusal. While
    /// the overflow queue holds records, new ones append behind them so the
    /// per-process stream never reorders.
    fn deliver(&mut self, procs: &mut ProcTable, slot: u16, kthread: u16, cmd: u64, token: u64) -> bool {
        let Some(p) = procs.get_mut(slot) else {
            return false;
        };
        let msg = RingMsg { cmd, payload: token };
        if !p.overflow.is_empty() {
            return self.spill(slot, procs, msg);
        }
        let nthreads = p.thread_count();
        let target = if (kthread as usize) < nthreads && p.threads[kthread as usize].is_active() {
            kthread as usize
        } else {
            p.rr_target()
        };
        if p.threads[target].ingress.try_push(msg) {
            self.stats.compl_enqueued += 1;
            return true;
        }
        self.spill(slot, procs, msg)
    }

    fn spill(&mut self, slot: u16, procs: &mut ProcTable, msg: RingMsg) -> bool {
        let Some(p) = procs.get_mut(slot) else {
            return false;
        };
        if p.overflow.push(msg) {
            self.stats.compl_overflow += 1;
            return true;
        }
        // Hard failure: nothing upstream can relieve this. Log, count, drop.
        self.stats.compl_dropped += 1;
        if let Some(sup) = self.warn_overflow.allow(clock_ns()) {
            eprintln!(
                "[AXON-TX] completion overflow queue full for runtime {}; dropping ({} warnings suppressed)",
                slot, sup
            );
        }
        false
    }

    /// Move spilled completions back into ingress rings, round-robin across
    /// processes, up to DRAIN_BATCH records per call. Peek-then-pop: a ring
    /// refusal stops that process with its order intact. Invoked whenever the
    /// burst loop reports no transmit work.
    pub fn drain_completions(&mut self, procs: &mut ProcTable) -> bool {
        let mut drained = 0usize;
        for i in 0..MAX_PROCS {
            if drained >= DRAIN_BATCH {
                break;
            }
            let slot = ((self.drain_pos + i) % MAX_PROCS) as u16;
            loop {
                if drained >= DRAIN_BATCH {
                    break;
                }
                let Some(p) = procs.get_mut(slot) else { break };
                if p.kill {
                    // The runtime is gone; its spilled completions go with it.
                    while p.overflow.pop().is_some() {}
                    break;
                }
                let Some(msg) = p.overflow.front() else { break };
                let t = p.rr_target();
                if p.threads[t].ingress.try_push(msg) {
                    p.overflow.pop();
                    drained += 1;
                } else {
                    break;
                }
            }
        }
        self.drain_pos = self.drain_pos.wrapping_add(1);
        self.stats.compl_drained += drained as u64;
        drained > 0
    }

    // ========================================================================
    // TELEMETRY BRIDGE
    // ========================================================================

    /// Publish the cumulative counters into the SHM telemetry block.
    pub fn publish(&self, t: &Telemetry) {
        t.tx_pulled.value.store(self.stats.pulled, Ordering::Relaxed);
        t.tx_segs.value.store(self.stats.segs, Ordering::Relaxed);
        t.tx_bursts.value.store(self.stats.bursts, Ordering::Relaxed);
        t.tx_backpressure.value.store(self.stats.backpressure, Ordering::Relaxed);
        t.tx_fail.value.store(self.stats.fail, Ordering::Relaxed);
        t.tx_malformed.value.store(self.stats.malformed, Ordering::Relaxed);
        t.compl_enqueued.value.store(self.stats.compl_enqueued, Ordering::Relaxed);
        t.compl_overflow.value.store(self.stats.compl_overflow, Ordering::Relaxed);
        t.compl_drained.value.store(self.stats.compl_drained, Ordering::Relaxed);
        t.compl_dropped.value.store(self.stats.compl_dropped, Ordering::Relaxed);
        t.compl_killed.value.store(self.stats.compl_killed, Ordering::Relaxed);
        t.procs_killed.value.store(self.stats.procs_killed, Ordering::Relaxed);
    }
}
