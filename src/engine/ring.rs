// AXON IOK — ENGINE: SHARED-MEMORY SPSC COMMAND RINGS
//
// The only cross-process contract in the datapath. Each runtime thread owns
// one egress ring (runtime produces, kernel consumes) and one ingress ring
// (kernel produces, runtime consumes). Both are single-producer single-consumer
// rings of fixed 16-byte command records laid out directly in the shared
// region: a cache-line-separated index pair followed by a power-of-two slot
// array.
//
// Index caching: each side keeps a local copy of the remote index and crosses
// the interconnect (Acquire load) only when the ring looks full/empty from the
// cached view. Publication is one Release store per operation.

use std::sync::atomic::{AtomicU32, Ordering};
use bytemuck::{Pod, Zeroable};

/// One ring slot: command tag + payload word. The egress direction carries
/// {transmit, shm offset of a TxNetHdr block}; the ingress direction carries
/// {net-complete | net-error, completion token}.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Pod, Zeroable)]
pub struct RingMsg {
    pub cmd: u64,
    pub payload: u64,
}

pub const MSG_BYTES: usize = std::mem::size_of::<RingMsg>();
const _: () = assert!(MSG_BYTES == 16);

/// Ring control block: producer index at +0, consumer index at +64, slots at
/// +128. The 64-byte split keeps the two indices on distinct cache lines.
pub const RING_CTRL_BYTES: usize = 128;
const CONS_OFF: usize = 64;

/// Total bytes a ring occupies in the shared region.
pub const fn ring_bytes(order: u32) -> usize {
    RING_CTRL_BYTES + (MSG_BYTES << order)
}

/// Largest ring order a region header may declare. 2^16 slots = 1 MiB of
/// ring, far past any sane configuration; bigger values are a protocol error.
pub const RING_ORDER_MAX: u32 = 16;

pub struct RingProducer {
    prod: *const AtomicU32,
    cons: *const AtomicU32,
    slots: *mut RingMsg,
    mask: u32,
    local_prod: u32,
    cached_cons: u32,
}

pub struct RingConsumer {
    prod: *const AtomicU32,
    cons: *const AtomicU32,
    slots: *const RingMsg,
    mask: u32,
    local_cons: u32,
    cached_prod: u32,
}

// SAFETY: each handle is the unique producer (resp. consumer) of its ring and
// may be moved to the one thread that drives it. The underlying shared memory
// outlives the handle (region teardown is gated on the proc refcount).
unsafe impl Send for RingProducer {}
unsafe impl Send for RingConsumer {}

impl RingProducer {
    /// # Safety
    /// `ctrl` must point to `ring_bytes(order)` bytes of zero-initialized (or
    /// previously attached) ring memory, 8-byte aligned, and the caller must
    /// be the only producer for the lifetime of the handle.
    pub unsafe fn attach(ctrl: *mut u8, order: u32) -> Self {
        let prod = ctrl as *const AtomicU32;
        let cons = ctrl.add(CONS_OFF) as *const AtomicU32;
        RingProducer {
            prod,
            cons,
            slots: ctrl.add(RING_CTRL_BYTES) as *mut RingMsg,
            mask: (1u32 << order) - 1,
            local_prod: (*prod).load(Ordering::Relaxed),
            cached_cons: (*cons).load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Push one record. Returns false when the ring is full.
    #[inline(always)]
    pub fn try_push(&mut self, msg: RingMsg) -> bool {
        let cap = self.mask + 1;
        if self.local_prod.wrapping_sub(self.cached_cons) >= cap {
            // SAFETY: cons points into the attached ring control block.
            self.cached_cons = unsafe { (*self.cons).load(Ordering::Acquire) };
            if self.local_prod.wrapping_sub(self.cached_cons) >= cap {
                return false;
            }
        }
        // SAFETY: index is masked into the slot array; we are the sole writer.
        unsafe {
            self.slots
                .add((self.local_prod & self.mask) as usize)
                .write(msg);
        }
        self.local_prod = self.local_prod.wrapping_add(1);
        // SAFETY: prod points into the attached ring control block. Release
        // publishes the slot write before the index becomes visible.
        unsafe { (*self.prod).store(self.local_prod, Ordering::Release) };
        true
    }

    /// Free slots from the producer's current view (refreshes the cached
    /// consumer index).
    #[inline(always)]
    pub fn free_slots(&mut self) -> u32 {
        // SAFETY: cons points into the attached ring control block.
        self.cached_cons = unsafe { (*self.cons).load(Ordering::Acquire) };
        (self.mask + 1) - self.local_prod.wrapping_sub(self.cached_cons)
    }
}

impl RingConsumer {
    /// # Safety
    /// Same contract as [`RingProducer::attach`], for the consuming side.
    pub unsafe fn attach(ctrl: *const u8, order: u32) -> Self {
        let prod = ctrl as *const AtomicU32;
        let cons = ctrl.add(CONS_OFF) as *const AtomicU32;
        RingConsumer {
            prod,
            cons,
            slots: ctrl.add(RING_CTRL_BYTES) as *const RingMsg,
            mask: (1u32 << order) - 1,
            local_cons: (*cons).load(Ordering::Relaxed),
            cached_prod: (*prod).load(Ordering::Relaxed),
        }
    }

    /// Pop one record. Returns None when the ring is empty.
    #[inline(always)]
    pub fn try_pop(&mut self) -> Option<RingMsg> {
        if self.cached_prod == self.local_cons {
            // SAFETY: prod points into the attached ring control block.
            self.cached_prod = unsafe { (*self.prod).load(Ordering::Acquire) };
            if self.cached_prod == self.local_cons {
                return None;
            }
        }
        // SAFETY: index is masked into the slot array; the Acquire load above
        // ordered the slot contents before this read.
        let msg = unsafe { self.slots.add((self.local_cons & self.mask) as usize).read() };
        self.local_cons = self.local_cons.wrapping_add(1);
        // SAFETY: cons points into the attached ring control block. Release
        // hands the slot back to the producer.
        unsafe { (*self.cons).store(self.local_cons, Ordering::Release) };
        Some(msg)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: u32 = 3; // 8 slots

    fn ring_buf() -> Vec<u64> {
        vec![0u64; ring_bytes(ORDER) / 8]
    }

    fn attach_pair(buf: &mut [u64]) -> (RingProducer, RingConsumer) {
        let base = buf.as_mut_ptr() as *mut u8;
        // SAFETY: buf is zeroed, 8-aligned, and sized for the ring; the pair
        // below is the unique producer/consumer.
        unsafe { (RingProducer::attach(base, ORDER), RingConsumer::attach(base, ORDER)) }
    }

    fn msg(n: u64) -> RingMsg {
        RingMsg { cmd: 1, payload: n }
    }

    #[test]
    fn roundtrip_in_order() {
        let mut buf = ring_buf();
        let (mut p, mut c) = attach_pair(&mut buf);
        for i in 0..5 {
            assert!(p.try_push(msg(i)));
        }
        for i in 0..5 {
            assert_eq!(c.try_pop().unwrap().payload, i);
        }
        assert!(c.try_pop().is_none());
    }

    #[test]
    fn full_ring_rejects_push() {
        let mut buf = ring_buf();
        let (mut p, mut c) = attach_pair(&mut buf);
        for i in 0..8 {
            assert!(p.try_push(msg(i)));
        }
        assert!(!p.try_push(msg(99)), "9th push into 8-slot ring must fail");
        assert_eq!(c.try_pop().unwrap().payload, 0);
        assert!(p.try_push(msg(99)), "push must succeed after one pop");
    }

    #[test]
    fn wraparound_preserves_order() {
        let mut buf = ring_buf();
        let (mut p, mut c) = attach_pair(&mut buf);
        // Cycle 4x the capacity so indices wrap the mask several times.
        let mut next_pop = 0u64;
        for i in 0..32u64 {
            assert!(p.try_push(msg(i)));
            if i % 2 == 1 {
                assert_eq!(c.try_pop().unwrap().payload, next_pop);
                assert_eq!(c.try_pop().unwrap().payload, next_pop + 1);
                next_pop += 2;
            }
        }
        assert!(c.try_pop().is_none());
    }

    #[test]
    fn free_slots_tracks_consumer() {
        let mut buf = ring_buf();
        let (mut p, mut c) = attach_pair(&mut buf);
        assert_eq!(p.free_slots(), 8);
        for i in 0..3 {
            p.try_push(msg(i));
        }
        assert_eq!(p.free_slots(), 5);
        c.try_pop();
        assert_eq!(p.free_slots(), 6);
    }

    #[test]
    fn cross_thread_stream() {
        const N: u64 = 10_000;
        let mut buf = ring_buf();
        let base = buf.as_mut_ptr() as *mut u8;
        // SAFETY: zeroed, aligned, correctly sized; one producer thread, one
        // consumer thread.
        let (mut p, mut c) = unsafe { (RingProducer::attach(base, ORDER), RingConsumer::attach(base, ORDER)) };
        std::thread::scope(|s| {
            s.spawn(move || {
                for i in 0..N {
                    while !p.try_push(msg(i)) {
                        std::hint::spin_loop();
                    }
                }
            });
            s.spawn(move || {
                for i in 0..N {
                    let got = loop {
                        if let Some(m) = c.try_pop() {
                            break m;
                        }
                        std::hint::spin_loop();
                    };
                    assert_eq!(got.payload, i);
                }
            });
        });
    }
}
