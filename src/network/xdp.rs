// AXON IOK — NETWORK: AF_XDP TX BACKEND
//
// Production NicDriver: an egress-only AF_XDP socket. One UMEM frame per
// pool buffer, so the completion queue's addresses map 1:1 onto buffer
// indices and the CQ is the release stream the router consumes.
//
// Frames are staged by copy from the runtime's region into UMEM: AF_XDP
// transmits only UMEM-resident bytes, so the zero-copy contract ends at the
// UMEM boundary here. The paddr carried on each FrameDesc is for DMA-capable
// drivers and is ignored by this backend.
//
// No XDP program is loaded or attached; the TX ring and completion queue do
// not require one.

use libbpf_sys::{
    xdp_desc, xsk_ring_cons, xsk_ring_prod, xsk_socket, xsk_socket__create, xsk_socket__delete,
    xsk_socket__fd, xsk_socket_config, xsk_umem, xsk_umem__create, xsk_umem__delete,
    xsk_umem_config, XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD,
};
use libc::{
    c_void, mmap, munmap, sendto, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_LOCKED,
    MAP_POPULATE, MAP_PRIVATE, MSG_DONTWAIT, PROT_READ, PROT_WRITE,
};
use std::ffi::CString;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::engine::runtime::{fatal, E_UMEM_ALLOC_FAIL, E_XSK_BIND_FAIL};
use crate::network::driver::{FrameDesc, NicDriver};

pub const FRAME_SIZE: u32 = 4096;
const XSK_RING_DEPTH: u32 = 2048;

const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

pub struct XdpDriver {
    umem_area: *mut u8,
    umem_len: usize,
    umem_handle: *mut xsk_umem,
    sock_handle: *mut xsk_socket,
    tx: XskProd,
    cq: XskCons,
    #[allow(dead_code)]
    fq: XskProd, // created with the UMEM; never filled on an egress-only socket
    sock_fd: i32,
}

// SAFETY: the driver is driven by the single transmit thread.
unsafe impl Send for XdpDriver {}

impl XdpDriver {
    /// Bring up the socket on `if_name` queue `queue_id` with `frames` UMEM
    /// frames (== the completion pool capacity). Any hardware or kernel
    /// refusal is fatal: there is no degraded mode for the egress path.
    pub fn new(if_name: &str, queue_id: u32, frames: u32) -> XdpDriver {
        let umem_len = frames as usize * FRAME_SIZE as usize;

        // Hugepage-backed, pre-faulted, pinned UMEM. Swapped-out UMEM pages
        // would stall the NIC DMA engine mid-burst.
        let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_HUGETLB | MAP_POPULATE | MAP_LOCKED;
        // SAFETY: anonymous mapping; checked against MAP_FAILED below.
        let umem_area = unsafe { mmap(ptr::null_mut(), umem_len, PROT_READ | PROT_WRITE, flags, -1, 0) };
        if umem_area == MAP_FAILED {
            fatal(E_UMEM_ALLOC_FAIL, "UMEM hugepage mmap failed; check /proc/sys/vm/nr_hugepages");
        }

        let umem_cfg = xsk_umem_config {
            fill_size: XSK_RING_DEPTH,
            comp_size: XSK_RING_DEPTH,
            frame_size: FRAME_SIZE,
            frame_headroom: 0,
            flags: 0,
        };
        let mut umem_handle: *mut xsk_umem = ptr::null_mut();
        // SAFETY: zeroed ring descriptors are the documented pre-create state.
        let mut fq_def: xsk_ring_prod = unsafe { mem::zeroed() };
        let mut cq_def: xsk_ring_cons = unsafe { mem::zeroed() };
        // SAFETY: FFI with valid out-pointers; umem_area sized umem_len.
        let ret = unsafe {
            xsk_umem__create(&mut umem_handle, umem_area, umem_len as u64, &mut fq_def, &mut cq_def, &umem_cfg)
        };
        if ret != 0 {
            fatal(E_UMEM_ALLOC_FAIL, "xsk_umem__create failed");
        }

        // SAFETY: zeroed config then explicit field init.
        let mut sock_cfg: xsk_socket_config = unsafe { mem::zeroed() };
        sock_cfg.rx_size = 0;
        sock_cfg.tx_size = XSK_RING_DEPTH;
        sock_cfg.libbpf_flags = XSK_LIBBPF_FLAGS__INHIBIT_PROG_LOAD;
        sock_cfg.xdp_flags = 0;
        sock_cfg.bind_flags = XDP_ZEROCOPY | XDP_USE_NEED_WAKEUP;

        let c_ifname = match CString::new(if_name) {
            Ok(c) => c,
            Err(_) => fatal(E_XSK_BIND_FAIL, "Interface name contains null byte"),
        };
        let mut sock_handle: *mut xsk_socket = ptr::null_mut();
        let mut tx_def: xsk_ring_prod = unsafe { mem::zeroed() };
        // SAFETY: FFI with valid out-pointers and a live umem handle. The RX
        // ring pointer is null: this socket never receives.
        let ret = unsafe {
            xsk_socket__create(
                &mut sock_handle,
                c_ifname.as_ptr(),
                queue_id,
                umem_handle,
                ptr::null_mut(),
                &mut tx_def,
                &sock_cfg,
            )
        };
        if ret != 0 {
            // SAFETY: errno read after a failed FFI call.
            let errno = unsafe { *libc::__errno_location() };
            eprintln!(
                "[AXON-TX] xsk_socket__create returned {} (errno={}), queue={}, iface={}",
                ret, errno, queue_id, if_name
            );
            fatal(E_XSK_BIND_FAIL, "xsk_socket__create failed; NIC lacks native XDP_ZEROCOPY TX");
        }
        // SAFETY: sock_handle is valid after a successful create.
        let sock_fd = unsafe { xsk_socket__fd(sock_handle) };

        // SAFETY: ring descriptors were initialized by the create calls.
        unsafe {
            XdpDriver {
                umem_area: umem_area as *mut u8,
                umem_len,
                umem_handle,
                sock_handle,
                tx: XskProd::new(&tx_def),
                cq: XskCons::new(&cq_def),
                fq: XskProd::new(&fq_def),
                sock_fd,
            }
        }
    }

    /// Flush the TX ring. Unconditional: gating on the need-wakeup flag can
    /// strand staged frames when the flag desynchronizes across a long stall.
    fn kick(&self) {
        // SAFETY: zero-length sendto on a bound XSK fd is the documented TX
        // doorbell.
        let res = unsafe { sendto(self.sock_fd, ptr::null(), 0, MSG_DONTWAIT, ptr::null(), 0) };
        if res < 0 {
            // SAFETY: errno read after a failed syscall.
            let e = unsafe { *libc::__errno_location() };
            // EAGAIN/EBUSY/ENOBUFS are transient back-pressure; the next kick
            // drains. ENXIO/EBADF mean the device is gone.
            if e != libc::EAGAIN && e != libc::EBUSY && e != libc::ENOBUFS {
                fatal(E_XSK_BIND_FAIL, "kick: unrecoverable error on TX doorbell");
            }
        }
    }
}

impl NicDriver for XdpDriver {
    fn tx_burst(&mut self, frames: &[FrameDesc]) -> usize {
        // SAFETY: ring pointers are valid for the socket lifetime.
        let room = unsafe { self.tx.available() } as usize;
        let n = frames.len().min(room);
        for f in &frames[..n] {
            let len = f.len.min(FRAME_SIZE);
            let dst_off = f.buf as usize * FRAME_SIZE as usize;
            debug_assert!(dst_off + len as usize <= self.umem_len);
            // SAFETY: f.addr covers f.len bytes inside the owner's region
            // (validated at prepare); dst is this buffer's private UMEM frame.
            unsafe {
                ptr::copy_nonoverlapping(f.addr, self.umem_area.add(dst_off), len as usize);
                self.tx.stage(dst_off as u64, len);
            }
        }
        if n > 0 {
            // SAFETY: staged descriptors precede the index publish.
            unsafe { self.tx.commit() };
            self.kick();
        }
        n
    }

    fn reap(&mut self, out: &mut Vec<u32>) -> usize {
        // SAFETY: ring pointers are valid for the socket lifetime.
        unsafe { self.cq.consume(out) }
    }
}

impl Drop for XdpDriver {
    fn drop(&mut self) {
        // SAFETY: handles are live; delete order is socket before umem.
        unsafe {
            xsk_socket__delete(self.sock_handle);
            xsk_umem__delete(self.umem_handle);
            munmap(self.umem_area as *mut c_void, self.umem_len);
        }
    }
}

// ============================================================================
// XSK RING OPERATIONS (lock-free SPSC against the kernel)
// ============================================================================

struct XskProd {
    producer: *mut u32,
    consumer: *mut u32,
    ring: *mut c_void,
    mask: u32,
    local_prod: u32,
    cached_cons: u32,
}

struct XskCons {
    producer: *mut u32,
    consumer: *mut u32,
    ring: *mut c_void,
    mask: u32,
}

impl XskProd {
    unsafe fn new(r: *const xsk_ring_prod) -> Self {
        let init = (*((*r).producer as *mut AtomicU32)).load(Ordering::Relaxed);
        XskProd {
            producer: (*r).producer,
            consumer: (*r).consumer,
            ring: (*r).ring,
            mask: (*r).mask,
            local_prod: init,
            cached_cons: 0,
        }
    }

    #[inline(always)]
    unsafe fn available(&mut self) -> u32 {
        self.cached_cons = (*(self.consumer as *mut AtomicU32)).load(Ordering::Acquire);
        (self.mask + 1).saturating_sub(self.local_prod.wrapping_sub(self.cached_cons))
    }

    #[inline(always)]
    unsafe fn stage(&mut self, addr: u64, len: u32) {
        let desc = (self.ring as *mut xdp_desc).offset((self.local_prod & self.mask) as isize);
        (*desc).addr = addr;
        (*desc).len = len;
        (*desc).options = 0;
        self.local_prod = self.local_prod.wrapping_add(1);
    }

    #[inline(always)]
    unsafe fn commit(&mut self) {
        let prod_ptr = self.producer as *mut AtomicU32;
        fence(Ordering::Release);
        (*prod_ptr).store(self.local_prod, Ordering::Relaxed);
    }
}

impl XskCons {
    unsafe fn new(r: *const xsk_ring_cons) -> Self {
        XskCons {
            producer: (*r).producer,
            consumer: (*r).consumer,
            ring: (*r).ring,
            mask: (*r).mask,
        }
    }

    /// Drain all completed addresses, translated to buffer indices.
    #[inline(always)]
    unsafe fn consume(&mut self, out: &mut Vec<u32>) -> usize {
        let prod_ptr = self.producer as *mut AtomicU32;
        let cons_ptr = self.consumer as *mut AtomicU32;
        let cons_val = (*cons_ptr).load(Ordering::Relaxed);
        let prod_val = (*prod_ptr).load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let available = prod_val.wrapping_sub(cons_val);
        if available == 0 {
            return 0;
        }
        let addr_arr = self.ring as *const u64;
        for i in 0..available {
            let addr = *addr_arr.offset(((cons_val.wrapping_add(i)) & self.mask) as isize);
            out.push((addr / FRAME_SIZE as u64) as u32);
        }
        (*cons_ptr).store(cons_val.wrapping_add(available), Ordering::Release);
        available as usize
    }
}
