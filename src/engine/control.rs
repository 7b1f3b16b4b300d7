// AXON IOK — ENGINE: CONTROL SOCKET
// Registration is the whole control plane the egress path needs: a runtime
// announces its shared region (name, geometry, overflow capacity) over a
// Unix datagram socket and gets back its slot; deregistration sets the kill
// flag and lets in-flight buffers drain the slot. Polled from the main loop
// between bursts; never blocks.

use std::mem;
use std::ptr;

use bytemuck::{Pod, Zeroable};
use libc::{c_void, sockaddr, sockaddr_un, socklen_t, AF_UNIX, SOCK_DGRAM, SOCK_NONBLOCK};

use crate::engine::proc::{lookup_page_paddrs, ProcTable, ShmRegion, DEFAULT_OVERFLOW_CAP, PGSIZE_2MB};
use crate::network::tx::TxEngine;

pub const CTL_MAGIC: u32 = 0x4354_4C31; // "CTL1"
pub const CTL_OP_REGISTER: u32 = 1;
pub const CTL_OP_DEREGISTER: u32 = 2;
pub const CTL_NAME_MAX: usize = 64;

/// Fixed-size control record. `slot` is meaningful for deregister only;
/// `shm_name` is NUL-terminated within its 64 bytes.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct CtlMsg {
    pub magic: u32,
    pub op: u32,
    pub nr_threads: u32,
    pub ring_order: u32,
    pub overflow_cap: u32,
    pub slot: i32,
    pub region_len: u64,
    pub shm_name: [u8; CTL_NAME_MAX],
}

pub const CTL_MSG_BYTES: usize = mem::size_of::<CtlMsg>();
const _: () = assert!(CTL_MSG_BYTES == 96);

impl CtlMsg {
    pub fn register(
        shm_name: &str,
        region_len: u64,
        nr_threads: u32,
        ring_order: u32,
        overflow_cap: u32,
    ) -> Option<CtlMsg> {
        if shm_name.len() >= CTL_NAME_MAX || shm_name.as_bytes().contains(&0) {
            return None;
        }
        let mut name = [0u8; CTL_NAME_MAX];
        name[..shm_name.len()].copy_from_slice(shm_name.as_bytes());
        Some(CtlMsg {
            magic: CTL_MAGIC,
            op: CTL_OP_REGISTER,
            nr_threads,
            ring_order,
            overflow_cap,
            slot: -1,
            region_len,
            shm_name: name,
        })
    }

    pub fn deregister(slot: i32) -> CtlMsg {
        let mut m = CtlMsg::zeroed();
        m.magic = CTL_MAGIC;
        m.op = CTL_OP_DEREGISTER;
        m.slot = slot;
        m
    }

    pub fn shm_name_str(&self) -> Option<&str> {
        let end = self.shm_name.iter().position(|&b| b == 0)?;
        if end == 0 {
            return None;
        }
        std::str::from_utf8(&self.shm_name[..end]).ok()
    }
}

pub struct CtlSock {
    fd: i32,
    path: String,
}

impl CtlSock {
    /// Bind the nonblocking datagram socket, replacing any stale socket file.
    pub fn bind(path: &str) -> Option<CtlSock> {
        let _ = std::fs::remove_file(path);
        // SAFETY: socket/bind FFI; sun_path length is validated before copy.
        unsafe {
            let fd = libc::socket(AF_UNIX, SOCK_DGRAM | SOCK_NONBLOCK, 0);
            if fd < 0 {
                return None;
            }
            let mut addr: sockaddr_un = mem::zeroed();
            addr.sun_family = AF_UNIX as libc::sa_family_t;
            let bytes = path.as_bytes();
            if bytes.len() >= addr.sun_path.len() {
                libc::close(fd);
                return None;
            }
            ptr::copy_nonoverlapping(bytes.as_ptr() as *const libc::c_char, addr.sun_path.as_mut_ptr(), bytes.len());
            if libc::bind(fd, &addr as *const _ as *const sockaddr, mem::size_of::<sockaddr_un>() as socklen_t) != 0 {
                libc::close(fd);
                return None;
            }
            Some(CtlSock { fd, path: path.to_string() })
        }
    }

    /// Drain pending control messages. Returns how many were handled.
    pub fn poll(&self, procs: &mut ProcTable, engine: &mut TxEngine) -> usize {
        let mut handled = 0;
        loop {
            let mut msg = CtlMsg::zeroed();
            // SAFETY: recvfrom FFI into a fixed-size Pod record and a zeroed
            // peer address.
            let (n, peer, peer_len) = unsafe {
                let mut peer: sockaddr_un = mem::zeroed();
                let mut peer_len = mem::size_of::<sockaddr_un>() as socklen_t;
                let n = libc::recvfrom(
                    self.fd,
                    &mut msg as *mut _ as *mut c_void,
                    CTL_MSG_BYTES,
                    0,
                    &mut peer as *mut _ as *mut sockaddr,
                    &mut peer_len,
                );
                (n, peer, peer_len)
            };
            if n < 0 {
                break; // EAGAIN: queue drained
            }
            if n as usize != CTL_MSG_BYTES || msg.magic != CTL_MAGIC {
                eprintln!("[AXON-CTL] malformed control message ({} bytes)", n);
                continue;
            }
            let reply = match msg.op {
                CTL_OP_REGISTER => handle_register(procs, engine, &msg),
                CTL_OP_DEREGISTER => handle_deregister(procs, engine, &msg),
                other => {
                    eprintln!("[AXON-CTL] unknown control op {}", other);
                    -1
                }
            };
            handled += 1;
            // Ack to the sender when it bound a reply address.
            if peer_len as usize > mem::size_of::<libc::sa_family_t>() {
                // SAFETY: sendto FFI echoing to the validated peer address.
                unsafe {
                    libc::sendto(
                        self.fd,
                        &reply as *const _ as *const c_void,
                        mem::size_of::<i32>(),
                        0,
                        &peer as *const _ as *const sockaddr,
                        peer_len,
                    );
                }
            }
        }
        handled
    }
}

impl Drop for CtlSock {
    fn drop(&mut self) {
        // SAFETY: fd came from a successful socket().
        unsafe { libc::close(self.fd) };
        let _ = std::fs::remove_file(&self.path);
    }
}

fn handle_register(procs: &mut ProcTable, engine: &mut TxEngine, msg: &CtlMsg) -> i32 {
    let Some(name) = msg.shm_name_str() else {
        eprintln!("[AXON-CTL] register: bad shm name");
        return -1;
    };
    let Some(region) = ShmRegion::map_named(name, msg.region_len as usize) else {
        eprintln!("[AXON-CTL] register: cannot map {} ({} bytes)", name, msg.region_len);
        return -1;
    };
    match region.hdr() {
        Some(h) if h.nr_threads == msg.nr_threads && h.ring_order == msg.ring_order => {}
        _ => {
            eprintln!("[AXON-CTL] register: region header disagrees with message");
            return -1;
        }
    }
    let paddrs = match lookup_page_paddrs(region.base(), region.len()) {
        Some(p) => p,
        None => {
            // Staging-copy drivers never read paddrs; DMA drivers will kill
            // the runtime on first translation.
            eprintln!("[AXON-CTL] register: pagemap lookup failed for {}; paddr table zeroed", name);
            vec![0u64; region.len().div_ceil(PGSIZE_2MB)]
        }
    };
    let cap = if msg.overflow_cap == 0 { DEFAULT_OVERFLOW_CAP } else { msg.overflow_cap as usize };
    let nr_threads = msg.nr_threads as usize;
    match procs.register(region, paddrs, cap) {
        Some(slot) => {
            engine.attach_proc(slot, nr_threads);
            eprintln!(
                "[AXON-CTL] registered {} as runtime {} ({} threads, ring order {})",
                name, slot, nr_threads, msg.ring_order
            );
            slot as i32
        }
        None => {
            eprintln!("[AXON-CTL] register: table rejected {}", name);
            -1
        }
    }
}

fn handle_deregister(procs: &mut ProcTable, engine: &mut TxEngine, msg: &CtlMsg) -> i32 {
    if msg.slot < 0 {
        return -1;
    }
    let slot = msg.slot as u16;
    engine.detach_proc(slot);
    if procs.kill(slot) {
        eprintln!("[AXON-CTL] runtime {} deregistered", slot);
        0
    } else {
        -1
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_is_fixed_size() {
        assert_eq!(CTL_MSG_BYTES, 96);
    }

    #[test]
    fn register_msg_roundtrip() {
        let m = CtlMsg::register("/axon_rt_0", 1 << 20, 4, 8, 128).unwrap();
        assert_eq!(m.magic, CTL_MAGIC);
        assert_eq!(m.op, CTL_OP_REGISTER);
        assert_eq!(m.shm_name_str(), Some("/axon_rt_0"));
        assert_eq!(m.region_len, 1 << 20);
        assert_eq!(m.nr_threads, 4);
    }

    #[test]
    fn register_msg_rejects_long_or_nul_names() {
        let long = "x".repeat(CTL_NAME_MAX);
        assert!(CtlMsg::register(&long, 0, 1, 1, 0).is_none());
        assert!(CtlMsg::register("bad\0name", 0, 1, 1, 0).is_none());
    }

    #[test]
    fn deregister_msg() {
        let m = CtlMsg::deregister(9);
        assert_eq!(m.op, CTL_OP_DEREGISTER);
        assert_eq!(m.slot, 9);
        assert!(m.shm_name_str().is_none());
    }
}
