// AXON IOK — CRATE ROOT (LIBRARY)
// Egress path of the AXON I/O kernel: runtimes → shared-memory rings → NIC.
//
// Module hierarchy:
//   engine/ring     — SPSC command rings over raw shared memory
//   engine/proc     — wire records, shm regions, process/thread tables,
//                     overflow queue
//   engine/runtime  — fatal exit, CPU pinning, clock, rate-limited warnings,
//                     telemetry (SHM counters + monitor)
//   engine/control  — registration/deregistration control socket
//   network/        — NIC driver seam, buffer pool, in-place UDP GSO,
//                     the transmit burst engine, AF_XDP backend

pub mod engine;
pub mod network;
