// AXON IOK — NETWORK MODULE
//   driver.rs — NIC driver seam (bulk enqueue + release reap) and the
//               completion buffer pool with per-buffer trailers
//   gso.rs    — in-place UDP segmentation for oversized datagrams
//   tx.rs     — egress poller, completion router, tx_burst orchestration
//   xdp.rs    — AF_XDP TX-only production backend

pub mod driver;
pub mod gso;
pub mod tx;
pub mod xdp;
