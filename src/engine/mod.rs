// AXON IOK — ENGINE MODULE
//   ring.rs     — SPSC command rings over raw shared memory
//   proc.rs     — wire records, regions, proc/thread tables, overflow queue
//   runtime.rs  — fatal exit, pinning, clock, rate limiting, telemetry
//   control.rs  — registration control socket

pub mod ring;
pub mod proc;
pub mod runtime;
pub mod control;
