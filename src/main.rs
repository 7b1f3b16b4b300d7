// AXON IOK — Egress executive
// Brings up the transmit thread: pins it to an isolated core, maps the
// telemetry block, binds the control socket, creates the AF_XDP backend, and
// runs the burst loop. One thread, one core, no allocation after bring-up.

use std::sync::atomic::{AtomicBool, Ordering};

use axon_iok::engine::control::CtlSock;
use axon_iok::engine::proc::ProcTable;
use axon_iok::engine::runtime::{
    clock_ns, discover_isolated_cores, fatal, pin_to_core, run_monitor, verify_affinity,
    Telemetry, E_BAD_CONFIG, E_CTL_SOCK_FAIL, E_NO_ISOLATED_CORES,
};
use axon_iok::network::tx::{TxEngine, TX_BURST_MAX};
use axon_iok::network::xdp::XdpDriver;

const DEFAULT_CTL_SOCK: &str = "/run/axon-iok.sock";
const DEFAULT_BURST: usize = 32;
const DEFAULT_POOL_FRAMES: u32 = 4096;
/// Telemetry publish cadence; the counters are diagnostic, not control.
const PUBLISH_INTERVAL_NS: u64 = 100_000_000;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    // SAFETY: the handler has a stable address and performs one Relaxed
    // atomic store, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let mut if_name = String::new();
    let mut queue_id: u32 = 0;
    let mut burst = DEFAULT_BURST;
    let mut ctl_path = DEFAULT_CTL_SOCK.to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--monitor" => {
                run_monitor();
                return;
            }
            "--queue" => {
                i += 1;
                queue_id = arg_num(&args, i, "queue id") as u32;
            }
            "--burst" => {
                i += 1;
                burst = arg_num(&args, i, "burst size");
                if burst == 0 || burst > TX_BURST_MAX {
                    fatal(E_BAD_CONFIG, "burst must be in 1..=32");
                }
            }
            "--ctl-sock" => {
                i += 1;
                if i < args.len() {
                    ctl_path = args[i].clone();
                }
            }
            other => {
                if !other.starts_with("--") {
                    if_name = other.to_string();
                }
            }
        }
        i += 1;
    }
    if if_name.is_empty() {
        fatal(E_BAD_CONFIG, "usage: axon-iok <iface> [--queue N] [--burst N] [--ctl-sock PATH] | --monitor");
    }

    run_executive(&if_name, queue_id, burst, &ctl_path);
}

fn arg_num(args: &[String], i: usize, what: &str) -> usize {
    match args.get(i).and_then(|a| a.parse().ok()) {
        Some(v) => v,
        None => {
            eprintln!("[AXON-EXEC] invalid {}", what);
            fatal(E_BAD_CONFIG, "bad numeric argument");
        }
    }
}

fn run_executive(if_name: &str, queue_id: u32, burst: usize, ctl_path: &str) {
    // The transmit path owns one isolated core for its lifetime.
    let isolated = discover_isolated_cores();
    if isolated.is_empty() {
        fatal(E_NO_ISOLATED_CORES, "No isolated cores. Boot with isolcpus=... or set AXON_MOCK_CMDLINE");
    }
    let core = isolated[0];
    pin_to_core(core);
    verify_affinity(core);
    eprintln!("[AXON-EXEC] transmit thread pinned to core {}", core);

    let telem = Telemetry::map(true);
    telem.pid.value.store(std::process::id(), Ordering::Relaxed);

    let ctl = match CtlSock::bind(ctl_path) {
        Some(c) => c,
        None => fatal(E_CTL_SOCK_FAIL, "cannot bind control socket"),
    };
    eprintln!("[AXON-EXEC] control socket at {}", ctl_path);

    let mut driver = XdpDriver::new(if_name, queue_id, DEFAULT_POOL_FRAMES);
    eprintln!(
        "[AXON-EXEC] AF_XDP TX up on {} queue {} ({} buffers, burst {})",
        if_name, queue_id, DEFAULT_POOL_FRAMES, burst
    );

    let mut procs = ProcTable::new();
    let mut engine = TxEngine::new(burst, DEFAULT_POOL_FRAMES as usize);

    let mut next_publish = 0u64;
    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }
        ctl.poll(&mut procs, &mut engine);

        let worked = engine.tx_burst(&mut procs, &mut driver);
        engine.reap_completions(&mut procs, &mut driver);
        if !worked && !engine.drain_completions(&mut procs) {
            engine.repoll(&procs);
        }

        let now = clock_ns();
        if now >= next_publish {
            engine.publish(&telem);
            next_publish = now + PUBLISH_INTERVAL_NS;
        }
    }

    engine.publish(&telem);
    eprintln!(
        "\n[AXON-EXEC] shutdown: {} descriptors pulled, {} segments, {} completions, {} runtimes killed",
        engine.stats.pulled, engine.stats.segs, engine.stats.compl_enqueued, engine.stats.procs_killed
    );
}
