//! ringservd — per-core io_uring TCP server.
//!
//! Spawns one worker per online CPU (or as given), each pinned to its core
//! with its own ring, SO_REUSEPORT listener, and connection pool. The only
//! cross-thread state is the shutdown flag set by SIGINT/SIGTERM.
//!
//! Usage:
//!     ringservd [port] [workers]
//!
//! Environment:
//!     RINGSERV_LOG=<off|error|warn|info|debug>
//!
//! Test with:
//!     curl -v http://localhost:8080/
//!     wrk -c 512 -t 16 -d 15s http://localhost:8080/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use ringserv_core::config::ServerConfig;
use ringserv_core::{kerror, kinfo, klog};
use ringserv_uring::worker::{Stats, Worker};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    // No SA_RESTART: the signal must interrupt a blocked
    // io_uring_enter so workers notice the flag promptly.
    let action = SigAction::new(
        SigHandler::Handler(handle_term),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }
}

fn main() {
    klog::init();

    let args: Vec<String> = std::env::args().collect();
    let mut cfg = ServerConfig::default();
    if let Some(port) = args.get(1).and_then(|s| s.parse().ok()) {
        cfg.port = port;
    }
    if let Some(workers) = args.get(2).and_then(|s| s.parse().ok()) {
        cfg.workers = workers;
    }

    install_signal_handlers();

    kinfo!(
        "ringservd: port {} with {} workers (per-worker SO_REUSEPORT, multishot accept)",
        cfg.port,
        cfg.workers
    );

    let shutdown = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::with_capacity(cfg.workers);
    for cpu_id in 0..cfg.workers {
        let wcfg = cfg.worker(cpu_id);
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(format!("ringserv-w{}", cpu_id))
            .spawn(move || match Worker::new(wcfg, flag) {
                Ok(worker) => worker.run().map_err(|e| (cpu_id, e)),
                // Fatal to this worker only.
                Err(e) => Err((cpu_id, e)),
            })
            .expect("spawn worker thread");
        handles.push(handle);
    }

    // The signal handler can only flip the process-wide static; mirror it
    // into the flag the workers poll.
    while !SHUTDOWN.load(Ordering::Relaxed) {
        thread::sleep(std::time::Duration::from_millis(50));
        if handles.iter().all(|h| h.is_finished()) {
            break;
        }
    }
    shutdown.store(true, Ordering::Relaxed);

    let mut totals = Stats::default();
    let mut failed = 0usize;
    for handle in handles {
        match handle.join() {
            Ok(Ok(report)) => {
                totals.accepts += report.stats.accepts;
                totals.reads += report.stats.reads;
                totals.writes += report.stats.writes;
                totals.closes += report.stats.closes;
                totals.pool_rejects += report.stats.pool_rejects;
                totals.sq_drops += report.stats.sq_drops;
                totals.io_errors += report.stats.io_errors;
            }
            Ok(Err((cpu_id, e))) => {
                failed += 1;
                kerror!("worker {}: {}", cpu_id, e);
            }
            Err(_) => {
                failed += 1;
                kerror!("worker thread panicked");
            }
        }
    }

    kinfo!(
        "ringservd: stopped; accepts={} reads={} writes={} closes={} rejects={} sq_drops={} errors={} failed_workers={}",
        totals.accepts,
        totals.reads,
        totals.writes,
        totals.closes,
        totals.pool_rejects,
        totals.sq_drops,
        totals.io_errors,
        failed
    );

    if failed > 0 {
        std::process::exit(1);
    }
}
