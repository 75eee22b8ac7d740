//! ring-probe — does this kernel support what ringserv submits?
//!
//! Queries `IORING_REGISTER_PROBE` and prints a support line per opcode the
//! server uses. Informs deployment; never touches the request path.
//!
//! Exit status: 0 if multishot accept is available, 1 otherwise, 2 if
//! io_uring itself is unusable here.

use ringserv_uring::probe::ProbeReport;
use ringserv_uring::ring::Ring;

fn main() {
    let ring = match Ring::new(8) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("ring-probe: io_uring unavailable: {}", e);
            std::process::exit(2);
        }
    };

    let report = match ProbeReport::capture(&ring) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("ring-probe: probe registration failed: {} (kernel < 5.6?)", e);
            std::process::exit(2);
        }
    };

    for op in report.ops() {
        println!(
            "{:<14} (op {:>2})  {}",
            op.name,
            op.code,
            if op.supported { "supported" } else { "MISSING" }
        );
    }

    if report.multishot_accept() {
        println!("verdict: multishot accept available; ringservd will run");
    } else {
        println!("verdict: no multishot accept (kernel < 5.19); ringservd will refuse to start");
        std::process::exit(1);
    }
}
