//! Kernel io_uring capability probe.
//!
//! Queries `IORING_REGISTER_PROBE` for the opcodes the running kernel
//! supports. Used by `cmd/ring-probe` for deployment decisions and by the
//! worker to fail fast with a clear error instead of an opaque `-EINVAL`
//! when multishot accept is missing (kernel < 5.19).

use io_uring::{opcode, Probe};
use ringserv_core::error::{Result, ServError};

use crate::ring::Ring;

/// Support status of one opcode the server submits.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeSupport {
    pub name: &'static str,
    pub code: u8,
    pub supported: bool,
}

/// Snapshot of kernel support for the opcodes this server uses.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    ops: Vec<OpcodeSupport>,
}

/// The opcodes the worker actually submits.
const REQUIRED: &[(&str, u8)] = &[
    ("accept_multi", opcode::AcceptMulti::CODE),
    ("recv", opcode::Recv::CODE),
    ("send", opcode::Send::CODE),
    ("link_timeout", opcode::LinkTimeout::CODE),
];

impl ProbeReport {
    /// Probe the kernel through an existing ring.
    pub fn capture(ring: &Ring) -> Result<Self> {
        let mut probe = Probe::new();
        ring.inner()
            .submitter()
            .register_probe(&mut probe)
            .map_err(|e| ServError::Os(e.raw_os_error().unwrap_or(-1)))?;

        let ops = REQUIRED
            .iter()
            .map(|&(name, code)| OpcodeSupport {
                name,
                code,
                supported: probe.is_supported(code),
            })
            .collect();
        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[OpcodeSupport] {
        &self.ops
    }

    pub fn supports(&self, code: u8) -> bool {
        self.ops.iter().any(|op| op.code == code && op.supported)
    }

    /// Can the listener use one multishot accept registration?
    pub fn multishot_accept(&self) -> bool {
        self.supports(opcode::AcceptMulti::CODE)
    }

    /// Every opcode the event loop submits is available.
    pub fn all_supported(&self) -> bool {
        self.ops.iter().all(|op| op.supported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reports_basic_ops() {
        let Ok(ring) = Ring::new(8) else {
            // io_uring denied in this environment.
            return;
        };
        let Ok(report) = ProbeReport::capture(&ring) else {
            // Probe registration needs 5.6+.
            return;
        };
        // Recv/Send predate every kernel this crate can run on.
        assert!(report.supports(opcode::Recv::CODE));
        assert!(report.supports(opcode::Send::CODE));
        assert_eq!(report.ops().len(), 4);
    }
}
