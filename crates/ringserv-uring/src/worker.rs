//! The per-core worker event loop.
//!
//! One worker owns one ring, one SO_REUSEPORT listener, and one connection
//! pool; exactly one OS thread drives it and no other thread ever touches
//! its state. The loop blocks once per iteration until at least one
//! completion is ready, drains the entire ready batch through the
//! per-connection state machine, and lets the next iteration's combined
//! submit-and-wait flush whatever the batch queued. One kernel round-trip
//! amortized over the whole batch.
//!
//! The listener uses a multishot accept registration: one SQE yields a
//! completion per inbound connection until the kernel clears the MORE flag,
//! at which point the registration is reissued.
//!
//! Per-connection I/O failures are handled locally (close + recycle) and
//! never escalate; ring or listener init failure is fatal to this worker
//! only.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use io_uring::{cqueue, opcode, squeue, types};

use ringserv_core::config::WorkerConfig;
use ringserv_core::error::{Result, ServError};
use ringserv_core::machine::Verdict;
use ringserv_core::pool::{ConnPool, PoolError};
use ringserv_core::token::{ConnRef, Op, Token};
use ringserv_core::{kdebug, kerror, kinfo, kwarn};

use crate::listener;
use crate::probe::ProbeReport;
use crate::ring::{Completion, Ring};

/// Per-worker counters. `pool_rejects` is the overload signal: accepts
/// turned away because every slot was live.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub accepts: u64,
    pub reads: u64,
    pub writes: u64,
    pub closes: u64,
    pub pool_rejects: u64,
    pub sq_drops: u64,
    pub io_errors: u64,
}

/// What a worker hands back to its joiner.
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub cpu_id: usize,
    pub stats: Stats,
    pub pool_free: usize,
    pub pool_capacity: usize,
}

/// One per-core event loop instance.
pub struct Worker {
    cfg: WorkerConfig,
    ring: Ring,
    listener: RawFd,
    pool: ConnPool,
    shutdown: Arc<AtomicBool>,
    stats: Stats,
    /// False once the kernel signals the multishot registration is
    /// exhausted; the loop reissues it before the next wait.
    accept_armed: bool,
    /// Boxed so the kernel-visible timespec address stays stable across
    /// moves of the worker.
    idle_ts: Option<Box<types::Timespec>>,
    batch: Vec<Completion>,
}

impl Worker {
    /// Build the worker's ring, listener, and pool. Failure here is fatal
    /// to this worker only; the caller decides whether that sinks the
    /// process.
    pub fn new(cfg: WorkerConfig, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let ring = Ring::new(cfg.ring_entries)?;

        let report = ProbeReport::capture(&ring)?;
        if !report.multishot_accept() {
            return Err(ServError::OpcodeUnsupported("accept_multi"));
        }

        let listener = listener::bind_listener(cfg.port, cfg.backlog)?;
        let pool = ConnPool::new(cfg.pool_capacity, cfg.buffer_size);

        let idle_ts = cfg.idle_timeout.map(|d| {
            Box::new(
                types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos()),
            )
        });

        Ok(Self {
            cfg,
            ring,
            listener,
            pool,
            shutdown,
            stats: Stats::default(),
            accept_armed: false,
            idle_ts,
            batch: Vec::with_capacity(256),
        })
    }

    /// The port the listener bound. Useful when configured with port 0.
    pub fn port(&self) -> Result<u16> {
        listener::local_port(self.listener)
    }

    /// Drive the loop until the shutdown flag is set, then drain and
    /// release everything.
    pub fn run(mut self) -> Result<Report> {
        pin_to_cpu(self.cfg.cpu_id);
        kinfo!(
            "worker {}: listening on :{} (ring {} entries, pool {} slots)",
            self.cfg.cpu_id,
            self.port().unwrap_or(self.cfg.port),
            self.ring.sq_entries(),
            self.pool.capacity()
        );

        let mut loop_err = None;
        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.accept_armed {
                self.arm_accept();
            }

            // The single suspension point: flush queued SQEs and block
            // until at least one completion (or the wait slice) is ready.
            if let Err(e) = self.ring.submit_and_wait() {
                // Fatal to this worker, but connections still get drained
                // and released below.
                kerror!("worker {}: ring wait failed: {}", self.cfg.cpu_id, e);
                loop_err = Some(e);
                break;
            }

            let mut batch = std::mem::take(&mut self.batch);
            self.ring.drain_completions(&mut batch);
            for c in &batch {
                self.handle(c);
            }
            self.batch = batch;
        }

        let report = self.teardown()?;
        match loop_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn handle(&mut self, c: &Completion) {
        match c.token.decode() {
            Some(Op::Accept) => self.on_accept(c),
            Some(Op::Read(conn)) => self.on_read(conn, c.result),
            Some(Op::Write(conn)) => self.on_write(conn, c.result),
            None => {
                if c.token == Token::IDLE_TIMEOUT {
                    // Fired (-ETIME) or cancelled by its read completing
                    // first (-ECANCELED); either way the read side already
                    // drives the connection.
                    kdebug!("worker {}: idle timer cqe {}", self.cfg.cpu_id, c.result);
                } else {
                    kwarn!(
                        "worker {}: unknown completion token {:#x}",
                        self.cfg.cpu_id,
                        c.token.raw()
                    );
                }
            }
        }
    }

    fn on_accept(&mut self, c: &Completion) {
        if c.result >= 0 {
            let fd = c.result as RawFd;
            listener::tune_socket(fd);
            match self.pool.acquire(fd) {
                Ok(conn) => {
                    self.stats.accepts += 1;
                    if !self.submit_read(conn) {
                        self.close_conn(conn);
                    }
                }
                Err(_) => {
                    // Overload: reject immediately, no slot acquired.
                    unsafe { libc::close(fd) };
                    self.stats.pool_rejects += 1;
                    kwarn!("worker {}: pool exhausted, rejecting fd {}", self.cfg.cpu_id, fd);
                }
            }
        } else {
            self.stats.io_errors += 1;
            kdebug!("worker {}: accept errno {}", self.cfg.cpu_id, -c.result);
        }

        if !cqueue::more(c.flags) {
            // Registration exhausted; reissue before the next wait.
            self.accept_armed = false;
        }
    }

    fn on_read(&mut self, conn: ConnRef, res: i32) {
        let Some(lc) = self.pool.lifecycle_mut(conn) else {
            kwarn!("worker {}: read cqe for vacant slot {}", self.cfg.cpu_id, conn.0);
            return;
        };
        match lc.on_read(res) {
            Verdict::SendResponse => {
                self.stats.reads += 1;
                if !self.submit_write(conn) {
                    self.close_conn(conn);
                }
            }
            Verdict::Close => self.close_conn(conn),
            Verdict::ReadNext => unreachable!("read completion cannot ask for a read"),
        }
    }

    fn on_write(&mut self, conn: ConnRef, res: i32) {
        let Some(lc) = self.pool.lifecycle_mut(conn) else {
            kwarn!("worker {}: write cqe for vacant slot {}", self.cfg.cpu_id, conn.0);
            return;
        };
        match lc.on_write(res) {
            Verdict::ReadNext => {
                self.stats.writes += 1;
                if !self.submit_read(conn) {
                    self.close_conn(conn);
                }
            }
            Verdict::Close => {
                self.stats.io_errors += 1;
                self.close_conn(conn);
            }
            Verdict::SendResponse => unreachable!("write completion cannot ask for a write"),
        }
    }

    fn close_conn(&mut self, conn: ConnRef) {
        match self.pool.release(conn) {
            Ok(_) => self.stats.closes += 1,
            Err(PoolError::StaleRef) => {
                kwarn!("worker {}: double release of slot {}", self.cfg.cpu_id, conn.0)
            }
            Err(PoolError::Exhausted) => unreachable!(),
        }
    }

    fn arm_accept(&mut self) {
        let sqe = opcode::AcceptMulti::new(types::Fd(self.listener))
            .flags(libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK)
            .build()
            .user_data(Op::Accept.encode().raw());
        match self.ring.push(&sqe) {
            Ok(()) => self.accept_armed = true,
            Err(e) => {
                // Retried next iteration; accepts stall but nothing is lost.
                self.stats.sq_drops += 1;
                kwarn!("worker {}: accept rearm failed: {}", self.cfg.cpu_id, e);
            }
        }
    }

    /// Queue the next read on `conn`. Returns false if the submission
    /// queue rejected it even after a flush; the caller closes the
    /// connection rather than leaving it wedged.
    fn submit_read(&mut self, conn: ConnRef) -> bool {
        let Some(fd) = self.pool.fd(conn) else {
            return false;
        };
        let (ptr, len) = {
            let buf = match self.pool.buf_mut(conn) {
                Some(b) => b,
                None => return false,
            };
            (buf.as_mut_ptr(), buf.len())
        };

        let token = Op::Read(conn).encode();
        let sqe = opcode::Recv::new(types::Fd(fd), ptr, len as u32).build();

        if let Some(ts) = &self.idle_ts {
            let ts_ptr: *const types::Timespec = &**ts;
            // Both entries must land in the same flush: a LinkTimeout
            // submitted on its own completes -EINVAL and the read it was
            // meant to bound runs unlinked.
            if let Err(e) = self.ring.ensure_sq_capacity(2) {
                self.stats.sq_drops += 1;
                kwarn!("worker {}: read submit failed: {}", self.cfg.cpu_id, e);
                return false;
            }
            let sqe = sqe.flags(squeue::Flags::IO_LINK).user_data(token.raw());
            if let Err(e) = self.ring.push(&sqe) {
                self.stats.sq_drops += 1;
                kwarn!("worker {}: read submit failed: {}", self.cfg.cpu_id, e);
                return false;
            }
            let lt = opcode::LinkTimeout::new(ts_ptr)
                .build()
                .user_data(Token::IDLE_TIMEOUT.raw());
            if self.ring.push(&lt).is_err() {
                // Cannot happen after the reservation, but the read would
                // still stand, just without its timer.
                kwarn!("worker {}: idle timer dropped for slot {}", self.cfg.cpu_id, conn.0);
            }
            true
        } else {
            match self.ring.push(&sqe.user_data(token.raw())) {
                Ok(()) => true,
                Err(e) => {
                    self.stats.sq_drops += 1;
                    kwarn!("worker {}: read submit failed: {}", self.cfg.cpu_id, e);
                    false
                }
            }
        }
    }

    /// Queue the fixed response write on `conn`.
    fn submit_write(&mut self, conn: ConnRef) -> bool {
        let Some(fd) = self.pool.fd(conn) else {
            return false;
        };
        let sqe = opcode::Send::new(
            types::Fd(fd),
            self.cfg.response.as_ptr(),
            self.cfg.response.len() as u32,
        )
        .build()
        .user_data(Op::Write(conn).encode().raw());

        match self.ring.push(&sqe) {
            Ok(()) => true,
            Err(e) => {
                self.stats.sq_drops += 1;
                kwarn!("worker {}: write submit failed: {}", self.cfg.cpu_id, e);
                false
            }
        }
    }

    /// Drain outstanding completions, release every surviving connection,
    /// and report. The ring and listener close when the worker drops.
    fn teardown(mut self) -> Result<Report> {
        let _ = self.ring.submit();

        let mut batch = std::mem::take(&mut self.batch);
        self.ring.drain_completions(&mut batch);
        for c in &batch {
            match c.token.decode() {
                Some(Op::Read(conn)) | Some(Op::Write(conn)) => {
                    if self.pool.fd(conn).is_some() {
                        self.close_conn(conn);
                    }
                }
                // A connection accepted after the last drain never got a
                // slot; close the socket instead of leaking it.
                Some(Op::Accept) if c.result >= 0 => {
                    unsafe { libc::close(c.result as RawFd) };
                }
                _ => {}
            }
        }

        let stats = &mut self.stats;
        self.pool.drain(|_| stats.closes += 1);

        let report = Report {
            cpu_id: self.cfg.cpu_id,
            stats: self.stats,
            pool_free: self.pool.free_count(),
            pool_capacity: self.pool.capacity(),
        };
        kinfo!(
            "worker {}: stopped; accepts={} reads={} writes={} closes={} rejects={} sq_drops={} errors={}",
            report.cpu_id,
            report.stats.accepts,
            report.stats.reads,
            report.stats.writes,
            report.stats.closes,
            report.stats.pool_rejects,
            report.stats.sq_drops,
            report.stats.io_errors,
        );
        Ok(report)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        unsafe { libc::close(self.listener) };
    }
}

/// Pin the calling thread to one CPU. Best-effort: a cpuset-restricted
/// environment refusing the affinity still runs the worker, unpinned.
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            kwarn!("worker {}: sched_setaffinity failed, running unpinned", cpu);
        }
    }
}
