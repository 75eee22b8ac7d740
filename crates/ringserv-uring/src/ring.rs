//! Thin owner of one `io_uring::IoUring`.
//!
//! Plain `io_uring_enter()` submission, CQ polled for completions. No
//! SQPOLL, no fixed files, no fixed buffers: works on any kernel with
//! io_uring. The worker drives it with one blocking submit-and-wait per
//! loop iteration and drains the whole ready batch afterwards.

use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{squeue, IoUring};
use ringserv_core::error::{Result, ServError};
use ringserv_core::token::Token;

/// One completed operation, copied out of the CQ.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub token: Token,
    pub result: i32,
    pub flags: u32,
}

/// One worker's queue pair.
pub struct Ring {
    ring: IoUring,
    /// Timeout handed to `submit_and_wait` so a blocked worker re-checks
    /// the shutdown flag at bounded latency. Boxed: the kernel reads it
    /// while we wait, so the address must be stable.
    wait_ts: Box<Timespec>,
}

/// How long one blocking wait may last before the loop re-checks the
/// shutdown flag.
const WAIT_SLICE_MS: u64 = 100;

impl Ring {
    /// `entries` must be a power of two.
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| ServError::RingSetup(e.raw_os_error().unwrap_or(-1)))?;
        Ok(Self {
            ring,
            wait_ts: Box::new(Timespec::new().nsec((WAIT_SLICE_MS * 1_000_000) as u32)),
        })
    }

    pub(crate) fn inner(&self) -> &IoUring {
        &self.ring
    }

    /// Queue an SQE. If the SQ is full, flush once and retry; only then
    /// report `SqFull`. Never silently drops the operation.
    ///
    /// Safety contract with callers: any buffer the entry points at must
    /// stay valid until the completion is reaped. The worker upholds this
    /// by keeping buffers in pool slots that are released only on
    /// completion.
    pub(crate) fn push(&mut self, sqe: &squeue::Entry) -> Result<()> {
        unsafe {
            if self.ring.submission().push(sqe).is_ok() {
                return Ok(());
            }
        }
        self.submit()?;
        unsafe {
            self.ring
                .submission()
                .push(sqe)
                .map_err(|_| ServError::SqFull)
        }
    }

    /// Make room for `n` more SQEs, flushing queued entries first if
    /// needed. Callers pushing linked pairs reserve both slots up front so
    /// a mid-pair flush never detaches the link.
    pub(crate) fn ensure_sq_capacity(&mut self, n: usize) -> Result<()> {
        let free = {
            let sq = self.ring.submission();
            sq.capacity() - sq.len()
        };
        if free >= n {
            return Ok(());
        }
        self.submit()?;
        let sq = self.ring.submission();
        if sq.capacity() - sq.len() >= n {
            Ok(())
        } else {
            Err(ServError::SqFull)
        }
    }

    /// Kick queued submissions without waiting.
    pub fn submit(&mut self) -> Result<usize> {
        self.ring
            .submit()
            .map_err(|e| ServError::RingSubmit(e.raw_os_error().unwrap_or(-1)))
    }

    /// Submit everything queued and block until at least one completion is
    /// ready, a signal interrupts, or the wait slice elapses.
    ///
    /// Returns `Ok(false)` on timeout or `EINTR` (nothing necessarily
    /// ready), `Ok(true)` otherwise. The single suspension point per loop
    /// iteration.
    pub fn submit_and_wait(&mut self) -> Result<bool> {
        let res = if self.ring.params().is_feature_ext_arg() {
            let args = SubmitArgs::new().timespec(&self.wait_ts);
            self.ring.submitter().submit_with_args(1, &args)
        } else {
            // Pre-5.11 kernels: no EXT_ARG. Shutdown then relies on the
            // termination signal interrupting the wait.
            self.ring.submit_and_wait(1)
        };
        match res {
            Ok(_) => Ok(true),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) => Ok(false),
                Some(errno) => Err(ServError::RingSubmit(errno)),
                None => Err(ServError::RingSubmit(-1)),
            },
        }
    }

    /// Drain every ready completion into `batch` (cleared first). Returns
    /// the batch size. Non-blocking.
    pub fn drain_completions(&mut self, batch: &mut Vec<Completion>) -> usize {
        batch.clear();
        for cqe in self.ring.completion() {
            batch.push(Completion {
                token: Token(cqe.user_data()),
                result: cqe.result(),
                flags: cqe.flags(),
            });
        }
        batch.len()
    }

    pub fn sq_entries(&self) -> u32 {
        self.ring.params().sq_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use io_uring::opcode;

    fn ring_or_skip(entries: u32) -> Option<Ring> {
        match Ring::new(entries) {
            Ok(r) => Some(r),
            // Environments that deny io_uring (seccomp, old kernels).
            Err(ServError::RingSetup(_)) => None,
            Err(e) => panic!("unexpected ring error: {}", e),
        }
    }

    #[test]
    fn test_nop_round_trip() {
        let Some(mut ring) = ring_or_skip(8) else {
            return;
        };
        let sqe = opcode::Nop::new().build().user_data(0x42);
        ring.push(&sqe).unwrap();
        assert!(ring.submit_and_wait().unwrap());

        let mut batch = Vec::new();
        let n = ring.drain_completions(&mut batch);
        assert_eq!(n, 1);
        assert_eq!(batch[0].token.raw(), 0x42);
        assert_eq!(batch[0].result, 0);
    }

    #[test]
    fn test_push_flushes_full_sq() {
        let Some(mut ring) = ring_or_skip(4) else {
            return;
        };
        // More NOPs than SQ entries: push must flush mid-way rather than
        // drop or error.
        for i in 0..16u64 {
            let sqe = opcode::Nop::new().build().user_data(i);
            ring.push(&sqe).unwrap();
        }
        ring.submit().unwrap();

        let mut batch = Vec::new();
        let mut seen = 0;
        while seen < 16 {
            assert!(ring.submit_and_wait().is_ok());
            seen += ring.drain_completions(&mut batch);
        }
        assert_eq!(seen, 16);
    }

    #[test]
    fn test_ensure_sq_capacity_flushes_to_make_room() {
        let Some(mut ring) = ring_or_skip(4) else {
            return;
        };
        for i in 0..3u64 {
            ring.push(&opcode::Nop::new().build().user_data(i)).unwrap();
        }
        // One slot left; reserving two must flush the queued entries
        // instead of failing.
        ring.ensure_sq_capacity(2).unwrap();
        for i in 3..5u64 {
            ring.push(&opcode::Nop::new().build().user_data(i)).unwrap();
        }
        ring.submit().unwrap();

        let mut batch = Vec::new();
        let mut seen = 0;
        while seen < 5 {
            assert!(ring.submit_and_wait().is_ok());
            seen += ring.drain_completions(&mut batch);
        }
        assert_eq!(seen, 5);

        // A reservation wider than the SQ itself can never be met.
        assert!(matches!(
            ring.ensure_sq_capacity(64),
            Err(ServError::SqFull)
        ));
    }
}
