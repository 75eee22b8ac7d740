//! Fixed-capacity connection pool.
//!
//! All slots and their byte buffers are allocated once at worker startup;
//! the steady-state hot path never allocates. Freed slots are reused LIFO
//! for cache-friendly reuse of recently touched buffers.
//!
//! Release closes the connection's fd and is the only way a slot goes back
//! to the pool. The fd is `take()`n out of the slot, so a second release of
//! the same ref fails with [`PoolError::StaleRef`] instead of closing a
//! handle twice.

use crate::machine::Lifecycle;
use crate::token::ConnRef;
use std::os::unix::io::RawFd;

/// Pool errors. Both are recovered locally by the worker, never escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is live; the new connection must be rejected.
    Exhausted,
    /// The ref does not name a live slot (already released, or never
    /// acquired).
    StaleRef,
}

struct Slot {
    /// `None` while the slot is on the free stack.
    fd: Option<RawFd>,
    lifecycle: Lifecycle,
    buf: Box<[u8]>,
}

/// Fixed-capacity slot allocator mapping live sockets to per-connection
/// buffers. Owned by exactly one worker; no interior synchronization.
pub struct ConnPool {
    slots: Vec<Slot>,
    /// LIFO stack of free slot indices.
    free_stack: Vec<u32>,
}

impl ConnPool {
    /// Pre-allocate `capacity` slots, each with a `buf_size`-byte buffer.
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                fd: None,
                lifecycle: Lifecycle::new(),
                buf: vec![0u8; buf_size].into_boxed_slice(),
            })
            .collect();
        // Top of stack = highest index; popped first.
        let free_stack = (0..capacity as u32).collect();
        Self { slots, free_stack }
    }

    /// Bind `fd` to a free slot. O(1).
    pub fn acquire(&mut self, fd: RawFd) -> Result<ConnRef, PoolError> {
        let idx = self.free_stack.pop().ok_or(PoolError::Exhausted)?;
        let slot = &mut self.slots[idx as usize];
        debug_assert!(slot.fd.is_none(), "free-stack slot still live");
        slot.fd = Some(fd);
        slot.lifecycle = Lifecycle::new();
        Ok(ConnRef(idx))
    }

    /// Close the slot's fd and return the slot to the free stack. O(1).
    ///
    /// Returns the closed fd (already closed; useful for logging). A ref
    /// that is not live yields `StaleRef` and has no effect.
    pub fn release(&mut self, conn: ConnRef) -> Result<RawFd, PoolError> {
        let slot = self
            .slots
            .get_mut(conn.index())
            .ok_or(PoolError::StaleRef)?;
        let fd = slot.fd.take().ok_or(PoolError::StaleRef)?;
        // Close here so the handle is closed exactly once, on exactly the
        // release path.
        unsafe {
            libc::close(fd);
        }
        self.free_stack.push(conn.0);
        Ok(fd)
    }

    /// The slot's fd, if the ref is live.
    #[inline]
    pub fn fd(&self, conn: ConnRef) -> Option<RawFd> {
        self.slots.get(conn.index())?.fd
    }

    /// The slot's read buffer, if the ref is live.
    #[inline]
    pub fn buf_mut(&mut self, conn: ConnRef) -> Option<&mut [u8]> {
        let slot = self.slots.get_mut(conn.index())?;
        slot.fd?;
        Some(&mut slot.buf)
    }

    /// The slot's lifecycle state, if the ref is live.
    #[inline]
    pub fn lifecycle_mut(&mut self, conn: ConnRef) -> Option<&mut Lifecycle> {
        let slot = self.slots.get_mut(conn.index())?;
        slot.fd?;
        Some(&mut slot.lifecycle)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_stack.len()
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_stack.len()
    }

    /// Release every live slot. Shutdown teardown: each surviving handle is
    /// closed exactly once. Calls `f` with each ref before it is released.
    pub fn drain<F: FnMut(ConnRef)>(&mut self, mut f: F) {
        for idx in 0..self.slots.len() as u32 {
            let conn = ConnRef(idx);
            if self.slots[idx as usize].fd.is_some() {
                f(conn);
                let _ = self.release(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Slots hold real fds in production; tests use pipe fds so close() in
    // release targets something we own.
    fn fresh_fd() -> RawFd {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { libc::close(fds[1]) };
        fds[0]
    }

    #[test]
    fn test_acquire_release_restores_free_count() {
        let mut pool = ConnPool::new(8, 64);
        assert_eq!(pool.free_count(), 8);

        let refs: Vec<_> = (0..5).map(|_| pool.acquire(fresh_fd()).unwrap()).collect();
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.live_count(), 5);

        for c in refs {
            pool.release(c).unwrap();
        }
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_lifo_reuse() {
        let mut pool = ConnPool::new(4, 64);
        let a = pool.acquire(fresh_fd()).unwrap();
        let _b = pool.acquire(fresh_fd()).unwrap();
        pool.release(a).unwrap();
        // The just-freed slot comes back first.
        let c = pool.acquire(fresh_fd()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = ConnPool::new(2, 64);
        let _a = pool.acquire(fresh_fd()).unwrap();
        let _b = pool.acquire(fresh_fd()).unwrap();
        let fd = fresh_fd();
        assert_eq!(pool.acquire(fd), Err(PoolError::Exhausted));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_double_release_rejected() {
        let mut pool = ConnPool::new(2, 64);
        let a = pool.acquire(fresh_fd()).unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.release(a), Err(PoolError::StaleRef));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_stale_ref_accessors() {
        let mut pool = ConnPool::new(2, 64);
        let a = pool.acquire(fresh_fd()).unwrap();
        pool.release(a).unwrap();
        assert!(pool.fd(a).is_none());
        assert!(pool.buf_mut(a).is_none());
        assert!(pool.lifecycle_mut(a).is_none());
        assert_eq!(pool.fd(ConnRef(999)), None);
    }

    #[test]
    fn test_no_slot_shared_by_two_live_conns() {
        let mut pool = ConnPool::new(16, 64);
        let mut live = Vec::new();
        for _ in 0..16 {
            live.push(pool.acquire(fresh_fd()).unwrap());
        }
        let mut seen: Vec<u32> = live.iter().map(|c| c.0).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_drain_releases_everything_once() {
        let mut pool = ConnPool::new(8, 64);
        for _ in 0..6 {
            pool.acquire(fresh_fd()).unwrap();
        }
        let mut drained = 0;
        pool.drain(|_| drained += 1);
        assert_eq!(drained, 6);
        assert_eq!(pool.free_count(), 8);
        // Idempotent on an empty pool.
        pool.drain(|_| drained += 1);
        assert_eq!(drained, 6);
    }
}
