//! Per-connection lifecycle state machine.
//!
//! A connection does not exist before its accept completion and stops
//! existing when its pool slot is released, so the machine only models the
//! two live states:
//!
//! ```text
//! accept ──▶ AwaitingRead ──read>0──▶ AwaitingWrite ──write ok──▶ AwaitingRead ...
//!                 │read<=0                   │write err
//!                 ▼                          ▼
//!              (released)                (released)
//! ```
//!
//! The worker owns the side effects; [`Lifecycle`] only decides. Feeding an
//! event that does not match the current state is a protocol bug in the
//! caller and resolves to [`Verdict::Close`].

/// Live states of a pooled connection. `Closed` is terminal and represented
/// by the slot being released, not by a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// A read is in flight (or about to be submitted).
    AwaitingRead,
    /// The fixed response write is in flight.
    AwaitingWrite,
}

/// What the worker must do after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Submit the fixed response write.
    SendResponse,
    /// Submit the next read on the same connection.
    ReadNext,
    /// Release the slot (close the handle, return it to the pool).
    Close,
}

/// Transition logic for one connection slot.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    state: ConnState,
}

impl Lifecycle {
    /// State of a freshly accepted connection: its first read is submitted
    /// immediately after the slot is acquired.
    pub fn new() -> Self {
        Self {
            state: ConnState::AwaitingRead,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Read completion. `res` is the CQE result: bytes read, zero on peer
    /// close, negative errno on error.
    pub fn on_read(&mut self, res: i32) -> Verdict {
        debug_assert_eq!(self.state, ConnState::AwaitingRead, "read out of order");
        if self.state != ConnState::AwaitingRead {
            return Verdict::Close;
        }
        if res <= 0 {
            return Verdict::Close;
        }
        self.state = ConnState::AwaitingWrite;
        Verdict::SendResponse
    }

    /// Write completion. `res` is bytes written or negative errno.
    pub fn on_write(&mut self, res: i32) -> Verdict {
        debug_assert_eq!(self.state, ConnState::AwaitingWrite, "write out of order");
        if self.state != ConnState::AwaitingWrite {
            return Verdict::Close;
        }
        if res < 0 {
            return Verdict::Close;
        }
        self.state = ConnState::AwaitingRead;
        Verdict::ReadNext
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_write_cycle() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.state(), ConnState::AwaitingRead);

        assert_eq!(lc.on_read(128), Verdict::SendResponse);
        assert_eq!(lc.state(), ConnState::AwaitingWrite);

        assert_eq!(lc.on_write(2), Verdict::ReadNext);
        assert_eq!(lc.state(), ConnState::AwaitingRead);
    }

    #[test]
    fn test_keepalive_repeats_indefinitely() {
        let mut lc = Lifecycle::new();
        for _ in 0..1000 {
            assert_eq!(lc.on_read(1), Verdict::SendResponse);
            assert_eq!(lc.on_write(0), Verdict::ReadNext);
        }
    }

    #[test]
    fn test_peer_close_and_errors_close() {
        const ECONNRESET: i32 = 104;

        let mut lc = Lifecycle::new();
        assert_eq!(lc.on_read(0), Verdict::Close);

        let mut lc = Lifecycle::new();
        assert_eq!(lc.on_read(-ECONNRESET), Verdict::Close);

        let mut lc = Lifecycle::new();
        lc.on_read(64);
        assert_eq!(lc.on_write(-ECONNRESET), Verdict::Close);
    }

    #[test]
    fn test_zero_length_write_is_success() {
        let mut lc = Lifecycle::new();
        lc.on_read(8);
        assert_eq!(lc.on_write(0), Verdict::ReadNext);
    }
}
