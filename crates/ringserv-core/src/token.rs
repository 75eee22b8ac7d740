//! Correlation tokens for io_uring completions.
//!
//! A completion queue entry carries nothing back except the `user_data`
//! value chosen at submission time. The [`Token`] is the sole demultiplexer:
//! it packs the operation kind and (for read/write) the connection's pool
//! slot index into one `u64`, and decodes exactly on the way out.
//!
//! The slot index is a stable integer, never an address — decoding a token
//! can not fabricate a pointer, only name a slot the pool validates.

/// Stable identifier for a slot in a worker's connection pool.
///
/// Valid only between `acquire` and `release`; the pool rejects refs to
/// vacant slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ConnRef(pub u32);

impl ConnRef {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An in-flight operation, as named by a token.
///
/// `Accept` is listener-scoped and carries no connection reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Accept,
    Read(ConnRef),
    Write(ConnRef),
}

// user_data layout: [63:56] = kind, [31:0] = slot index (zero for Accept).
const KIND_SHIFT: u32 = 56;
const KIND_ACCEPT: u64 = 1;
const KIND_READ: u64 = 2;
const KIND_WRITE: u64 = 3;
const KIND_SENTINEL: u64 = 0xFF;
const REF_MASK: u64 = u32::MAX as u64;

/// Opaque `user_data` value attached to a submission and echoed on its
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Token(pub u64);

impl Token {
    /// Sentinel for linked idle-timeout completions. Decodes to `None`;
    /// the event loop skips it.
    pub const IDLE_TIMEOUT: Self = Self(KIND_SENTINEL << KIND_SHIFT);

    /// Recover the (kind, ref) pair this token was encoded from.
    ///
    /// Returns `None` for the sentinel and for values that were never
    /// produced by [`Op::encode`].
    #[inline]
    pub fn decode(self) -> Option<Op> {
        let conn = ConnRef((self.0 & REF_MASK) as u32);
        match self.0 >> KIND_SHIFT {
            KIND_ACCEPT => Some(Op::Accept),
            KIND_READ => Some(Op::Read(conn)),
            KIND_WRITE => Some(Op::Write(conn)),
            _ => None,
        }
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Op {
    /// Pack this operation into a `user_data` token.
    #[inline]
    pub fn encode(self) -> Token {
        match self {
            Op::Accept => Token(KIND_ACCEPT << KIND_SHIFT),
            Op::Read(c) => Token(KIND_READ << KIND_SHIFT | c.0 as u64),
            Op::Write(c) => Token(KIND_WRITE << KIND_SHIFT | c.0 as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_kind() {
        let refs = [0u32, 1, 7, u32::MAX / 2, u32::MAX - 1, u32::MAX];
        for r in refs {
            let c = ConnRef(r);
            for op in [Op::Accept, Op::Read(c), Op::Write(c)] {
                assert_eq!(op.encode().decode(), Some(op), "op {:?}", op);
            }
        }
    }

    #[test]
    fn accept_carries_no_ref() {
        // Whatever ref was in scope, Accept encodes the same token.
        assert_eq!(Op::Accept.encode(), Op::Accept.encode());
        assert_eq!(Op::Accept.encode().raw() & REF_MASK, 0);
    }

    #[test]
    fn kinds_are_disjoint() {
        let c = ConnRef(42);
        let tokens = [
            Op::Accept.encode(),
            Op::Read(c).encode(),
            Op::Write(c).encode(),
            Token::IDLE_TIMEOUT,
        ];
        for (i, a) in tokens.iter().enumerate() {
            for (j, b) in tokens.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }

    #[test]
    fn sentinel_and_garbage_decode_to_none() {
        assert_eq!(Token::IDLE_TIMEOUT.decode(), None);
        assert_eq!(Token(0).decode(), None);
        assert_eq!(Token(u64::MAX).decode(), None);
        assert_eq!(Token(0x07 << KIND_SHIFT).decode(), None);
    }
}
