//! # ringserv-uring — io_uring layer
//!
//! One [`worker::Worker`] per core, each owning one ring, one SO_REUSEPORT
//! listener, and one connection pool. Nothing in this crate is shared
//! between threads except the shutdown flag a worker is spawned with.
//!
//! - [`ring`] — thin owner of one `io_uring::IoUring`
//! - [`listener`] — per-worker listener setup and socket tuning
//! - [`probe`] — kernel opcode support probe
//! - [`worker`] — the per-core event loop

pub mod listener;
pub mod probe;
pub mod ring;
pub mod worker;
