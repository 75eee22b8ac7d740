//! # ringserv-core — Shared types for the per-core io_uring server
//!
//! Everything in this crate is platform-independent and single-threaded by
//! construction: a worker owns its pool and lifecycle state exclusively, so
//! no type here needs locks or atomics.
//!
//! The I/O layer (`ringserv-uring`) composes these pieces:
//!
//! - [`token`] — correlation tokens carried in io_uring `user_data`
//! - [`pool`] — fixed-capacity connection slot pool
//! - [`machine`] — per-connection lifecycle state machine
//! - [`config`] — server/worker configuration
//! - [`error`] — error types
//! - [`klog`] — leveled stderr logging macros

pub mod config;
pub mod error;
pub mod klog;
pub mod machine;
pub mod pool;
pub mod token;
