//! Ambient support library: logging, one-time initialisation, and the lock-free
//! structures that cross the interrupt/foreground boundary.
//!
//! None of this crate touches hardware directly — it is the same kind of
//! "small, dependency-light support crate" role the teacher's `slopos-lib`
//! plays, trimmed to what a single-core, single-threaded kernel actually needs.

#![cfg_attr(not(test), no_std)]

pub mod debug_history;
pub mod irq_ring;
pub mod klog;
pub mod once_lock;

pub use once_lock::OnceLock;
