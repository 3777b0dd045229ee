//! The async work-queue kernel: work items, intrusive queues, the timer
//! min-heap, and the submit/cancel/tick state machine (spec §3, §4).
//!
//! This crate has no notion of hardware, VirtIO, or even of what a "platform"
//! is beyond the [`kernel::TickHooks`] seam — everything here is plain,
//! pointer-manipulating, allocation-free logic, which is why its test suite
//! runs as ordinary host `#[test]`s.

#![cfg_attr(not(test), no_std)]

pub mod cancel;
pub mod config;
pub mod kernel;
pub mod queue;
pub mod timer_heap;
pub mod work;

pub use cancel::{Cancellable, WorkHandle};
pub use kernel::{Kernel, TickHooks};
pub use work::{WorkCallback, WorkHeader, WorkItem, WorkKind, WorkState};
