//! VirtIO split-virtqueue transport: descriptor table, available/used rings,
//! and transport-agnostic feature negotiation over both the memory-mapped
//! and PCI-capability transports (spec §4.7, §9 Open Questions).
//!
//! This crate knows the wire format; it does not know how to reach a
//! register — that narrow seam is the [`regs::ConfigRegion`] trait, supplied
//! by `microq-platform` (real MMIO under the `hw` feature, or an in-memory
//! model for `SoftwarePlatform`). Keeping that boundary here is what lets
//! `queue.rs`'s descriptor-chain bookkeeping and `negotiate()`'s state
//! machine run as ordinary host tests.

#![cfg_attr(not(test), no_std)]

pub mod mmio;
pub mod pci;
pub mod queue;
pub mod regs;
pub mod transport;

pub use queue::{Virtqueue, QUEUE_SIZE};
pub use regs::ConfigRegion;
pub use transport::{negotiate, set_driver_ok, FeatureNegotiation, NegotiationError, VirtioTransport};
