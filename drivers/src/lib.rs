//! Completion-driven VirtIO device drivers: entropy, block, network (spec
//! §4.8–§4.10).
//!
//! Each driver owns one (or two, for network) [`microq_virtio::Virtqueue`]
//! plus a transport `T: VirtioTransport`, generalized over transport so the
//! same driver code runs unmodified over MMIO or PCI. None of this talks to
//! real memory, an interrupt controller, or a clock — those seams are the
//! `*Source`/`*Store`/`*Peer` traits each driver module defines, which
//! `microq-platform`'s `SoftwarePlatform` implements for tests and a `hw`
//! backend implements against a real device.
//!
//! Grounded on the teacher's `drivers/src/virtio_blk.rs`,
//! `drivers/src/virtio_net.rs`, and `drivers/src/random.rs` for driver
//! *mechanics* (descriptor chain shapes, completion dispatch); the
//! completion-callback wiring itself is novel, since the teacher's drivers
//! block synchronously on a request rather than handing a work item back to
//! an event loop.

#![cfg_attr(not(test), no_std)]

pub mod block;
pub mod config;
pub mod entropy;
pub mod net;

pub use block::{BlockDriver, BlockStore};
pub use entropy::{EntropyDriver, EntropySource};
pub use net::{NetDriver, NetPeer};
