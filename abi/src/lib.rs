//! Wire-level types shared by every crate in the workspace: work operation tags,
//! the error taxonomy, flag bits, and VirtIO on-the-wire constants.
//!
//! Nothing in this crate touches hardware or allocates; it exists so `core`,
//! `virtio`, `drivers` and `platform` agree on one definition of each shared type.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod error;
pub mod flags;
pub mod op;
pub mod virtio;

pub use error::WorkError;
pub use flags::WorkFlags;
pub use op::WorkOp;
