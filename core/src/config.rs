//! Compile-time tunables for the work-item model (spec §10.3).
//!
//! These bound the fixed-size arrays embedded in requests so nothing in this
//! crate ever allocates. Raise them if a deployment needs deeper chains; they
//! are plain `pub const`s, not a runtime-configurable surface, because a
//! kernel with no filesystem and no process environment has nowhere to read
//! runtime configuration from.

/// Maximum number of `{sector, buffer}` segments in one block request.
pub const MAX_BLOCK_SEGMENTS: usize = 8;

/// Maximum number of buffers in a standing NetRecv ring.
pub const MAX_NET_RECV_BUFFERS: usize = 8;

/// Maximum number of packets batched into one NetSend request.
pub const MAX_NET_SEND_BUFFERS: usize = 4;

/// Clamp on the event loop's wait-for-interrupt timeout (spec §4.5), in ms.
pub const MAX_WAIT_MS: u64 = 2_000;
