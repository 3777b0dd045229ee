//! Compile-time driver tunables (spec §9, Compile-time tunables).

/// Sector size in bytes, fixed by the VirtIO block spec.
pub const SECTOR_SIZE: u64 = 512;

/// Spin budget for [`crate::entropy::EntropyDriver::poll_once`]'s bounded
/// synchronous wait, used only by the CSPRNG bootstrap before the event loop
/// is safe to drive (spec §4.8).
pub const RNG_BOOTSTRAP_SPIN_BUDGET: u32 = 1_000_000;
