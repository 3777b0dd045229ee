//! The narrow seam between the hardware-agnostic kernel/drivers and whatever
//! sits below them: a clock, real interrupts, and the VirtIO devices'
//! physical transports (spec §6).
//!
//! Two implementations exist: [`software::SoftwarePlatform`], an in-process
//! software model of all three devices and this crate's primary test
//! harness, and a `hw`-feature bare-metal sketch wiring the same trait to
//! real MMIO/PCI/interrupt primitives (thin `extern "C"` hooks rather than a
//! full driver, since real hardware bring-up is out of scope per spec §1).

#![cfg_attr(not(test), no_std)]

use microq_core::config::MAX_WAIT_MS;
use microq_core::kernel::{Kernel, TickHooks};

pub mod software;

#[cfg(feature = "hw")]
pub mod hw;

/// Handler installed via [`Platform::irq_register`]; receives the opaque
/// context pointer supplied at registration time.
pub type IrqHandler = fn(ctx: *mut ());

/// The platform surface the kernel's event loop and bootstrap code call into
/// (spec §6). A `Platform` *is* a [`TickHooks`]: `platform_tick`/`forward`/
/// `release_net_buffer` are exactly the hooks `Kernel::tick` needs, routed to
/// whichever devices this platform owns. The methods below are the ones the
/// event loop needs outside of a tick, or that live below the kernel/driver
/// boundary entirely.
pub trait Platform: TickHooks {
    /// Block until an interrupt arrives or `timeout_ms` elapses, whichever
    /// is first, then return the current monotonic time in milliseconds.
    /// The event loop passes `next_delay()` clamped to `MAX_WAIT_MS` here.
    fn wait_for_interrupt(&mut self, timeout_ms: u64) -> u64;

    /// Current monotonic time, without blocking.
    fn now_ms(&self) -> u64;

    /// Install a handler for interrupt line `num`. Registering a new handler
    /// on a line replaces whatever was there.
    fn irq_register(&mut self, num: u8, handler: IrqHandler, ctx: *mut ());

    /// Unmask interrupt line `num` so it can actually fire.
    fn irq_enable(&mut self, num: u8);

    /// Halt on an unrecoverable invariant violation. The kernel itself never
    /// aborts on a per-request failure (spec §7) — this exists for the
    /// platform layer to use when its own invariants break (e.g. a
    /// descriptor table corrupted beyond what `WorkError` can express).
    fn abort(&self) -> !;
}

/// Run the event loop forever (spec §4.5): tick, compute the next timer
/// deadline, sleep until then or until an interrupt arrives, repeat.
///
/// Never returns. Submitting work and registering callbacks happens before
/// calling this, or from inside a callback itself (those submissions land on
/// the following tick per the usual ordering guarantee).
pub fn run_event_loop<P: Platform>(kernel: &mut Kernel, platform: &mut P) -> ! {
    let mut now = platform.now_ms();
    loop {
        kernel.tick(now, platform);
        let wait = kernel
            .next_delay()
            .map(|d| d.min(MAX_WAIT_MS))
            .unwrap_or(MAX_WAIT_MS);
        now = platform.wait_for_interrupt(wait);
    }
}
