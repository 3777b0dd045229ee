//! Kernel entry point: bootstrap the CSPRNG seed, then hand off to the event
//! loop (spec §4.5, §4.8, §6).
//!
//! Trimmed hard relative to the teacher's `kernel/src/main.rs`: no bootloader
//! protocol, no global allocator, no scheduler/fs/gfx/userland force-links —
//! this kernel has none of those subsystems (spec §1 Non-goals). The default
//! build links `std` and runs against [`microq_platform::software::SoftwarePlatform`]
//! as a host-runnable demonstration of the event loop; the `hw` feature
//! switches to `#![no_std] #![no_main]` and an `extern "C" kernel_main` the
//! out-of-scope boot assembly would call.

#![cfg_attr(feature = "hw", no_std)]
#![cfg_attr(feature = "hw", no_main)]

use microq_core::kernel::Kernel;
use microq_lib::klog::{klog_register_backend, klog_set_level, KlogLevel};
use microq_lib::klog_info;
use microq_platform::run_event_loop;

#[cfg(feature = "hw")]
mod hw_entry {
    use super::*;
    use core::panic::PanicInfo;
    use microq_platform::hw::HwPlatform;

    #[panic_handler]
    fn panic(_info: &PanicInfo) -> ! {
        // No serial backend is guaranteed to be alive at panic time in this
        // sketch (the panic may predate `HwPlatform::new`), so this just
        // halts rather than trying to log.
        x86_64::instructions::interrupts::disable();
        loop {
            x86_64::instructions::hlt();
        }
    }

    /// Called by the boot assembly this crate treats as an external
    /// collaborator (spec §1 Non-goals: boot protocol bring-up is out of
    /// scope). The caller is expected to have already mapped the three
    /// virtio-mmio windows and reserved `com_port` before jumping here.
    ///
    /// # Safety
    /// `rng_base`/`blk_base`/`net_base` must each point at a live virtio-mmio
    /// window for the matching device, and `com_port` must be an unclaimed
    /// serial port, for the remaining lifetime of the system.
    #[no_mangle]
    pub unsafe extern "C" fn kernel_main(
        rng_base: *mut u8,
        blk_base: *mut u8,
        net_base: *mut u8,
        com_port: u16,
    ) -> ! {
        let mut platform = match unsafe { HwPlatform::new(rng_base, blk_base, net_base, com_port) } {
            Ok(p) => p,
            Err(_) => {
                x86_64::instructions::interrupts::disable();
                loop {
                    x86_64::instructions::hlt();
                }
            }
        };
        klog_set_level(KlogLevel::Info);
        // CSPRNG bootstrap (spec §4.8, §9) is not wired up for this sketch:
        // `EntropyDriver::poll_once` services its own avail ring against an
        // `EntropySource`, which only makes sense for the software device
        // model — a real device completes requests on its own, so this
        // would need a poll-only variant that just spins on the used ring.
        let mut kernel = Kernel::new();
        run_event_loop(&mut kernel, &mut platform)
    }
}

#[cfg(not(feature = "hw"))]
fn stdio_backend(args: core::fmt::Arguments<'_>) {
    println!("{args}");
}

#[cfg(not(feature = "hw"))]
fn main() {
    use microq_platform::software::SoftwarePlatform;

    klog_register_backend(stdio_backend);
    klog_set_level(KlogLevel::Info);

    let mut platform = SoftwarePlatform::new();
    let mut seed = [0u8; 32];
    match platform.bootstrap_entropy(&mut seed) {
        Ok(n) => klog_info!("entropy bootstrap produced {n} bytes"),
        Err(e) => klog_info!("entropy bootstrap failed: {e}"),
    }

    let mut kernel = Kernel::new();
    run_event_loop(&mut kernel, &mut platform)
}
