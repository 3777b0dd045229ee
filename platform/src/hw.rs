//! Bare-metal sketch (spec §6, §10.4): wires the same `Platform`/`TickHooks`
//! contract to real virtio-mmio windows and a 16550 serial console instead of
//! the software device model `SoftwarePlatform` provides.
//!
//! Deliberately thin — bringing up a real timer source, interrupt routing,
//! and PCI enumeration is out of scope (spec §1 Non-goals: "bring-up of real
//! hardware"). This exists to demonstrate the `Platform` seam is genuinely
//! hardware-agnostic, not to boot unmodified on real silicon; a production
//! `hw` backend would still need a real clock and a real interrupt
//! controller behind `wait_for_interrupt`/`irq_enable`.

use core::ptr::NonNull;

use microq_abi::{WorkError, WorkOp};
use microq_core::kernel::{Kernel, TickHooks};
use microq_core::work::WorkItem;
use microq_drivers::{BlockDriver, EntropyDriver, NetDriver};
use microq_virtio::mmio::MmioTransport;
use microq_virtio::queue::QUEUE_SIZE;
use microq_virtio::regs::ConfigRegion;
use microq_virtio::NegotiationError;
use uart_16550::SerialPort;
use x86_64::instructions::hlt;

use crate::{IrqHandler, Platform};

/// A volatile window onto a real virtio-mmio device, at a base address the
/// boot assembly this crate treats as an external collaborator (spec §1) is
/// expected to have mapped before `kernel_main` runs.
pub struct RawMmioRegion {
    base: *mut u8,
}

// SAFETY: exclusive access to the window is the caller's obligation, made
// when constructing `RawMmioRegion`; once built, reads/writes go through
// `core::ptr::{read,write}_volatile` the same way any MMIO access must.
unsafe impl Send for RawMmioRegion {}

impl RawMmioRegion {
    /// # Safety
    /// `base` must point at a live virtio-mmio register window of at least
    /// `mmio::offset::CONFIG` bytes, mapped uncached, for as long as the
    /// returned region is used.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }
}

impl ConfigRegion for RawMmioRegion {
    fn read8(&self, offset: usize) -> u8 {
        unsafe { core::ptr::read_volatile(self.base.add(offset)) }
    }
    fn read16(&self, offset: usize) -> u16 {
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u16) }
    }
    fn read32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u32) }
    }
    fn read64(&self, offset: usize) -> u64 {
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u64) }
    }
    fn write8(&mut self, offset: usize, value: u8) {
        unsafe { core::ptr::write_volatile(self.base.add(offset), value) }
    }
    fn write16(&mut self, offset: usize, value: u16) {
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u16, value) }
    }
    fn write32(&mut self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
    fn write64(&mut self, offset: usize, value: u64) {
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u64, value) }
    }
}

type HwTransport = MmioTransport<RawMmioRegion>;

const IRQ_LINES: usize = 16;
const FORWARD_BUF: usize = QUEUE_SIZE;

/// Bare-metal platform: three real virtio-mmio devices plus a 16550 serial
/// console, no software device model behind them. There is no real clock
/// wired up in this sketch, so `wait_for_interrupt` halts once and reports
/// back whatever `timeout_ms` it was given rather than measuring real
/// elapsed time.
pub struct HwPlatform {
    entropy: EntropyDriver<HwTransport>,
    block: BlockDriver<HwTransport>,
    net: NetDriver<HwTransport>,
    serial: SerialPort,
    clock_ms: u64,
    irq_handlers: [Option<(IrqHandler, *mut ())>; IRQ_LINES],
}

impl HwPlatform {
    /// # Safety
    /// `rng_base`/`blk_base`/`net_base` must each point at a live virtio-mmio
    /// window for the matching device type, mapped before this is called.
    /// `com_port` must be a real, unclaimed serial I/O port.
    pub unsafe fn new(
        rng_base: *mut u8,
        blk_base: *mut u8,
        net_base: *mut u8,
        com_port: u16,
    ) -> Result<Self, NegotiationError> {
        let rng_region = unsafe { RawMmioRegion::new(rng_base) };
        let blk_region = unsafe { RawMmioRegion::new(blk_base) };
        let net_region = unsafe { RawMmioRegion::new(net_base) };
        let mut serial = unsafe { SerialPort::new(com_port) };
        serial.init();
        Ok(Self {
            entropy: EntropyDriver::new(MmioTransport::new(rng_region))?,
            block: BlockDriver::new(MmioTransport::new(blk_region))?,
            net: NetDriver::new(MmioTransport::new(net_region))?,
            serial,
            clock_ms: 0,
            irq_handlers: [None; IRQ_LINES],
        })
    }

    /// Klog backend writing to the serial port this platform owns. Installed
    /// once via `klog_register_backend` before the first log line; the
    /// `SerialPort` itself is not behind a lock here since this sketch never
    /// logs from interrupt context.
    pub fn serial_write(&mut self, args: core::fmt::Arguments<'_>) {
        use core::fmt::Write;
        let _ = self.serial.write_fmt(args);
    }
}

impl TickHooks for HwPlatform {
    fn platform_tick(&mut self, kernel: &mut Kernel) {
        // A real device raises its own interrupt and fills its own used
        // ring; there is no software servicing step here the way
        // `SoftwarePlatform::forward` has one.
        self.entropy.poll_completions(kernel);
        self.block.poll_completions(kernel);
        self.net.poll_recv_completions(kernel);
        self.net.poll_send_completions(kernel);
    }

    fn forward(&mut self, kernel: &mut Kernel) {
        // See `SoftwarePlatform::forward`: `.take(FORWARD_BUF)` only pops
        // that many items off the lazily-draining queue this tick, so
        // anything past the cap stays queued for a later tick rather than
        // being popped and discarded.
        let mut submissions: [Option<NonNull<WorkItem>>; FORWARD_BUF] = [None; FORWARD_BUF];
        let mut n = 0;
        for item in kernel.drain_submissions().take(FORWARD_BUF) {
            submissions[n] = Some(item);
            n += 1;
        }
        for item in submissions[..n].iter().copied().flatten() {
            let op = unsafe { (*item.as_ptr()).op() };
            let result = match op {
                WorkOp::RngRead => self.entropy.dispatch(item),
                WorkOp::BlockRead | WorkOp::BlockWrite | WorkOp::BlockFlush => self.block.dispatch(item),
                WorkOp::NetRecv => self.net.dispatch_recv(item),
                WorkOp::NetSend => self.net.dispatch_send(item),
                WorkOp::Timer => unreachable!("timers never reach the submit queue"),
            };
            match result {
                WorkError::Ok => kernel.mark_live(item),
                err => kernel.reject_submission(item, err),
            }
        }

        let mut cancellations: [Option<NonNull<WorkItem>>; FORWARD_BUF] = [None; FORWARD_BUF];
        let mut c = 0;
        for item in kernel.drain_device_cancellations().take(FORWARD_BUF) {
            cancellations[c] = Some(item);
            c += 1;
        }
        for item in cancellations[..c].iter().copied().flatten() {
            self.net.cancel_recv(item);
            kernel.complete_cancellation(item);
        }
    }

    fn release_net_buffer(&mut self, item: NonNull<WorkItem>, buffer_index: usize) {
        self.net.release_buffer(item, buffer_index);
    }
}

impl Platform for HwPlatform {
    fn wait_for_interrupt(&mut self, timeout_ms: u64) -> u64 {
        hlt();
        self.clock_ms = self.clock_ms.saturating_add(timeout_ms);
        self.clock_ms
    }

    fn now_ms(&self) -> u64 {
        self.clock_ms
    }

    fn irq_register(&mut self, num: u8, handler: IrqHandler, ctx: *mut ()) {
        if let Some(slot) = self.irq_handlers.get_mut(num as usize) {
            *slot = Some((handler, ctx));
        }
    }

    fn irq_enable(&mut self, _num: u8) {
        // Unmasking a real PIC/APIC line is out of scope for this sketch
        // (spec §1); a full `hw` backend would do it here.
    }

    fn abort(&self) -> ! {
        x86_64::instructions::interrupts::disable();
        loop {
            hlt();
        }
    }
}
