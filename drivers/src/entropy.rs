//! Entropy (virtio-rng) driver (spec §4.8).
//!
//! Mechanics grounded on the teacher's `drivers/src/random.rs` only in the
//! sense that both exist to feed a CSPRNG bootstrap — the teacher's LFSR is
//! synchronous and polling throughout; this driver is interrupt-driven for
//! ordinary `submit`, with a narrow `poll_once` escape hatch for the one
//! caller (kernel bootstrap) that must get a seed before the event loop and
//! its callback machinery are safe to run (§9 Open Questions).

use core::ptr::NonNull;

use microq_abi::WorkError;
use microq_core::kernel::Kernel;
use microq_core::work::WorkItem;
use microq_virtio::queue::{QUEUE_SIZE, VIRTQ_DESC_F_WRITE};
use microq_virtio::{negotiate, set_driver_ok, NegotiationError, VirtioTransport, Virtqueue};

/// Where an entropy driver gets its bytes from once a request reaches the
/// device side. `SoftwarePlatform` implements this with a host PRNG; a `hw`
/// backend's device is the real virtio-rng device and never calls this trait
/// directly (the `hw` transport's device lives outside this process).
pub trait EntropySource {
    /// Fill as much of `buf` as the source can supply right now, returning
    /// the number of bytes written (may be less than `buf.len()`).
    fn fill(&mut self, buf: &mut [u8]) -> usize;
}

const QUEUE_INDEX: u16 = 0;

/// A virtio-rng request still in flight, indexed by its descriptor head.
struct Pending {
    item: NonNull<WorkItem>,
}

pub struct EntropyDriver<T: VirtioTransport> {
    transport: T,
    queue: Virtqueue,
    pending: [Option<Pending>; QUEUE_SIZE],
    present: bool,
}

impl<T: VirtioTransport> EntropyDriver<T> {
    /// Negotiate and bring the device online. No feature bits are required
    /// for virtio-rng beyond `VIRTIO_F_VERSION_1`, which `negotiate` always
    /// requires.
    pub fn new(mut transport: T) -> Result<Self, NegotiationError> {
        negotiate(&mut transport, 0, 0)?;
        transport.select_queue(QUEUE_INDEX);
        transport.set_queue_enabled(QUEUE_INDEX, true);
        set_driver_ok(&mut transport);
        const NONE: Option<Pending> = None;
        Ok(Self {
            transport,
            queue: Virtqueue::new(),
            pending: [NONE; QUEUE_SIZE],
            present: true,
        })
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Build and post a one-descriptor device-writable chain for this
    /// request's buffer (spec §4.8: "each request occupies one
    /// device-writable descriptor"). Called from `TickHooks::forward` for
    /// every submission the kernel yields for this device.
    pub fn dispatch(&mut self, item: NonNull<WorkItem>) -> WorkError {
        if !self.present {
            return WorkError::NoDevice;
        }
        let data = unsafe { (*item.as_ptr()).as_rng() }.expect("RNG driver given non-RNG item");
        let head = match self.queue.alloc_chain(1) {
            Ok(h) => h,
            Err(_) => return WorkError::Busy,
        };
        self.queue
            .set_desc(head, data.buffer as u64, data.requested, VIRTQ_DESC_F_WRITE, 0);
        data.desc_idx = Some(head);
        self.pending[head as usize] = Some(Pending { item });
        self.queue.push_avail(head);
        self.transport.notify(QUEUE_INDEX);
        WorkError::Ok
    }

    /// Software device-side reaction: service every chain posted since the
    /// last call, filling its buffer from `source` and posting a used entry.
    /// A `hw` backend never calls this — the real device services its own
    /// avail ring and raises a genuine interrupt instead.
    pub fn service(&mut self, source: &mut dyn EntropySource) {
        while let Some(head) = self.queue.pop_avail() {
            let desc = self.queue.desc(head);
            let buf = unsafe { core::slice::from_raw_parts_mut(desc.addr as *mut u8, desc.len as usize) };
            let filled = source.fill(buf);
            self.queue.push_used(head, filled as u32);
        }
    }

    /// Drain the used ring, completing each finished work item. Called from
    /// `TickHooks::platform_tick`.
    pub fn poll_completions(&mut self, kernel: &mut Kernel) {
        while let Some(used) = self.queue.pop_used() {
            let head = used.id as u16;
            if let Some(pending) = self.pending[head as usize].take() {
                let data = unsafe { (*pending.item.as_ptr()).as_rng() }.expect("RNG item");
                data.completed = used.len;
                data.desc_idx = None;
                self.queue.free_chain(head);
                kernel.complete(pending.item, WorkError::Ok);
            }
        }
    }

    /// Synchronous fallback used only by CSPRNG bootstrap (spec §4.8, §9):
    /// post one request for `buf` and spin servicing+draining the same
    /// queue directly, without going through `Kernel` at all, until either
    /// bytes arrive or `timeout_spins` is exhausted.
    ///
    /// Never called from `submit`/`dispatch` — this bypasses callbacks
    /// entirely and is only safe because nothing else touches this queue
    /// while bootstrap is running.
    pub fn poll_once(
        &mut self,
        buf: &mut [u8],
        source: &mut dyn EntropySource,
        timeout_spins: u32,
    ) -> Result<usize, WorkError> {
        if !self.present {
            return Err(WorkError::NoDevice);
        }
        let head = self
            .queue
            .alloc_chain(1)
            .map_err(|_| WorkError::Busy)?;
        self.queue
            .set_desc(head, buf.as_mut_ptr() as u64, buf.len() as u32, VIRTQ_DESC_F_WRITE, 0);
        self.queue.push_avail(head);
        self.transport.notify(QUEUE_INDEX);

        for _ in 0..timeout_spins {
            self.service(source);
            if let Some(used) = self.queue.pop_used() {
                self.queue.free_chain(used.id as u16);
                return Ok(used.len as usize);
            }
        }
        self.queue.free_chain(head);
        Err(WorkError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microq_core::work::{RngData, WorkKind};
    use microq_virtio::regs::MemoryRegion;

    struct CountingSource {
        next: u8,
    }

    impl EntropySource for CountingSource {
        fn fill(&mut self, buf: &mut [u8]) -> usize {
            for b in buf.iter_mut() {
                *b = self.next;
                self.next = self.next.wrapping_add(1);
            }
            buf.len()
        }
    }

    fn fake_mmio_rng() -> EntropyDriver<microq_virtio::mmio::MmioTransport<MemoryRegion<0x200>>> {
        let mut region: MemoryRegion<0x200> = MemoryRegion::new();
        region.write32(microq_virtio::mmio::offset::MAGIC_VALUE, microq_abi::virtio::MMIO_MAGIC);
        region.write32(microq_virtio::mmio::offset::VERSION, 2);
        region.write32(microq_virtio::mmio::offset::DEVICE_FEATURES, 0);
        region.write32(microq_virtio::mmio::offset::QUEUE_NUM_MAX, 64);
        let transport = microq_virtio::mmio::MmioTransport::new(region);
        EntropyDriver::new(transport).unwrap()
    }

    #[test]
    fn dispatch_then_service_then_poll_completes_request() {
        static COMPLETED: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);
        fn cb(item: &mut WorkItem) {
            let completed = item.as_rng().unwrap().completed;
            COMPLETED.store(completed, core::sync::atomic::Ordering::Relaxed);
        }

        let mut driver = fake_mmio_rng();
        let mut source = CountingSource { next: 1 };

        let mut buf = [0u8; 8];
        let mut item = WorkItem::new(WorkKind::Rng(RngData::new(buf.as_mut_ptr(), 8)));
        item.header.callback = Some(cb);
        let ptr = NonNull::from(&mut item);

        let mut kernel = Kernel::new();
        assert_eq!(kernel.submit(ptr), WorkError::Ok);
        let drained: Option<NonNull<WorkItem>> = kernel.drain_submissions().next();
        assert_eq!(drained, Some(ptr));
        assert_eq!(driver.dispatch(ptr), WorkError::Ok);
        kernel.mark_live(ptr);
        driver.service(&mut source);
        driver.poll_completions(&mut kernel);

        struct NoopHooks;
        impl microq_core::kernel::TickHooks for NoopHooks {
            fn platform_tick(&mut self, _kernel: &mut Kernel) {}
            fn forward(&mut self, _kernel: &mut Kernel) {}
            fn release_net_buffer(&mut self, _item: NonNull<WorkItem>, _buffer_index: usize) {}
        }
        kernel.tick(0, &mut NoopHooks);
        assert_eq!(COMPLETED.load(core::sync::atomic::Ordering::Relaxed), 8);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn poll_once_returns_bytes_within_budget() {
        let mut driver = fake_mmio_rng();
        let mut source = CountingSource { next: 0 };
        let mut buf = [0u8; 16];
        let n = driver.poll_once(&mut buf, &mut source, 4).unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 1);
    }
}
