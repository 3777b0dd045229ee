//! In-process software model of all three VirtIO devices: this crate's
//! primary test harness (spec §10.4). No real MMIO, PCI, or interrupt
//! controller exists here — `SoftwarePlatform` drives the same driver code a
//! `hw` backend would, but services each device's avail ring synchronously
//! from `forward` instead of waiting on a real device's own logic, and signals
//! completions through the same [`microq_lib::irq_ring::IrqRing`] a real ISR
//! would use.
//!
//! Novel: the teacher has no software device model (its kernel only ever runs
//! against real VirtIO hardware under an emulator).

use core::ptr::NonNull;

use microq_abi::{WorkError, WorkOp};
use microq_core::kernel::{Kernel, TickHooks};
use microq_core::work::WorkItem;
use microq_drivers::config::{RNG_BOOTSTRAP_SPIN_BUDGET, SECTOR_SIZE};
use microq_drivers::{BlockDriver, BlockStore, EntropyDriver, EntropySource, NetDriver, NetPeer};
use microq_lib::irq_ring::IrqRing;
use microq_virtio::mmio::{self, MmioTransport};
use microq_virtio::queue::QUEUE_SIZE;
use microq_virtio::regs::{ConfigRegion, MemoryRegion};

use crate::{IrqHandler, Platform};

const REGION_SIZE: usize = 0x200;
type Region = MemoryRegion<REGION_SIZE>;
type Transport = MmioTransport<Region>;

fn fake_region(device_id: u32) -> Region {
    let mut region: Region = MemoryRegion::new();
    region.write32(mmio::offset::MAGIC_VALUE, microq_abi::virtio::MMIO_MAGIC);
    region.write32(mmio::offset::VERSION, 2);
    region.write32(mmio::offset::DEVICE_ID, device_id);
    region.write32(mmio::offset::QUEUE_NUM_MAX, QUEUE_SIZE as u32);
    region
}

/// A non-cryptographic xorshift64 byte source backing the software rng
/// device model. The real virtio-rng device is fed by the host kernel's own
/// CSPRNG; this stands in for that device in tests, not for the kernel-side
/// CSPRNG the entropy it produces eventually seeds. Grounded on the teacher's
/// `drivers/src/random.rs` `Lfsr64`.
pub struct HostEntropySource {
    state: u64,
}

impl HostEntropySource {
    pub const fn with_seed(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0xACE1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = if x == 0 { 0xfeed_c0de } else { x };
        self.state
    }
}

impl EntropySource for HostEntropySource {
    fn fill(&mut self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < buf.len() {
            let word = self.next_u64().to_le_bytes();
            let take = (buf.len() - filled).min(8);
            buf[filled..filled + take].copy_from_slice(&word[..take]);
            filled += take;
        }
        filled
    }
}

/// Fixed-size in-memory block store backing the software blk device model.
pub const DISK_SECTORS: u64 = 64;
const DISK_BYTES: usize = (DISK_SECTORS * SECTOR_SIZE) as usize;

pub struct InMemoryDisk {
    bytes: [u8; DISK_BYTES],
}

impl InMemoryDisk {
    pub const fn new() -> Self {
        Self {
            bytes: [0u8; DISK_BYTES],
        }
    }
}

impl Default for InMemoryDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for InMemoryDisk {
    fn capacity_sectors(&self) -> u64 {
        DISK_SECTORS
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), WorkError> {
        let off = (sector * SECTOR_SIZE) as usize;
        if off + buf.len() > self.bytes.len() {
            return Err(WorkError::Invalid);
        }
        buf.copy_from_slice(&self.bytes[off..off + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<(), WorkError> {
        let off = (sector * SECTOR_SIZE) as usize;
        if off + buf.len() > self.bytes.len() {
            return Err(WorkError::Invalid);
        }
        self.bytes[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WorkError> {
        Ok(())
    }
}

const MAX_FRAME_LEN: usize = 256;
const NET_RING: usize = 4;

#[derive(Clone, Copy)]
struct Frame {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

/// Loopback peer for the software net device model: frames queued via
/// [`LoopbackNet::inject`] are handed to the driver's RX side on the next
/// `service_recv`, and frames the driver sends are captured for inspection
/// via [`LoopbackNet::take_sent`] (spec §8, Testable Property 4's echo
/// scenario — the reply itself is built by the caller's callback, not here).
pub struct LoopbackNet {
    inbound: [Option<Frame>; NET_RING],
    inbound_head: usize,
    inbound_tail: usize,
    outbound: [Option<Frame>; NET_RING],
    outbound_head: usize,
    outbound_tail: usize,
}

impl LoopbackNet {
    pub const fn new() -> Self {
        const NONE: Option<Frame> = None;
        Self {
            inbound: [NONE; NET_RING],
            inbound_head: 0,
            inbound_tail: 0,
            outbound: [NONE; NET_RING],
            outbound_head: 0,
            outbound_tail: 0,
        }
    }

    /// Queue a frame for the driver's standing RX buffer to pick up.
    pub fn inject(&mut self, frame: &[u8]) {
        let mut bytes = [0u8; MAX_FRAME_LEN];
        let len = frame.len().min(MAX_FRAME_LEN);
        bytes[..len].copy_from_slice(&frame[..len]);
        self.inbound[self.inbound_tail % NET_RING] = Some(Frame { bytes, len });
        self.inbound_tail += 1;
    }

    /// Take the oldest frame the driver has sent, oldest first.
    pub fn take_sent(&mut self) -> Option<([u8; MAX_FRAME_LEN], usize)> {
        if self.outbound_head == self.outbound_tail {
            return None;
        }
        let frame = self.outbound[self.outbound_head % NET_RING].take()?;
        self.outbound_head += 1;
        Some((frame.bytes, frame.len))
    }
}

impl Default for LoopbackNet {
    fn default() -> Self {
        Self::new()
    }
}

impl NetPeer for LoopbackNet {
    fn try_recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.inbound_head == self.inbound_tail {
            return None;
        }
        let frame = self.inbound[self.inbound_head % NET_RING].take()?;
        self.inbound_head += 1;
        let len = frame.len.min(buf.len());
        buf[..len].copy_from_slice(&frame.bytes[..len]);
        Some(len)
    }

    fn send(&mut self, frame: &[u8]) {
        let mut bytes = [0u8; MAX_FRAME_LEN];
        let len = frame.len().min(MAX_FRAME_LEN);
        bytes[..len].copy_from_slice(&frame[..len]);
        self.outbound[self.outbound_tail % NET_RING] = Some(Frame { bytes, len });
        self.outbound_tail += 1;
    }
}

const IRQ_LINES: usize = 16;
/// One tick's submissions/cancellations are collected into a fixed buffer
/// before being forwarded, bounded by the size of the smallest descriptor
/// table a driver could dispatch them into — past this, the driver's own
/// `Busy` backpressure would have kicked in first anyway.
const FORWARD_BUF: usize = QUEUE_SIZE;

/// A single opaque token pushed into the IRQ ring to mean "something
/// completed, go check"; this model never bothers to distinguish which
/// device raised it, since `platform_tick` polls all three unconditionally.
static IRQ_TOKEN: u8 = 0;

/// The primary test harness: all three VirtIO devices backed by an in-memory
/// register window (spec §10.4). Construct one, `kernel.submit` work items
/// against it, and drive `Kernel::tick`/[`crate::run_event_loop`] as usual.
pub struct SoftwarePlatform {
    entropy: EntropyDriver<Transport>,
    block: BlockDriver<Transport>,
    net: NetDriver<Transport>,
    disk: InMemoryDisk,
    entropy_source: HostEntropySource,
    net_peer: LoopbackNet,
    clock_ms: u64,
    irq_ring: IrqRing<256>,
    irq_handlers: [Option<(IrqHandler, *mut ())>; IRQ_LINES],
}

impl SoftwarePlatform {
    pub fn new() -> Self {
        let entropy_transport = MmioTransport::new(fake_region(microq_abi::virtio::device_id::ENTROPY));
        let block_transport = MmioTransport::new(fake_region(microq_abi::virtio::device_id::BLOCK));
        let net_transport = MmioTransport::new(fake_region(microq_abi::virtio::device_id::NET));
        Self {
            entropy: EntropyDriver::new(entropy_transport)
                .expect("software rng transport is built to negotiate successfully"),
            block: BlockDriver::new(block_transport)
                .expect("software blk transport is built to negotiate successfully"),
            net: NetDriver::new(net_transport)
                .expect("software net transport is built to negotiate successfully"),
            disk: InMemoryDisk::new(),
            entropy_source: HostEntropySource::with_seed(0xACE1),
            net_peer: LoopbackNet::new(),
            clock_ms: 0,
            irq_ring: IrqRing::new(),
            irq_handlers: [None; IRQ_LINES],
        }
    }

    pub fn disk_mut(&mut self) -> &mut InMemoryDisk {
        &mut self.disk
    }

    pub fn net_peer_mut(&mut self) -> &mut LoopbackNet {
        &mut self.net_peer
    }

    pub fn entropy_source_mut(&mut self) -> &mut HostEntropySource {
        &mut self.entropy_source
    }

    /// Synchronous CSPRNG-bootstrap escape hatch (spec §4.8, §9): post and
    /// service one request directly against the entropy queue, bypassing
    /// `Kernel` entirely. Only safe to call before the event loop starts.
    pub fn bootstrap_entropy(&mut self, buf: &mut [u8]) -> Result<usize, WorkError> {
        self.entropy
            .poll_once(buf, &mut self.entropy_source, RNG_BOOTSTRAP_SPIN_BUDGET)
    }
}

impl Default for SoftwarePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl TickHooks for SoftwarePlatform {
    fn platform_tick(&mut self, kernel: &mut Kernel) {
        for _ in self.irq_ring.drain_snapshot() {
            self.entropy.poll_completions(kernel);
            self.block.poll_completions(kernel);
            self.net.poll_recv_completions(kernel);
            self.net.poll_send_completions(kernel);
        }
    }

    fn forward(&mut self, kernel: &mut Kernel) {
        // `drain_submissions`/`drain_device_cancellations` pop lazily (one
        // item per `next()` call), so capping with `.take(FORWARD_BUF)` only
        // pulls that many off the queue this tick — anything past the cap
        // stays queued (still `SubmitRequested`/`CancelRequested`) and is
        // forwarded on a later tick instead of being popped and discarded.
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
            // Only NetRecv ever reaches the device cancel queue (spec §5).
            self.net.cancel_recv(item);
            kernel.complete_cancellation(item);
        }

        // React as a real device's own logic would, synchronously since
        // there is no real DMA or interrupt controller underneath, then
        // signal "an interrupt occurred" the same way a real ISR would.
        self.entropy.service(&mut self.entropy_source);
        self.block.service(&mut self.disk);
        self.net.service_recv(&mut self.net_peer);
        self.net.service_send(&mut self.net_peer);
        self.irq_ring.push(core::ptr::addr_of!(IRQ_TOKEN) as *mut ());
    }

    fn release_net_buffer(&mut self, item: NonNull<WorkItem>, buffer_index: usize) {
        self.net.release_buffer(item, buffer_index);
    }
}

impl Platform for SoftwarePlatform {
    fn wait_for_interrupt(&mut self, timeout_ms: u64) -> u64 {
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
        // No real interrupt controller to unmask in the software model;
        // handlers registered via `irq_register` are never actually invoked
        // here (SoftwarePlatform delivers completions through `IrqRing`
        // directly, not through registered line handlers).
    }

    fn abort(&self) -> ! {
        microq_lib::klog_error!("software platform abort");
        panic!("software platform abort");
    }
}
