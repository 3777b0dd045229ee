//! Network (virtio-net) driver (spec §4.10).
//!
//! Grounded on the teacher's `drivers/src/virtio_net.rs`
//! (`virtnet_prepost_rx_buffers` — post every RX descriptor chain with one
//! notify, exactly this driver's standing-receive first-submission path)
//! and `drivers/src/net/mod.rs`'s `ipv4_header_checksum`. The teacher's
//! driver runs a NAPI-style budgeted poll loop across many concurrent
//! flows; this one only ever has one standing NetRecv request (spec §4.10:
//! "only the 'standing' pattern is supported"), so the RX side is simpler —
//! re-arm is an explicit per-buffer call, not a budget loop.

use core::ptr::NonNull;

use microq_abi::virtio::NET_HEADER_LEN;
use microq_abi::WorkError;
use microq_core::kernel::Kernel;
use microq_core::work::WorkItem;
use microq_virtio::queue::{QUEUE_SIZE, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use microq_virtio::{negotiate, set_driver_ok, NegotiationError, VirtioTransport, Virtqueue};

const RX_QUEUE_INDEX: u16 = 0;
const TX_QUEUE_INDEX: u16 = 1;

/// The peer a software network device exchanges frames with. `SoftwarePlatform`
/// backs this with a loopback queue for the echo-scenario test; a `hw`
/// backend's device is a real NIC and never calls this trait.
pub trait NetPeer {
    /// Take the next inbound frame, if any, copying it (sans virtio-net
    /// header) into `buf`. Returns the frame length.
    fn try_recv(&mut self, buf: &mut [u8]) -> Option<usize>;
    /// Hand a fully-built frame (sans virtio-net header) to the peer.
    fn send(&mut self, frame: &[u8]);
}

struct RxSlot {
    item: NonNull<WorkItem>,
    buffer_index: usize,
}

struct TxPending {
    item: NonNull<WorkItem>,
}

pub struct NetDriver<T: VirtioTransport> {
    transport: T,
    rx_queue: Virtqueue,
    tx_queue: Virtqueue,
    rx_header_scratch: [[u8; NET_HEADER_LEN]; QUEUE_SIZE],
    tx_header_scratch: [[u8; NET_HEADER_LEN]; QUEUE_SIZE],
    rx_table: [Option<RxSlot>; QUEUE_SIZE],
    tx_table: [Option<TxPending>; QUEUE_SIZE],
    present: bool,
}

impl<T: VirtioTransport> NetDriver<T> {
    pub fn new(mut transport: T) -> Result<Self, NegotiationError> {
        negotiate(&mut transport, 0, 0)?;
        transport.select_queue(RX_QUEUE_INDEX);
        transport.set_queue_enabled(RX_QUEUE_INDEX, true);
        transport.select_queue(TX_QUEUE_INDEX);
        transport.set_queue_enabled(TX_QUEUE_INDEX, true);
        set_driver_ok(&mut transport);
        const NONE_RX: Option<RxSlot> = None;
        const NONE_TX: Option<TxPending> = None;
        Ok(Self {
            transport,
            rx_queue: Virtqueue::new(),
            tx_queue: Virtqueue::new(),
            rx_header_scratch: [[0u8; NET_HEADER_LEN]; QUEUE_SIZE],
            tx_header_scratch: [[0u8; NET_HEADER_LEN]; QUEUE_SIZE],
            rx_table: [NONE_RX; QUEUE_SIZE],
            tx_table: [NONE_TX; QUEUE_SIZE],
            present: true,
        })
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// First submission of a standing NetRecv: allocate one header+data
    /// chain per buffer, record the head in that slot, and post every chain
    /// with a single notify (spec §4.10).
    pub fn dispatch_recv(&mut self, item: NonNull<WorkItem>) -> WorkError {
        if !self.present {
            return WorkError::NoDevice;
        }
        let data = unsafe { (*item.as_ptr()).as_net_recv() }.expect("net driver given non-NetRecv item");
        let ring_size = data.ring_size;
        if self.rx_queue.free_count() < (2 * ring_size) as u16 {
            return WorkError::Busy;
        }
        for idx in 0..ring_size {
            let buf = data.buffers[idx];
            let head = self
                .rx_queue
                .alloc_chain(2)
                .expect("free_count checked above");
            let data_desc = self.rx_queue.desc(head).next;
            let header_ptr = self.rx_header_scratch[head as usize].as_mut_ptr() as u64;
            self.rx_queue
                .set_desc(head, header_ptr, NET_HEADER_LEN as u32, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, data_desc);
            self.rx_queue
                .set_desc(data_desc, buf.buffer as u64, buf.capacity, VIRTQ_DESC_F_WRITE, 0);
            data.buffers[idx].desc_head = Some(head);
            self.rx_table[head as usize] = Some(RxSlot {
                item,
                buffer_index: idx,
            });
            self.rx_queue.push_avail(head);
        }
        self.transport.notify(RX_QUEUE_INDEX);
        WorkError::Ok
    }

    /// Re-arm one buffer of a standing NetRecv ring using its saved
    /// descriptor head (spec §4.10, `release_net_buffer`).
    pub fn release_buffer(&mut self, item: NonNull<WorkItem>, buffer_index: usize) {
        let data = unsafe { (*item.as_ptr()).as_net_recv() }.expect("net item");
        if buffer_index >= data.ring_size {
            return;
        }
        if let Some(head) = data.buffers[buffer_index].desc_head {
            self.rx_queue.push_avail(head);
            self.transport.notify(RX_QUEUE_INDEX);
        }
    }

    /// Tear down every persistent RX descriptor chain for a cancelled
    /// standing NetRecv (spec §5, Cancellation semantics). The kernel has
    /// already moved `item` to `CancelRequested`; the caller completes the
    /// cancellation via `Kernel::complete_cancellation` once this returns.
    pub fn cancel_recv(&mut self, item: NonNull<WorkItem>) {
        let data = unsafe { (*item.as_ptr()).as_net_recv() }.expect("net item");
        for buf in data.buffers[..data.ring_size].iter_mut() {
            if let Some(head) = buf.desc_head.take() {
                self.rx_queue.free_chain(head);
                self.rx_table[head as usize] = None;
            }
        }
    }

    /// One descriptor chain per packet: header (device-read, zeroed) then
    /// data, chained `NEXT`. All of a NetSend's packets are posted with one
    /// notify (spec §4.10, §4.7 notify coalescing).
    pub fn dispatch_send(&mut self, item: NonNull<WorkItem>) -> WorkError {
        if !self.present {
            return WorkError::NoDevice;
        }
        let data = unsafe { (*item.as_ptr()).as_net_send() }.expect("net driver given non-NetSend item");
        let packet_count = data.packet_count;
        if self.tx_queue.free_count() < (2 * packet_count) as u16 {
            return WorkError::Busy;
        }
        for i in 0..packet_count {
            let pkt = data.packets[i];
            let head = self
                .tx_queue
                .alloc_chain(2)
                .expect("free_count checked above");
            let data_desc = self.tx_queue.desc(head).next;
            self.tx_header_scratch[head as usize] = [0u8; NET_HEADER_LEN];
            let header_ptr = self.tx_header_scratch[head as usize].as_ptr() as u64;
            self.tx_queue
                .set_desc(head, header_ptr, NET_HEADER_LEN as u32, VIRTQ_DESC_F_NEXT, data_desc);
            self.tx_queue
                .set_desc(data_desc, pkt.buffer as u64, pkt.length, 0, 0);
            self.tx_table[head as usize] = Some(TxPending { item });
            self.tx_queue.push_avail(head);
        }
        self.transport.notify(TX_QUEUE_INDEX);
        WorkError::Ok
    }

    /// Software device-side reaction for the RX ring: hand each posted
    /// chain's data-descriptor buffer to `peer.try_recv`, write the
    /// virtio-net header (left zeroed — no offloads modelled), and post a
    /// used entry sized to the received frame. Chains the peer has nothing
    /// for yet are left on the avail ring for the next call.
    pub fn service_recv(&mut self, peer: &mut dyn NetPeer) {
        // Only as many chains as there are frames waiting; re-check
        // `pop_avail` per frame so un-serviced chains stay posted.
        loop {
            let head = match self.rx_queue.pop_avail() {
                Some(h) => h,
                None => break,
            };
            let header_desc = self.rx_queue.desc(head);
            let data_desc_idx = header_desc.next;
            let data_desc = self.rx_queue.desc(data_desc_idx);
            let buf = unsafe { core::slice::from_raw_parts_mut(data_desc.addr as *mut u8, data_desc.len as usize) };
            match peer.try_recv(buf) {
                Some(len) => self.rx_queue.push_used(head, len as u32),
                None => {
                    // Nothing waiting: this chain was consumed from the
                    // device's avail cursor but nothing happened to it, so
                    // put it back for the next `service_recv` call.
                    self.rx_queue.push_avail(head);
                    break;
                }
            }
        }
    }

    /// Drain RX completions: identify the buffer via the head recorded at
    /// post time, write the packet length, and fire the callback. The
    /// descriptor chain is deliberately **not** freed — the buffer is now
    /// with the user until `release_buffer` re-arms it (spec §4.10).
    pub fn poll_recv_completions(&mut self, kernel: &mut Kernel) {
        while let Some(used) = self.rx_queue.pop_used() {
            let head = used.id as u16;
            if let Some(slot) = &self.rx_table[head as usize] {
                let item = slot.item;
                let buffer_index = slot.buffer_index;
                let data = unsafe { (*item.as_ptr()).as_net_recv() }.expect("net item");
                data.buffers[buffer_index].packet_length = used.len;
                data.last_filled = buffer_index;
                kernel.complete(item, WorkError::Ok);
            }
        }
    }

    /// Software device-side reaction for the TX ring: hand each posted
    /// chain's payload to `peer.send` and post a used entry.
    pub fn service_send(&mut self, peer: &mut dyn NetPeer) {
        while let Some(head) = self.tx_queue.pop_avail() {
            let header_desc = self.tx_queue.desc(head);
            let data_desc = self.tx_queue.desc(header_desc.next);
            let buf = unsafe { core::slice::from_raw_parts(data_desc.addr as *const u8, data_desc.len as usize) };
            peer.send(buf);
            self.tx_queue.push_used(head, data_desc.len);
        }
    }

    /// Drain TX completions, freeing both descriptors per spec §4.10 and
    /// firing the callback once every packet in the request has completed.
    pub fn poll_send_completions(&mut self, kernel: &mut Kernel) {
        while let Some(used) = self.tx_queue.pop_used() {
            let head = used.id as u16;
            if let Some(pending) = self.tx_table[head as usize].take() {
                self.tx_queue.free_chain(head);
                let data = unsafe { (*pending.item.as_ptr()).as_net_send() }.expect("net item");
                data.sent += 1;
                if data.sent >= data.packet_count {
                    data.desc_idx = None;
                    kernel.complete(pending.item, WorkError::Ok);
                }
            }
        }
    }
}

/// One's-complement sum over a 20-byte IPv4 header with the checksum field
/// (bytes 10..12) treated as zero, folded and inverted (spec §8, Testable
/// Property 4). Grounded on the teacher's `drivers/src/net/mod.rs`
/// `ipv4_header_checksum`.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < header.len() {
        let word = if i == 10 {
            0u16
        } else {
            u16::from_be_bytes([header[i], header[i + 1]])
        };
        sum += word as u32;
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_known_header_matches_reference() {
        // A minimal 20-byte IPv4 header (version/IHL, TTL=64, proto=UDP,
        // src/dst 10.0.0.1 -> 10.0.0.2) with a known-good checksum baked in
        // by a reference implementation; zeroing the checksum field and
        // recomputing must reproduce it.
        let mut header = [
            0x45, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x40, 0x11, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
        ];
        let checksum = ipv4_header_checksum(&header);
        header[10] = (checksum >> 8) as u8;
        header[11] = (checksum & 0xFF) as u8;
        // Recomputing over the header with the real checksum now filled in
        // (not zeroed) must fold to zero.
        let mut verify_sum: u32 = 0;
        let mut i = 0;
        while i < header.len() {
            verify_sum += u16::from_be_bytes([header[i], header[i + 1]]) as u32;
            i += 2;
        }
        while verify_sum >> 16 != 0 {
            verify_sum = (verify_sum & 0xFFFF) + (verify_sum >> 16);
        }
        assert_eq!(verify_sum as u16, 0xFFFF);
    }

    struct LoopbackPeer {
        inbox: Option<[u8; 64]>,
        inbox_len: usize,
        sent: Option<([u8; 64], usize)>,
    }

    impl NetPeer for LoopbackPeer {
        fn try_recv(&mut self, buf: &mut [u8]) -> Option<usize> {
            let frame = self.inbox.take()?;
            buf[..self.inbox_len].copy_from_slice(&frame[..self.inbox_len]);
            Some(self.inbox_len)
        }
        fn send(&mut self, frame: &[u8]) {
            let mut out = [0u8; 64];
            out[..frame.len()].copy_from_slice(frame);
            self.sent = Some((out, frame.len()));
        }
    }

    fn fake_mmio_net() -> NetDriver<microq_virtio::mmio::MmioTransport<microq_virtio::regs::MemoryRegion<0x200>>> {
        use microq_virtio::regs::ConfigRegion;
        let mut region: microq_virtio::regs::MemoryRegion<0x200> = microq_virtio::regs::MemoryRegion::new();
        region.write32(microq_virtio::mmio::offset::MAGIC_VALUE, microq_abi::virtio::MMIO_MAGIC);
        region.write32(microq_virtio::mmio::offset::VERSION, 2);
        region.write32(microq_virtio::mmio::offset::QUEUE_NUM_MAX, 64);
        let transport = microq_virtio::mmio::MmioTransport::new(region);
        NetDriver::new(transport).unwrap()
    }

    #[test]
    fn standing_recv_stays_live_and_buffer_is_not_freed_on_completion() {
        use microq_abi::WorkFlags;
        use microq_core::work::{NetRecvData, WorkKind};

        let mut driver = fake_mmio_net();
        let mut peer = LoopbackPeer {
            inbox: None,
            inbox_len: 0,
            sent: None,
        };

        let mut bufs = [[0u8; 128]; 2];
        let mut recv_data = NetRecvData::new(2);
        for (i, b) in bufs.iter_mut().enumerate() {
            recv_data.buffers[i].buffer = b.as_mut_ptr();
            recv_data.buffers[i].capacity = 128;
        }
        let mut item = WorkItem::new(WorkKind::NetRecv(recv_data));
        item.header.callback = Some(|_| {});
        item.header.flags = WorkFlags::STANDING;
        let mut kernel = Kernel::new();
        let ptr = NonNull::from(&mut item);
        assert_eq!(kernel.submit(ptr), WorkError::Ok);
        let drained: Option<NonNull<WorkItem>> = kernel.drain_submissions().next();
        assert_eq!(drained, Some(ptr));
        assert_eq!(driver.dispatch_recv(ptr), WorkError::Ok);
        kernel.mark_live(ptr);

        let mut frame = [0u8; 64];
        frame[0] = 0xAB;
        peer.inbox = Some(frame);
        peer.inbox_len = 40;
        driver.service_recv(&mut peer);
        driver.poll_recv_completions(&mut kernel);

        struct NoopHooks;
        impl microq_core::kernel::TickHooks for NoopHooks {
            fn platform_tick(&mut self, _kernel: &mut Kernel) {}
            fn forward(&mut self, _kernel: &mut Kernel) {}
            fn release_net_buffer(&mut self, _item: NonNull<WorkItem>, _buffer_index: usize) {}
        }
        kernel.tick(0, &mut NoopHooks);

        assert_eq!(item.header.state, microq_core::work::WorkState::Live);
        let filled = item.as_net_recv().unwrap().last_filled;
        assert_eq!(item.as_net_recv().unwrap().buffers[filled].packet_length, 40);
        assert_eq!(bufs[filled][0], 0xAB);
    }
}
