//! The split virtqueue: descriptor table, available ring, used ring (spec
//! §4.7), grounded on the teacher's `drivers/src/virtio/queue.rs`.
//!
//! The teacher's `Virtqueue` is backed by page frames at physical addresses,
//! because its kernel has paging and a real device DMAs into guest RAM at a
//! physical address the driver hands it. This kernel has no virtual memory
//! (spec Non-goal) and, for the software devices `SoftwarePlatform` models,
//! no real DMA either — so descriptor/avail/used storage here is a plain,
//! fixed-size, caller-owned array (no page-frame allocator needed), and the
//! "device" side (`push_used`) is just another method on the same struct
//! rather than a second participant reading physical memory. A `hw`-feature
//! backend wiring this to real descriptor-table memory would still go
//! through this same API; it would only change how `addr` fields are chosen.

use core::sync::atomic::{fence, Ordering};

/// Matches the teacher's `DEFAULT_QUEUE_SIZE`; virtqueues in this kernel are
/// fixed at this size rather than negotiated per-device.
pub const QUEUE_SIZE: usize = 64;

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

/// Errors a queue's descriptor allocator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Not enough free descriptors to satisfy the request.
    OutOfDescriptors,
}

/// A single split virtqueue of [`QUEUE_SIZE`] descriptors.
///
/// Free descriptors are tracked with an intrusive singly-linked list reusing
/// each unused descriptor's own `next` field — the same trick the teacher
/// uses for its descriptor bitmap-free alternative, adapted here to avoid a
/// separate bitmap array.
pub struct Virtqueue {
    desc: [VirtqDesc; QUEUE_SIZE],
    free_head: Option<u16>,
    free_count: u16,

    avail_idx: u16,
    avail_ring: [u16; QUEUE_SIZE],

    used_idx: u16,
    last_used_idx: u16,
    used_ring: [VirtqUsedElem; QUEUE_SIZE],

    last_avail_idx: u16,
}

impl Virtqueue {
    pub const fn new() -> Self {
        let mut q = Self {
            desc: [VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: 0,
            }; QUEUE_SIZE],
            free_head: None,
            free_count: 0,
            avail_idx: 0,
            avail_ring: [0; QUEUE_SIZE],
            used_idx: 0,
            last_used_idx: 0,
            used_ring: [VirtqUsedElem { id: 0, len: 0 }; QUEUE_SIZE],
            last_avail_idx: 0,
        };
        // Chain all descriptors onto the free list, 0 -> 1 -> .. -> N-1 -> end.
        let mut i = 0;
        while i < QUEUE_SIZE {
            q.desc[i].next = if i + 1 < QUEUE_SIZE { (i + 1) as u16 } else { 0 };
            i += 1;
        }
        q.free_head = Some(0);
        q.free_count = QUEUE_SIZE as u16;
        q
    }

    pub fn size(&self) -> u16 {
        QUEUE_SIZE as u16
    }

    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    /// Allocate a chain of `n` descriptors, returning the head index. The
    /// chain's `next`/`flags` links are left for the caller to fill in via
    /// [`Self::set_desc`]; this only reserves the slots.
    pub fn alloc_chain(&mut self, n: u16) -> Result<u16, QueueError> {
        if n == 0 || n > self.free_count {
            return Err(QueueError::OutOfDescriptors);
        }
        let head = self.free_head.ok_or(QueueError::OutOfDescriptors)?;
        let mut cur = head;
        for _ in 0..n {
            self.free_count -= 1;
            let next_free = self.desc[cur as usize].next;
            if self.free_count == 0 {
                self.free_head = None;
            } else {
                self.free_head = Some(next_free);
            }
            cur = next_free;
        }
        Ok(head)
    }

    /// Return a chain (as linked by `next`/`NEXT` flag starting at `head`)
    /// to the free list.
    pub fn free_chain(&mut self, head: u16) {
        let mut tail = head;
        let mut count = 1u16;
        while self.desc[tail as usize].flags & VIRTQ_DESC_F_NEXT != 0 {
            tail = self.desc[tail as usize].next;
            count += 1;
        }
        self.desc[tail as usize].next = self.free_head.unwrap_or(0);
        self.free_head = Some(head);
        self.free_count += count;
    }

    pub fn set_desc(&mut self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        self.desc[idx as usize] = VirtqDesc { addr, len, flags, next };
    }

    pub fn desc(&self, idx: u16) -> VirtqDesc {
        self.desc[idx as usize]
    }

    /// Driver side: publish a descriptor chain as available to the device.
    pub fn push_avail(&mut self, head: u16) {
        let slot = (self.avail_idx as usize) % QUEUE_SIZE;
        self.avail_ring[slot] = head;
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
    }

    /// Device side (software model): complete a chain with `len` bytes
    /// written, making it visible to the driver's next `pop_used`.
    pub fn push_used(&mut self, id: u16, len: u32) {
        let slot = (self.used_idx as usize) % QUEUE_SIZE;
        self.used_ring[slot] = VirtqUsedElem {
            id: id as u32,
            len,
        };
        fence(Ordering::Release);
        self.used_idx = self.used_idx.wrapping_add(1);
    }

    /// Driver side: pop the next completed chain, if any.
    pub fn pop_used(&mut self) -> Option<VirtqUsedElem> {
        if self.last_used_idx == self.used_idx {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = (self.last_used_idx as usize) % QUEUE_SIZE;
        let elem = self.used_ring[slot];
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some(elem)
    }

    pub fn has_used(&self) -> bool {
        self.last_used_idx != self.used_idx
    }

    /// Device side (software model): consume the next chain the driver has
    /// published via `push_avail` but that the device hasn't reacted to yet.
    /// Mirrors `pop_used`, tracked on its own cursor since the same queue
    /// is both ends of the ring for a software-modelled device (see module
    /// doc comment).
    pub fn pop_avail(&mut self) -> Option<u16> {
        if self.last_avail_idx == self.avail_idx {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = (self.last_avail_idx as usize) % QUEUE_SIZE;
        let head = self.avail_ring[slot];
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Some(head)
    }

    pub fn has_avail(&self) -> bool {
        self.last_avail_idx != self.avail_idx
    }
}

impl Default for Virtqueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_chain_exhausts_and_reports_out_of_descriptors() {
        let mut q = Virtqueue::new();
        assert_eq!(q.free_count(), QUEUE_SIZE as u16);
        let head = q.alloc_chain(QUEUE_SIZE as u16).unwrap();
        assert_eq!(q.free_count(), 0);
        assert_eq!(q.alloc_chain(1), Err(QueueError::OutOfDescriptors));
        q.free_chain(head);
        assert_eq!(q.free_count(), QUEUE_SIZE as u16);
    }

    #[test]
    fn three_descriptor_chain_links_and_frees_together() {
        let mut q = Virtqueue::new();
        let head = q.alloc_chain(3).unwrap();
        let d1 = head;
        let d2 = q.desc(d1).next;
        let d3 = q.desc(d2).next;
        q.set_desc(d1, 0x1000, 16, VIRTQ_DESC_F_NEXT, d2);
        q.set_desc(d2, 0x2000, 512, VIRTQ_DESC_F_NEXT, d3);
        q.set_desc(d3, 0x3000, 1, VIRTQ_DESC_F_WRITE, 0);
        let before_free = q.free_count();
        q.free_chain(head);
        assert_eq!(q.free_count(), before_free + 3);
    }

    #[test]
    fn push_avail_then_push_used_round_trips() {
        let mut q = Virtqueue::new();
        let head = q.alloc_chain(1).unwrap();
        q.set_desc(head, 0x4000, 64, 0, 0);
        q.push_avail(head);
        assert!(!q.has_used());
        q.push_used(head, 64);
        assert!(q.has_used());
        let elem = q.pop_used().unwrap();
        assert_eq!(elem.id, head as u32);
        assert_eq!(elem.len, 64);
        assert!(!q.has_used());
    }

    #[test]
    fn pop_avail_sees_published_chain_before_it_is_used() {
        let mut q = Virtqueue::new();
        let head = q.alloc_chain(1).unwrap();
        q.set_desc(head, 0x5000, 8, 0, 0);
        assert!(!q.has_avail());
        q.push_avail(head);
        assert!(q.has_avail());
        assert_eq!(q.pop_avail(), Some(head));
        assert!(!q.has_avail());
        assert_eq!(q.pop_avail(), None);
    }

    #[test]
    fn used_ring_wraps_past_queue_size() {
        let mut q = Virtqueue::new();
        for _ in 0..(QUEUE_SIZE + 5) {
            let head = q.alloc_chain(1).unwrap();
            q.push_avail(head);
            q.push_used(head, 1);
            let elem = q.pop_used().unwrap();
            assert_eq!(elem.id, head as u32);
            q.free_chain(head);
        }
    }
}
