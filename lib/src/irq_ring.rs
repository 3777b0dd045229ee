//! Lock-free SPSC ring used to hand completions from interrupt context to the
//! foreground tick (spec §4.6).
//!
//! The producer is an ISR: it may only push an opaque pointer and return. The
//! consumer is `platform_tick`, running with interrupts enabled, draining the
//! ring cooperatively. `snapshot`/`dequeue_bounded` exist so a device that
//! re-enqueues itself while being processed (still has work outstanding)
//! cannot cause the drain loop to spin forever within one tick — only entries
//! present at snapshot time are consumed.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Default ring capacity (spec §4.6: 256).
pub const DEFAULT_CAPACITY: usize = 256;

/// A fixed-capacity SPSC ring of opaque device pointers.
///
/// `N` must be a power of two; indices are masked rather than modulo'd.
pub struct IrqRing<const N: usize> {
    slots: UnsafeCell<[*mut (); N]>,
    head: AtomicUsize, // next slot the consumer will read
    tail: AtomicUsize, // next slot the producer will write
    dropped: AtomicUsize,
}

// SAFETY: access to `slots` is disciplined by the single-producer/single-consumer
// contract: only `push` (the producer) writes a slot before publishing `tail`,
// and only `pop`/`dequeue_bounded` (the consumer) read a slot after observing
// that `tail`. The two never touch the same slot concurrently.
unsafe impl<const N: usize> Sync for IrqRing<N> {}

impl<const N: usize> IrqRing<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "IrqRing capacity must be a power of two");
        N - 1
    };

    pub const fn new() -> Self {
        Self {
            slots: UnsafeCell::new([core::ptr::null_mut(); N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Producer side: enqueue a pointer. Returns `false` (and bumps the
    /// dropped-interrupt counter) if the ring is full.
    ///
    /// Safe to call from interrupt context; never blocks.
    pub fn push(&self, ptr: *mut ()) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= N {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // SAFETY: this slot is not yet visible to the consumer (tail has not
        // been published), and no other producer exists.
        unsafe {
            (*self.slots.get())[tail & Self::MASK] = ptr;
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side: capture the current producer position. Entries pushed
    /// after this call are not drained by a matching `dequeue_bounded`.
    pub fn snapshot(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    /// Consumer side: dequeue one entry, but only if it was present at
    /// `snapshot_end` (as returned by `snapshot`). Returns `None` once the
    /// bound is reached, even if the producer has since pushed more.
    pub fn dequeue_bounded(&self, snapshot_end: usize) -> Option<*mut ()> {
        let head = self.head.load(Ordering::Relaxed);
        if head == snapshot_end {
            return None;
        }
        // SAFETY: `head` is strictly behind a published `tail`, so this slot
        // was written by a completed `push` and is not being written now.
        let ptr = unsafe { (*self.slots.get())[head & Self::MASK] };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(ptr)
    }

    /// Drain everything currently pending, ignoring entries pushed mid-drain.
    pub fn drain_snapshot(&self) -> DrainSnapshot<'_, N> {
        DrainSnapshot {
            ring: self,
            end: self.snapshot(),
        }
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}

impl<const N: usize> Default for IrqRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over one tick's worth of entries, bounded at construction time.
pub struct DrainSnapshot<'a, const N: usize> {
    ring: &'a IrqRing<N>,
    end: usize,
}

impl<'a, const N: usize> Iterator for DrainSnapshot<'a, N> {
    type Item = *mut ();

    fn next(&mut self) -> Option<*mut ()> {
        self.ring.dequeue_bounded(self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order() {
        let ring: IrqRing<8> = IrqRing::new();
        for i in 0..4 {
            assert!(ring.push(i as *mut ()));
        }
        let drained: Vec<_> = ring.drain_snapshot().collect();
        assert_eq!(drained, vec![0 as *mut (), 1 as *mut (), 2 as *mut (), 3 as *mut ()]);
        assert!(ring.is_empty());
    }

    #[test]
    fn full_ring_drops_and_counts() {
        let ring: IrqRing<4> = IrqRing::new();
        for i in 0..4 {
            assert!(ring.push(i as *mut ()));
        }
        assert!(!ring.push(99 as *mut ()));
        assert_eq!(ring.dropped_count(), 1);
    }

    #[test]
    fn mid_drain_pushes_are_not_observed_until_next_snapshot() {
        let ring: IrqRing<8> = IrqRing::new();
        ring.push(1 as *mut ());
        ring.push(2 as *mut ());
        let end = ring.snapshot();
        ring.push(3 as *mut ()); // arrives "during" this tick's processing
        let mut drained = vec![];
        while let Some(p) = ring.dequeue_bounded(end) {
            drained.push(p);
        }
        assert_eq!(drained, vec![1 as *mut (), 2 as *mut ()]);
        // the third entry is still there for the next tick's snapshot
        let next_end = ring.snapshot();
        assert_eq!(ring.dequeue_bounded(next_end), Some(3 as *mut ()));
    }
}
