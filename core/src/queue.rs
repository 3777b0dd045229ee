//! Intrusive queues built on the work header's own `next`/`prev` fields
//! (spec §4.1). No allocation: membership is the linkage itself.
//!
//! # Safety
//!
//! Every method here dereferences the `NonNull<WorkItem>` pointers passed in.
//! Callers must guarantee the pointee outlives its time on the queue and that
//! no other code mutates `header.next`/`header.prev` while it is linked.

use core::ptr::NonNull;

use crate::work::WorkItem;

#[inline]
unsafe fn next_of(item: NonNull<WorkItem>) -> Option<NonNull<WorkItem>> {
    unsafe { (*item.as_ptr()).header.next }
}

#[inline]
unsafe fn set_next(item: NonNull<WorkItem>, next: Option<NonNull<WorkItem>>) {
    unsafe { (*item.as_ptr()).header.next = next };
}

#[inline]
unsafe fn set_prev(item: NonNull<WorkItem>, prev: Option<NonNull<WorkItem>>) {
    unsafe { (*item.as_ptr()).header.prev = prev };
}

/// Doubly-linked FIFO, used for the submit queue: enqueue at the tail,
/// drained from the head in one sweep per tick.
pub struct SubmitQueue {
    head: Option<NonNull<WorkItem>>,
    tail: Option<NonNull<WorkItem>>,
}

impl SubmitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append `item` to the tail. `item` must not already be linked.
    pub fn push_back(&mut self, item: NonNull<WorkItem>) {
        unsafe {
            set_next(item, None);
            set_prev(item, self.tail);
        }
        match self.tail {
            Some(old_tail) => unsafe { set_next(old_tail, Some(item)) },
            None => self.head = Some(item),
        }
        self.tail = Some(item);
    }

    pub fn pop_front(&mut self) -> Option<NonNull<WorkItem>> {
        let item = self.head?;
        let next = unsafe { next_of(item) };
        self.head = next;
        match next {
            Some(n) => unsafe { set_prev(n, None) },
            None => self.tail = None,
        }
        unsafe {
            set_next(item, None);
            set_prev(item, None);
        }
        Some(item)
    }

    /// Remove `item` from wherever it sits in the list. Used by `cancel` on a
    /// `SubmitRequested` item that the platform has not yet drained.
    pub fn remove(&mut self, item: NonNull<WorkItem>) {
        let prev = unsafe { (*item.as_ptr()).header.prev };
        let next = unsafe { next_of(item) };
        match prev {
            Some(p) => unsafe { set_next(p, next) },
            None => self.head = next,
        }
        match next {
            Some(n) => unsafe { set_prev(n, prev) },
            None => self.tail = prev,
        }
        unsafe {
            set_next(item, None);
            set_prev(item, None);
        }
    }

    /// Drain every item, leaving the queue empty, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = NonNull<WorkItem>> + '_ {
        core::iter::from_fn(move || self.pop_front())
    }
}

impl Default for SubmitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Singly-linked LIFO, used for the cancel and ready queues: prepend at the
/// head, order within one drain is unspecified beyond "drains in one sweep".
pub struct LifoQueue {
    head: Option<NonNull<WorkItem>>,
}

impl LifoQueue {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push(&mut self, item: NonNull<WorkItem>) {
        unsafe { set_next(item, self.head) };
        self.head = Some(item);
    }

    pub fn pop(&mut self) -> Option<NonNull<WorkItem>> {
        let item = self.head?;
        self.head = unsafe { next_of(item) };
        unsafe { set_next(item, None) };
        Some(item)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = NonNull<WorkItem>> + '_ {
        core::iter::from_fn(move || self.pop())
    }
}

impl Default for LifoQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkItem, WorkKind, RngData};

    fn make(buf: u32) -> WorkItem {
        WorkItem::new(WorkKind::Rng(RngData::new(core::ptr::null_mut(), buf)))
    }

    #[test]
    fn fifo_order() {
        let mut a = make(1);
        let mut b = make(2);
        let mut c = make(3);
        let mut q = SubmitQueue::new();
        q.push_back(NonNull::from(&mut a));
        q.push_back(NonNull::from(&mut b));
        q.push_back(NonNull::from(&mut c));
        let order: Vec<u32> = q
            .drain()
            .map(|p| unsafe { (*p.as_ptr()).as_rng().unwrap().requested })
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn lifo_order() {
        let mut a = make(1);
        let mut b = make(2);
        let mut q = LifoQueue::new();
        q.push(NonNull::from(&mut a));
        q.push(NonNull::from(&mut b));
        let order: Vec<u32> = q
            .drain()
            .map(|p| unsafe { (*p.as_ptr()).as_rng().unwrap().requested })
            .collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn remove_from_middle() {
        let mut a = make(1);
        let mut b = make(2);
        let mut c = make(3);
        let mut q = SubmitQueue::new();
        let (pa, pb, pc) = (NonNull::from(&mut a), NonNull::from(&mut b), NonNull::from(&mut c));
        q.push_back(pa);
        q.push_back(pb);
        q.push_back(pc);
        q.remove(pb);
        let order: Vec<u32> = q
            .drain()
            .map(|p| unsafe { (*p.as_ptr()).as_rng().unwrap().requested })
            .collect();
        assert_eq!(order, vec![1, 3]);
    }
}
