//! Compile-time cancellation capability (spec §9, Cancellation asymmetry).
//!
//! `Kernel::cancel` is the dynamic, type-erased entry point used by platform
//! glue and by any caller holding only a raw work pointer; it returns
//! `WorkError::Invalid` for ops that don't support cancellation, matching the
//! original contract. For callers that know the op at the call site, a
//! `WorkHandle<Op>` makes that asymmetry a compile-time property instead: its
//! `.cancel()` method only exists when `Op: Cancellable`.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::kernel::Kernel;
use crate::work::WorkItem;
use microq_abi::WorkError;

/// Marker types identifying a work item's op at the type level.
pub struct TimerOp;
pub struct RngOp;
pub struct BlockOp;
pub struct NetRecvOp;
pub struct NetSendOp;

/// Implemented only by the ops for which cancellation has a defined effect.
pub trait Cancellable {}
impl Cancellable for TimerOp {}
impl Cancellable for NetRecvOp {}

/// A typed, non-owning handle to a submitted work item.
///
/// Constructed by the typed `submit_*` helpers on `Kernel`; `Op` tags which
/// op the underlying item actually is, so `.cancel()` is only reachable for
/// `Timer`/`NetRecv` handles — calling it on a `WorkHandle<RngOp>` is a
/// compile error, not a silent no-op.
pub struct WorkHandle<Op> {
    ptr: NonNull<WorkItem>,
    _marker: PhantomData<Op>,
}

impl<Op> WorkHandle<Op> {
    pub(crate) fn new(ptr: NonNull<WorkItem>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> NonNull<WorkItem> {
        self.ptr
    }
}

impl<Op: Cancellable> WorkHandle<Op> {
    /// Request cancellation of the underlying work item.
    pub fn cancel(&self, kernel: &mut Kernel) -> WorkError {
        kernel.cancel(self.ptr)
    }
}

#[cfg(test)]
mod tests {
    // Compile-time-only check: a `WorkHandle<RngOp>` has no `.cancel()`.
    // (There is nothing to assert at runtime; this module exists so the
    // absence of the method is exercised by the build itself. See
    // `kernel.rs`'s `typed_timer_handle_cancels_through_its_own_method` and
    // `submit_rng_rejects_a_non_rng_item_result` for the runtime contract of
    // the `submit_*` helpers that construct these handles.)
}
