//! The closed set of work operations the kernel understands.

/// Tag identifying which specialised request a work item's header is embedded in.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkOp {
    Timer = 0,
    RngRead = 1,
    BlockRead = 2,
    BlockWrite = 3,
    BlockFlush = 4,
    NetRecv = 5,
    NetSend = 6,
}

impl WorkOp {
    /// Ops for which `cancel` has a defined, non-`Invalid` effect.
    ///
    /// Mirrored by the `Cancellable` marker trait in `microq-core` — this const fn
    /// backs the type-erased `cancel(work)` entry point used by generic callers that
    /// only have a `&dyn` handle and can't go through the trait-bound path.
    pub const fn is_cancellable(self) -> bool {
        matches!(self, WorkOp::Timer | WorkOp::NetRecv)
    }
}
