//! Work item flag bits.

use bitflags::bitflags;

bitflags! {
    /// Behavioral flags attached to a work item at `init_work` time.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WorkFlags: u8 {
        /// On completion with `WorkError::Ok`, return to `Live` instead of `Dead`.
        const STANDING = 1 << 0;
    }
}

impl Default for WorkFlags {
    fn default() -> Self {
        WorkFlags::empty()
    }
}
