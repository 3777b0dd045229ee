//! The closed error taxonomy delivered through a work item's `result` field.

use core::fmt;

/// Outcome of a work item, written once by the kernel or a driver before the
/// item transitions to `Ready`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkError {
    Ok = 0,
    Busy = 1,
    Invalid = 2,
    Cancelled = 3,
    Timeout = 4,
    NoDevice = 5,
    IoError = 6,
    NoSpace = 7,
}

impl WorkError {
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, WorkError::Ok)
    }

    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => WorkError::Ok,
            1 => WorkError::Busy,
            2 => WorkError::Invalid,
            3 => WorkError::Cancelled,
            4 => WorkError::Timeout,
            5 => WorkError::NoDevice,
            6 => WorkError::IoError,
            _ => WorkError::NoSpace,
        }
    }
}

impl Default for WorkError {
    fn default() -> Self {
        WorkError::Ok
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkError::Ok => "ok",
            WorkError::Busy => "busy",
            WorkError::Invalid => "invalid",
            WorkError::Cancelled => "cancelled",
            WorkError::Timeout => "timeout",
            WorkError::NoDevice => "no device",
            WorkError::IoError => "i/o error",
            WorkError::NoSpace => "no space",
        };
        f.write_str(s)
    }
}
