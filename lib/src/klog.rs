//! Kernel logging subsystem.
//!
//! All kernel, driver and platform log output funnels through a single
//! **backend** function pointer. With no backend installed, log lines are
//! simply dropped — a platform installs a real backend (serial port, host
//! stdio under `SoftwarePlatform`) during its own initialisation.
//!
//! # Backend contract
//!
//! The backend receives the pre-formatted arguments for a single log line and
//! writes it, appending a trailing newline. A single-CPU cooperative kernel
//! has no need for interleaving protection beyond "don't log from an ISR
//! touching a backend that isn't reentrant-safe" — backends that do log from
//! interrupt context must guarantee that themselves.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl KlogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => KlogLevel::Error,
            1 => KlogLevel::Warn,
            2 => KlogLevel::Info,
            3 => KlogLevel::Debug,
            _ => KlogLevel::Trace,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

#[inline(always)]
fn is_enabled(level: KlogLevel) -> bool {
    (level as u8) <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Signature of a klog backend: write the formatted text plus a trailing newline.
pub type KlogBackend = fn(fmt::Arguments<'_>);

/// Stored as a raw pointer; null means "no backend installed, drop the line".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

#[inline]
fn dispatch(args: fmt::Arguments<'_>) {
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `klog_register_backend` only ever stores a valid `KlogBackend`
    // fn pointer, which is pointer-sized on every target we build for.
    let backend: KlogBackend = unsafe { core::mem::transmute(ptr) };
    backend(args);
}

/// Install (or replace) the active backend.
pub fn klog_register_backend(backend: KlogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

pub fn klog_set_level(level: KlogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn klog_get_level() -> KlogLevel {
    KlogLevel::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

pub fn is_enabled_level(level: KlogLevel) -> bool {
    is_enabled(level)
}

/// Emit a formatted log line at `level`, if that level is currently enabled.
pub fn log_args(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    dispatch(args);
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::klog::log_args($level, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Debug, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::klog::log_args($crate::klog::KlogLevel::Trace, ::core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering as O};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn counting_backend(_args: fmt::Arguments<'_>) {
        HITS.fetch_add(1, O::Relaxed);
    }

    #[test]
    fn disabled_level_does_not_dispatch() {
        klog_register_backend(counting_backend);
        klog_set_level(KlogLevel::Warn);
        let before = HITS.load(O::Relaxed);
        klog_trace!("should not print {}", 1);
        assert_eq!(HITS.load(O::Relaxed), before);
        klog_error!("should print {}", 1);
        assert_eq!(HITS.load(O::Relaxed), before + 1);
        klog_set_level(KlogLevel::Info);
    }
}
