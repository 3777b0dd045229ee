//! One-time initialization container.
//!
//! Used for the handful of process-wide singletons the kernel needs (the
//! installed klog backend aside, which uses its own atomic pointer): the
//! CSPRNG context and each device's transport state. Under the single-CPU,
//! cooperative-foreground model there is no real contention on `call_once`,
//! but the state machine is kept so a call from within an ISR (which can
//! still race a foreground initializer on the same core) behaves correctly.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATE_UNINIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_COMPLETE: u8 = 2;

/// A container for one-time initialization, safe to share as a `static`.
pub struct OnceLock<T> {
    state: AtomicU8,
    data: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send + Sync> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> OnceLock<T> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Run `f` once. The first caller wins; later callers are no-ops.
    #[inline]
    pub fn call_once(&self, f: impl FnOnce() -> T) {
        if self.state.load(Ordering::Acquire) == STATE_COMPLETE {
            return;
        }

        if self
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_RUNNING,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let value = f();
            // SAFETY: STATE_RUNNING guarantees we are the sole writer.
            unsafe { (*self.data.get()).write(value) };
            self.state.store(STATE_COMPLETE, Ordering::Release);
        } else {
            while self.state.load(Ordering::Acquire) != STATE_COMPLETE {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == STATE_COMPLETE {
            // SAFETY: COMPLETE means the value was written with Release
            // ordering and our Acquire load synchronizes with it.
            Some(unsafe { (*self.data.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPLETE
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn runs_initializer_once() {
        let calls = Cell::new(0);
        let lock: OnceLock<u32> = OnceLock::new();
        lock.call_once(|| {
            calls.set(calls.get() + 1);
            42
        });
        lock.call_once(|| {
            calls.set(calls.get() + 1);
            99
        });
        assert_eq!(calls.get(), 1);
        assert_eq!(*lock.get().unwrap(), 42);
    }

    #[test]
    fn get_is_none_before_init() {
        let lock: OnceLock<u32> = OnceLock::new();
        assert!(lock.get().is_none());
        assert!(!lock.is_completed());
    }
}
