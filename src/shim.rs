//! Shim module to abstract over core and loom primitives.
//!
//! Everything the hand-off protocols touch (the version lock, the continuation
//! cell, the cursor's ownership flag) goes through here so the `loom` feature
//! can model-check them. Modules that are not modelled use `std` directly.

#[cfg(not(feature = "loom"))]
pub mod atomic {
    pub use core::sync::atomic::*;
}

#[cfg(feature = "loom")]
pub mod atomic {
    pub use loom::sync::atomic::*;
}

#[cfg(not(feature = "loom"))]
pub mod cell {
    #[derive(Debug)]
    #[repr(transparent)]
    pub struct UnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

    impl<T> UnsafeCell<T> {
        #[inline]
        pub const fn new(data: T) -> UnsafeCell<T> {
            UnsafeCell(core::cell::UnsafeCell::new(data))
        }
    }

    impl<T: ?Sized> UnsafeCell<T> {
        #[inline]
        pub fn with<F, R>(&self, f: F) -> R
        where
            F: FnOnce(*const T) -> R,
        {
            f(self.0.get())
        }

        #[inline]
        pub fn with_mut<F, R>(&self, f: F) -> R
        where
            F: FnOnce(*mut T) -> R,
        {
            f(self.0.get())
        }
    }
}

#[cfg(feature = "loom")]
pub mod cell {
    pub use loom::cell::UnsafeCell;
}

#[cfg(not(feature = "loom"))]
pub mod hint {
    pub use core::hint::spin_loop;
}

#[cfg(feature = "loom")]
pub mod hint {
    pub use loom::hint::spin_loop;
}

#[cfg(not(feature = "loom"))]
pub mod thread {
    pub use std::thread::yield_now;
}

#[cfg(feature = "loom")]
pub mod thread {
    pub use loom::thread::yield_now;
}

/// Exponential backoff for the crate's spin loops.
///
/// Spins `2^step` times with CPU pause hints while `step` is small, then
/// falls back to yielding the thread.
///
/// 自旋循环的指数退避：先自旋，再让出线程。
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    #[inline]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }
}
