//! Single-slot continuation storage for a reusable completion source.
//!
//! 可复用完成源的单槽 continuation 存储。
//!
//! Same shape as an atomic waker: an `UnsafeCell` guarded by a small CAS
//! state machine, no allocation per registration. Unlike a waker slot it
//! fires exactly once per cycle and remembers that it fired, so a late
//! registration is handed back instead of being lost.

use std::fmt;
use std::sync::Arc;
use std::task::Waker;

use crate::scheduler::{Scheduler, Task};
use crate::shim::atomic::{AtomicU8, Ordering};
use crate::shim::cell::UnsafeCell;
use crate::shim::Backoff;

// Cell states
const EMPTY: u8 = 0; // Nothing stored, not fired
const REGISTERING: u8 = 1; // Consumer is writing the slot
const SET: u8 = 2; // Continuation stored, waiting for the completer
const FIRING: u8 = 3; // Completer is taking the slot
const FIRED: u8 = 4; // Cycle completed; result is published

/// What to run when an asynchronous move completes
///
/// 异步移动完成时要执行的操作
pub enum Continuation {
    /// Wake a task polling a future
    Waker(Waker),
    /// Run a callback
    Callback(Task),
}

impl Continuation {
    /// Callback continuation carrying its own state
    ///
    /// 携带自身状态的回调 continuation
    pub fn callback<F, S>(f: F, state: S) -> Self
    where
        F: FnOnce(S) + Send + 'static,
        S: Send + 'static,
    {
        Continuation::Callback(Box::new(move || f(state)))
    }

    #[inline]
    pub(crate) fn resume(self) {
        match self {
            Continuation::Waker(waker) => waker.wake(),
            Continuation::Callback(task) => task(),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Waker(waker) => f.debug_tuple("Waker").field(waker).finish(),
            Continuation::Callback(_) => f.debug_tuple("Callback").finish(),
        }
    }
}

/// Continuation plus the scheduler context it should resume on
pub(crate) type Parked = (Continuation, Option<Arc<dyn Scheduler>>);

/// Result of [`ContinuationCell::register`]
pub(crate) enum Registration {
    /// The completer will resume it
    Stored,
    /// The cycle already completed; the caller must dispatch it
    AlreadyFired(Parked),
}

/// Fire-once continuation slot
///
/// One consumer registers, one completer fires. The consumer resets the
/// cell between cycles, only after it has observed `FIRED`.
pub(crate) struct ContinuationCell {
    state: AtomicU8,
    slot: UnsafeCell<Option<Parked>>,
}

// SAFETY: the slot is only touched by whoever moved the state machine into
// REGISTERING or FIRING, or by the consumer while no completer can race it
unsafe impl Send for ContinuationCell {}
unsafe impl Sync for ContinuationCell {}

impl ContinuationCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(None),
        }
    }

    /// Whether the current cycle has completed
    ///
    /// Acquire: everything the completer wrote before firing is visible.
    #[inline]
    pub(crate) fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Store a continuation for the current cycle
    ///
    /// # Panics
    /// If a continuation is already stored for this cycle.
    pub(crate) fn register(&self, parked: Parked) -> Registration {
        match self
            .state
            .compare_exchange(EMPTY, REGISTERING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: REGISTERING gives us exclusive access to the slot
                self.slot.with_mut(|slot| unsafe { *slot = Some(parked) });

                match self
                    .state
                    .compare_exchange(REGISTERING, SET, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => Registration::Stored,
                    Err(_) => {
                        // Fired while we were registering; the completer left
                        // the slot alone, take it back
                        // SAFETY: FIRED, the completer no longer touches the slot
                        let parked = self.slot.with_mut(|slot| unsafe { (*slot).take() });
                        match parked {
                            Some(parked) => Registration::AlreadyFired(parked),
                            None => unreachable!("continuation slot emptied during registration"),
                        }
                    }
                }
            }
            Err(FIRED) => Registration::AlreadyFired(parked),
            Err(_) => panic!("a continuation is already registered for this move"),
        }
    }

    /// Take a stored continuation back so a different one can be registered
    ///
    /// Leaves the cell `EMPTY`, or `FIRED` if the completer won the race.
    pub(crate) fn retract(&self) -> Option<Parked> {
        let mut backoff = Backoff::new();
        loop {
            match self
                .state
                .compare_exchange(SET, REGISTERING, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => break,
                // The completer is between taking the slot and publishing FIRED
                Err(FIRING) => backoff.snooze(),
                Err(_) => return None,
            }
        }
        // SAFETY: REGISTERING gives us exclusive access to the slot
        let parked = self.slot.with_mut(|slot| unsafe { (*slot).take() });
        // A concurrent fire turns REGISTERING into FIRED; keep that
        let _ = self
            .state
            .compare_exchange(REGISTERING, EMPTY, Ordering::AcqRel, Ordering::Acquire);
        parked
    }

    /// Mark the cycle complete and hand back the stored continuation
    ///
    /// The caller publishes the result before calling this.
    ///
    /// # Panics
    /// If the cycle was already completed.
    pub(crate) fn fire(&self) -> Option<Parked> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                FIRING | FIRED => panic!("asynchronous move completed twice"),
                SET => {
                    match self.state.compare_exchange_weak(
                        SET,
                        FIRING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // SAFETY: FIRING gives us exclusive access to the slot
                            let parked = self.slot.with_mut(|slot| unsafe { (*slot).take() });
                            self.state.store(FIRED, Ordering::Release);
                            return parked;
                        }
                        Err(actual) => current = actual,
                    }
                }
                // EMPTY or REGISTERING: the registrant picks up FIRED itself
                _ => match self.state.compare_exchange_weak(
                    current,
                    FIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return None,
                    Err(actual) => current = actual,
                },
            }
        }
    }

    /// Start a new cycle. Consumer only, with no completer in flight.
    pub(crate) fn reset(&self) {
        // SAFETY: no completer can fire before the consumer hands the cycle off
        let stale = self.slot.with_mut(|slot| unsafe { (*slot).take() });
        drop(stale);
        self.state.store(EMPTY, Ordering::Release);
    }
}

impl Drop for ContinuationCell {
    fn drop(&mut self) {
        // SAFETY: exclusive access during drop
        self.slot.with_mut(|slot| unsafe {
            let _ = (*slot).take();
        });
    }
}

impl fmt::Debug for ContinuationCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            EMPTY => "empty",
            REGISTERING => "registering",
            SET => "set",
            FIRING => "firing",
            _ => "fired",
        };
        f.debug_struct("ContinuationCell").field("state", &state).finish()
    }
}
