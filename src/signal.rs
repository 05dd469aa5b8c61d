//! Edge-triggered "data changed" signal owned by a container
//!
//! Created lazily by the first reader that asks for it, fired and replaced
//! by the next successful writer. Any number of readers may await the same
//! firing. The slot is guarded by an atomic swap, never by the container's
//! write lock, so readers never block writers.
//!
//! 容器持有的边沿触发「数据已变更」信号
//!
//! 由第一个请求它的读者惰性创建，由下一个成功的写者触发并替换。
//! 任意数量的读者都可以等待同一次触发。
//!
//! # Contract
//!
//! The signal only reports changes that happen after [`ChangeSignal::changed`]
//! was called. A consumer must re-check its own progress condition after
//! obtaining the future and before awaiting it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::task::AtomicWaker;

// States for a signal cell
const PENDING: u8 = 0; // Not fired yet
const CHANGED: u8 = 1; // Fired by a committed write
const COMPLETED: u8 = 2; // Fired because the source will never change again

/// Wake-up slot of one [`Changed`], re-registered in place on every poll
type Waiter = Arc<AtomicWaker>;

/// One firing's worth of shared state
struct SignalCell {
    state: AtomicU8,
    waiters: ArcSwap<Vec<Waiter>>,
}

impl SignalCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            waiters: ArcSwap::from_pointee(Vec::new()),
        }
    }

    #[inline]
    fn fire(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
        let waiters = self.waiters.swap(Arc::new(Vec::new()));
        for waiter in waiters.iter() {
            waiter.wake();
        }
    }

    fn add_waiter(&self, waiter: &Waiter) {
        self.waiters.rcu(|waiters| {
            let mut next = waiters.as_ref().clone();
            next.push(Arc::clone(waiter));
            next
        });
    }

    fn remove_waiter(&self, waiter: &Waiter) {
        self.waiters.rcu(|waiters| {
            let mut next = waiters.as_ref().clone();
            next.retain(|w| !Arc::ptr_eq(w, waiter));
            next
        });
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.waiters.load().len()
    }

    /// Only called on a uniquely owned cell
    fn reset(&mut self) {
        *self.state.get_mut() = PENDING;
        self.waiters.store(Arc::new(Vec::new()));
    }
}

/// Reusable broadcast-once change future source
///
/// 可复用的一次性广播变更 future 源
pub struct ChangeSignal {
    current: ArcSwapOption<SignalCell>,
    recycled: ArcSwapOption<SignalCell>,
    completed: AtomicBool,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            recycled: ArcSwapOption::empty(),
            completed: AtomicBool::new(false),
        }
    }

    /// Future resolving to `true` on the next committed change, or `false`
    /// once the source is complete
    ///
    /// 下一次提交变更时返回 `true`，源完成后返回 `false` 的 future
    pub fn changed(&self) -> Changed {
        if self.completed.load(Ordering::SeqCst) {
            return Changed::resolved(false);
        }
        if let Some(cell) = self.current.load_full() {
            return Changed::waiting(cell);
        }

        let fresh = self.take_recycled().unwrap_or_else(|| Arc::new(SignalCell::new()));
        let prev = self.current.rcu(|current| match current {
            Some(existing) => Some(Arc::clone(existing)),
            None => Some(Arc::clone(&fresh)),
        });
        let cell = match prev {
            // Lost the race to install, share the winner's cell
            Some(existing) => existing,
            None => {
                // `notify(false)` may have latched completion before we installed
                if self.completed.load(Ordering::SeqCst) {
                    self.fire_current(COMPLETED);
                }
                fresh
            }
        };
        Changed::waiting(cell)
    }

    /// Fire the pending future, if any
    ///
    /// `result == false` also latches the signal as completed: every later
    /// [`changed`](Self::changed) resolves to `false` immediately.
    ///
    /// 触发等待中的 future（如果有）。`result == false` 同时将信号锁定为已完成。
    pub fn notify(&self, result: bool) {
        if !result {
            self.completed.store(true, Ordering::SeqCst);
        }
        self.fire_current(if result { CHANGED } else { COMPLETED });
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn fire_current(&self, state: u8) {
        if let Some(cell) = self.current.swap(None) {
            cell.fire(state);
            self.recycled.store(Some(cell));
        }
    }

    /// Reuse the last fired cell once every `Changed` holding it is gone
    fn take_recycled(&self) -> Option<Arc<SignalCell>> {
        let mut cell = self.recycled.swap(None)?;
        let unique = Arc::get_mut(&mut cell)?;
        unique.reset();
        tracing::trace!("change signal cell recycled");
        Some(cell)
    }
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSignal")
            .field("armed", &self.current.load().is_some())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Future returned by [`ChangeSignal::changed`]
///
/// [`ChangeSignal::changed`] 返回的 Future
pub struct Changed {
    cell: Option<Arc<SignalCell>>,
    waiter: Option<Waiter>,
    resolved: bool,
}

impl Changed {
    #[inline]
    fn waiting(cell: Arc<SignalCell>) -> Self {
        Self {
            cell: Some(cell),
            waiter: None,
            resolved: false,
        }
    }

    #[inline]
    fn resolved(value: bool) -> Self {
        Self {
            cell: None,
            waiter: None,
            resolved: value,
        }
    }

    /// Outcome if the signal already fired, without registering interest
    pub fn peek(&self) -> Option<bool> {
        match &self.cell {
            None => Some(self.resolved),
            Some(cell) => match cell.state.load(Ordering::SeqCst) {
                PENDING => None,
                state => Some(state == CHANGED),
            },
        }
    }
}

impl Future for Changed {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        let Some(cell) = &this.cell else {
            return Poll::Ready(this.resolved);
        };

        // Fast path
        match cell.state.load(Ordering::SeqCst) {
            PENDING => {}
            state => return Poll::Ready(state == CHANGED),
        }

        match &this.waiter {
            // Re-poll: swap the waker in place, the slot stays listed
            Some(waiter) => waiter.register(cx.waker()),
            None => {
                let waiter = Arc::new(AtomicWaker::new());
                waiter.register(cx.waker());
                cell.add_waiter(&waiter);
                this.waiter = Some(waiter);
            }
        }

        // Check again after registering, `fire` may have drained already
        match cell.state.load(Ordering::SeqCst) {
            PENDING => Poll::Pending,
            state => Poll::Ready(state == CHANGED),
        }
    }
}

impl Drop for Changed {
    fn drop(&mut self) {
        if let (Some(cell), Some(waiter)) = (&self.cell, &self.waiter) {
            if cell.state.load(Ordering::SeqCst) == PENDING {
                cell.remove_waiter(waiter);
            }
        }
    }
}

impl fmt::Debug for Changed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changed").field("outcome", &self.peek()).finish()
    }
}
