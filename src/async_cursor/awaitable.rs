//! Shared half of an [`AsyncCursor`](super::AsyncCursor): the completion
//! source notifiers and drive steps operate on.
//!
//! 异步游标的共享部分：通知者与驱动步骤所操作的完成源。
//!
//! # Ownership hand-off | 所有权交接
//!
//! `locked` says who may touch the underlying cursor and its subscription.
//! The consumer holds it while idle. Registering a continuation releases
//! it; a notifier that wins the CAS marks it `QUEUED` and schedules
//! [`Awaitable::drive`], which claims it when it starts. Completion keeps it
//! held, which hands it straight back to the consumer. A party that loses
//! the CAS sets `skipped`, and the holder checks `skipped` after every
//! release.
//!
//! A consumer that stops waiting may claim a `QUEUED` flag itself, in which
//! case the scheduled drive finds nothing to do.

use std::sync::{Arc, Weak};

use crate::completer::{Subscriber, Subscription, ACKNOWLEDGE, REQUEST_ONE};
use crate::continuation::{ContinuationCell, Parked};
use crate::cursor::{try_move, Cursor};
use crate::error::CursorError;
use crate::metrics::{CursorEvent, CursorMetrics};
use crate::scheduler::{self, Scheduler};
use crate::shim::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use crate::shim::cell::UnsafeCell;
use crate::shim::Backoff;

use super::{MoveStatus, Token};

// Hand-off flag states
const UNLOCKED: u8 = 0; // Nobody may touch the cursor, the next claimant wins
const HELD: u8 = 1; // Consumer or a running drive owns the cursor
const QUEUED: u8 = 2; // Claimed for a drive that has not started yet

/// Push link to the source, established on the first failed move
pub(super) enum Link {
    Unlinked,
    /// The source cannot push; async moves never suspend
    Null,
    Linked(Subscription),
}

/// State only the holder of the hand-off flag may touch
pub(super) struct Owned<C> {
    pub(super) cursor: C,
    pub(super) link: Link,
}

impl<C> Owned<C> {
    #[inline]
    fn arm(&self) {
        if let Link::Linked(subscription) = &self.link {
            subscription.request_notification(REQUEST_ONE);
        }
    }

    #[inline]
    fn ack(&self) {
        if let Link::Linked(subscription) = &self.link {
            subscription.request_notification(ACKNOWLEDGE);
        }
    }
}

pub(super) struct Awaitable<C: Cursor> {
    owned: UnsafeCell<Owned<C>>,
    locked: AtomicU8,
    skipped: AtomicBool,
    canceled: AtomicBool,
    token: AtomicU16,
    pub(super) cell: ContinuationCell,
    result: UnsafeCell<Option<Result<bool, CursorError>>>,
    scheduler: Arc<dyn Scheduler>,
    metrics: Arc<dyn CursorMetrics>,
    this: Weak<Awaitable<C>>,
}

// SAFETY: `owned` is only accessed by the holder of `locked`; `result` is
// written before the cell fires and read by the consumer after it has
// observed the firing
unsafe impl<C: Cursor> Send for Awaitable<C> {}
unsafe impl<C: Cursor> Sync for Awaitable<C> {}

impl<C: Cursor> Awaitable<C> {
    pub(super) fn new(
        cursor: C,
        scheduler: Arc<dyn Scheduler>,
        metrics: Arc<dyn CursorMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            owned: UnsafeCell::new(Owned {
                cursor,
                link: Link::Unlinked,
            }),
            // The consumer starts out as the owner
            locked: AtomicU8::new(HELD),
            skipped: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            token: AtomicU16::new(0),
            cell: ContinuationCell::new(),
            result: UnsafeCell::new(None),
            scheduler,
            metrics,
            this: this.clone(),
        })
    }

    /// # Safety
    /// The caller holds the hand-off flag.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(super) unsafe fn owned_mut(&self) -> &mut Owned<C> {
        self.owned.with_mut(|owned| &mut *owned)
    }

    /// # Safety
    /// The caller holds the hand-off flag.
    #[inline]
    pub(super) unsafe fn owned(&self) -> &Owned<C> {
        self.owned.with(|owned| &*owned)
    }

    #[inline]
    pub(super) fn metrics(&self) -> &dyn CursorMetrics {
        &*self.metrics
    }

    #[inline]
    pub(super) fn token(&self) -> Token {
        Token(self.token.load(Ordering::Acquire))
    }

    /// Subscribe to the source if not yet done, replacing a subscription
    /// that was closed by a cancellation. Returns whether the source pushes.
    ///
    /// Takes the caller's borrow of the owned half rather than making a
    /// second one.
    pub(super) fn ensure_linked(&self, owned: &mut Owned<C>) -> bool {
        if matches!(&owned.link, Link::Linked(subscription) if subscription.is_closed()) {
            owned.link = Link::Unlinked;
        }
        if let Link::Unlinked = owned.link {
            owned.link = match owned.cursor.completer() {
                Some(completer) => {
                    self.metrics.record(CursorEvent::Subscribe);
                    let subscriber: Weak<dyn Subscriber> = self.this.clone();
                    Link::Linked(completer.subscribe(subscriber))
                }
                None => {
                    tracing::debug!("source has no completer, async moves will not suspend");
                    Link::Null
                }
            };
        }
        matches!(owned.link, Link::Linked(_))
    }

    /// Start a new cycle
    ///
    /// Consumer only, holding the flag, with the previous cycle's result
    /// already collected.
    pub(super) fn reset(&self) -> Token {
        let token = self.token.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.skipped.store(false, Ordering::SeqCst);
        self.canceled.store(false, Ordering::SeqCst);
        // SAFETY: no completer exists for a cycle that has not been handed off
        self.result.with_mut(|slot| unsafe { *slot = None });
        self.cell.reset();
        tracing::trace!(token, "move cycle reset");
        Token(token)
    }

    /// Arm one notification, give up the flag and retry once off-stack
    ///
    /// Called by the consumer right after storing its continuation.
    pub(super) fn hand_off(&self) {
        // SAFETY: the consumer still holds the flag here
        unsafe { self.owned() }.arm();
        self.locked.store(UNLOCKED, Ordering::SeqCst);
        tracing::trace!("cursor handed off");

        // Data may have landed between the last failed move and the arm;
        // that commit found nobody armed
        if self.acquire(QUEUED) {
            self.schedule_drive();
        }
    }

    /// Take the hand-off flag as `claim`, or leave a note for whoever holds it
    fn acquire(&self, claim: u8) -> bool {
        loop {
            if self
                .locked
                .compare_exchange(UNLOCKED, claim, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            self.skipped.store(true, Ordering::SeqCst);
            // Still taken: the holder reads `skipped` after it releases
            if self.locked.load(Ordering::SeqCst) != UNLOCKED {
                return false;
            }
        }
    }

    fn schedule_drive(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.scheduler.clone().schedule(Box::new(move || this.drive()));
    }

    /// Retry the move off the notifier's stack
    ///
    /// Runs with the flag held. Loops instead of recursing when an update
    /// was skipped while it held the flag.
    fn drive(self: Arc<Self>) {
        if self
            .locked
            .compare_exchange(QUEUED, HELD, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::trace!("queued drive was reclaimed by the consumer");
            return;
        }
        self.metrics.record(CursorEvent::Drive);
        tracing::trace!("drive started");
        loop {
            // SAFETY: the flag is held for the whole step
            let owned = unsafe { self.owned_mut() };
            if let Some(result) = self.step(owned) {
                owned.ack();
                self.complete(result);
                return;
            }

            self.locked.store(UNLOCKED, Ordering::SeqCst);
            if !self.skipped.load(Ordering::SeqCst) {
                tracing::trace!("drive parked");
                return;
            }
            if self
                .locked
                .compare_exchange(UNLOCKED, HELD, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Someone else took over
                return;
            }
            self.metrics.record(CursorEvent::SkippedUpdate);
        }
    }

    /// One drive attempt. `None` means the cursor has to wait again and is
    /// armed for the next commit.
    fn step(&self, owned: &mut Owned<C>) -> Option<Result<bool, CursorError>> {
        loop {
            // Clear before looking: a cancel or commit that lands after this
            // store leaves `skipped` set for the check below
            self.skipped.store(false, Ordering::SeqCst);
            if self.canceled.load(Ordering::SeqCst) {
                return Some(Err(CursorError::Canceled));
            }
            if let Some(result) = try_move(&mut owned.cursor) {
                return Some(result);
            }
            if !self.skipped.load(Ordering::SeqCst) {
                break;
            }
        }

        owned.arm();
        // A commit between the failed move and the arm found nobody armed
        try_move(&mut owned.cursor)
    }

    /// Publish the cycle's result and resume its continuation
    ///
    /// # Panics
    /// If the cycle already completed.
    fn complete(&self, result: Result<bool, CursorError>) {
        assert!(!self.cell.is_fired(), "asynchronous move completed twice");
        self.metrics.record(match &result {
            Err(CursorError::Canceled) => CursorEvent::Canceled,
            _ => CursorEvent::Completion,
        });
        tracing::trace!(ok = result.is_ok(), "move completed");

        // SAFETY: the cycle is not fired, so the consumer is not reading
        self.result.with_mut(|slot| unsafe { *slot = Some(result) });
        if let Some(parked) = self.cell.fire() {
            self.dispatch(parked, false);
        }
    }

    /// Resume a continuation. A captured context other than the current one
    /// gets the continuation scheduled onto it; `force_async` never runs it
    /// on this stack.
    pub(super) fn dispatch(&self, (continuation, context): Parked, force_async: bool) {
        match context {
            Some(context) if force_async || !scheduler::is_current(&context) => {
                context.schedule(Box::new(move || continuation.resume()));
            }
            None if force_async => {
                self.scheduler
                    .clone()
                    .schedule(Box::new(move || continuation.resume()));
            }
            _ => continuation.resume(),
        }
    }

    /// Cancel the cycle for a consumer that stopped waiting, and wait until
    /// it has fired
    ///
    /// Returns `true` if the cancellation completed it here. `false` means a
    /// drive finished it first and its result is left for adoption. A
    /// running drive is waited out; a queued one is claimed instead, so this
    /// never depends on the scheduler making progress.
    pub(super) fn settle_abandoned(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        let mut backoff = Backoff::new();
        loop {
            if self.cell.is_fired() {
                tracing::debug!("abandoned move finished by its drive");
                return false;
            }
            if self.acquire(HELD)
                || self
                    .locked
                    .compare_exchange(QUEUED, HELD, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                // SAFETY: just claimed; a fired cycle keeps the flag, so this
                // one is still pending and no drive is running it
                unsafe { self.owned() }.ack();
                self.complete(Err(CursorError::Canceled));
                tracing::debug!("pending move abandoned");
                return true;
            }
            backoff.snooze();
        }
    }

    /// Status of a fired cycle
    pub(super) fn status(&self) -> MoveStatus {
        if !self.cell.is_fired() {
            return MoveStatus::Pending;
        }
        // SAFETY: fired, the completer is done with the slot
        self.result.with(|slot| match unsafe { &*slot } {
            Some(Ok(_)) => MoveStatus::Succeeded,
            Some(Err(CursorError::Canceled)) => MoveStatus::Canceled,
            Some(Err(CursorError::Source(_))) => MoveStatus::Faulted,
            None => panic!("completion token already redeemed"),
        })
    }

    /// Collect a fired cycle's result
    pub(super) fn take_result(&self) -> Result<bool, CursorError> {
        assert!(self.cell.is_fired(), "result read while the move is still pending");
        // SAFETY: fired, the completer is done with the slot
        match self.result.with_mut(|slot| unsafe { (*slot).take() }) {
            Some(result) => result,
            None => panic!("completion token already redeemed"),
        }
    }
}

impl<C: Cursor> Subscriber for Awaitable<C> {
    fn try_complete(&self, cancel: bool) {
        if cancel && !self.canceled.swap(true, Ordering::SeqCst) {
            tracing::debug!("cancellation recorded");
        }
        if self.acquire(QUEUED) {
            self.schedule_drive();
        } else {
            self.metrics.record(CursorEvent::SkippedUpdate);
            tracing::trace!("update skipped, owner will retry");
        }
    }
}
