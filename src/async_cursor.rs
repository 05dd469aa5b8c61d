//! Zero-allocation asynchronous move-next over a synchronous [`Cursor`].
//!
//! 基于同步 [`Cursor`] 的零分配异步 move-next。
//!
//! An [`AsyncCursor`] owns one reusable completion source. A move first
//! tries the underlying cursor synchronously; only when that fails does it
//! subscribe to the source (once), reset the completion source and wait for
//! a push notification. Every suspended move is identified by a [`Token`];
//! redeeming a stale token is a usage fault and panics.
//!
//! # Example
//!
//! ```
//! use series_sync::{AsyncCursor, Series};
//!
//! # tokio_test::block_on(async {
//! let series = Series::<u64, f64>::new();
//! let mut cursor = AsyncCursor::new(series.cursor());
//!
//! let writer = series.clone();
//! tokio::spawn(async move {
//!     writer.append(1, 10.0).unwrap();
//!     writer.complete().unwrap();
//! });
//!
//! assert!(cursor.move_next_async().await.unwrap());
//! assert_eq!(cursor.current_value(), Some(&10.0));
//! assert!(!cursor.move_next_async().await.unwrap());
//! # });
//! ```
//!
//! # Cancellation | 取消
//!
//! A cancellation delivered through the source's subscription completes the
//! pending move with [`CursorError::Canceled`]. Dropping a pending
//! [`MoveNext`] (for example when it loses a `select!` or times out) also
//! cancels it. If a drive step is running at that moment, the drop waits
//! for it to finish and the next `move_next_async` adopts its outcome, so
//! an item found by that step is not lost. Either way the cursor is free
//! for synchronous use right after the drop.

mod awaitable;
mod future;

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::config::CursorConfig;
use crate::continuation::{Continuation, Parked, Registration};
use crate::cursor::{try_move, Cursor, Lookup};
use crate::error::{CursorError, SourceError};
use crate::metrics::CursorEvent;
use crate::scheduler;

use awaitable::Awaitable;

pub use future::MoveNext;

/// Identifies one suspended move
///
/// 标识一次挂起的移动
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u16);

/// Outcome of [`AsyncCursor::start_move`]
#[derive(Debug)]
pub enum MoveStart {
    /// Resolved without suspending
    Ready(Result<bool, CursorError>),
    /// Suspended; redeem with this token
    Pending(Token),
}

/// Status of a suspended move
///
/// 挂起移动的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveStatus {
    Pending,
    Succeeded,
    Canceled,
    Faulted,
}

// Consumer-side view of the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flight {
    /// No cycle; the consumer owns the cursor
    Idle,
    /// Cycle reset, nothing registered; the consumer still owns the cursor
    Reset(Token),
    /// Handed off, no continuation stored
    Detached(Token),
    /// Handed off with a continuation stored
    Waiting(Token),
}

impl Flight {
    #[inline]
    fn token(self) -> Option<Token> {
        match self {
            Flight::Idle => None,
            Flight::Reset(token) | Flight::Detached(token) | Flight::Waiting(token) => Some(token),
        }
    }
}

/// Single-reader cursor with an awaitable move-next
///
/// 支持可等待 move-next 的单读者游标
pub struct AsyncCursor<C: Cursor> {
    shared: Arc<Awaitable<C>>,
    flight: Flight,
    abandoned: bool,
    waker: Option<Waker>,
    config: CursorConfig,
}

impl<C: Cursor> AsyncCursor<C> {
    pub fn new(cursor: C) -> Self {
        Self::with_config(cursor, CursorConfig::default())
    }

    pub fn with_config(cursor: C, config: CursorConfig) -> Self {
        let scheduler = config
            .scheduler
            .clone()
            .unwrap_or_else(scheduler::default_scheduler);
        Self {
            shared: Awaitable::new(cursor, scheduler, config.metrics.clone()),
            flight: Flight::Idle,
            abandoned: false,
            waker: None,
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &CursorConfig {
        &self.config
    }

    /// Move to the next element, waiting for the source if necessary
    ///
    /// Resolves to `Ok(false)` once the source is complete, or right away
    /// when the source cannot push notifications.
    ///
    /// 移动到下一个元素，必要时等待数据源。
    pub fn move_next_async(&mut self) -> MoveNext<'_, C> {
        let start = self.start_move();
        MoveNext::new(self, start)
    }

    /// Begin a move without a future around it
    ///
    /// The synchronous fast path runs first. `Pending` hands out the token
    /// for [`poll_status`](Self::poll_status),
    /// [`register_continuation`](Self::register_continuation) and
    /// [`get_result`](Self::get_result). If an abandoned move is still in
    /// flight, its token is handed out instead of starting a new one.
    ///
    /// 开始一次移动：先走同步快速路径，挂起时返回令牌。
    pub fn start_move(&mut self) -> MoveStart {
        match self.flight {
            Flight::Waiting(token) | Flight::Detached(token) => {
                if let Flight::Waiting(_) = self.flight {
                    drop(self.shared.cell.retract());
                    self.waker = None;
                    self.flight = Flight::Detached(token);
                }
                if !self.shared.cell.is_fired() {
                    return MoveStart::Pending(token);
                }
                if let Some(result) = self.finish_cycle() {
                    return MoveStart::Ready(result);
                }
            }
            Flight::Reset(_) => self.flight = Flight::Idle,
            Flight::Idle => {}
        }
        self.begin()
    }

    fn begin(&mut self) -> MoveStart {
        let metrics = self.shared.metrics();
        // SAFETY: no cycle is in flight, the consumer holds the flag
        let owned = unsafe { self.shared.owned_mut() };
        if let Some(result) = try_move(&mut owned.cursor) {
            metrics.record(CursorEvent::SyncMove);
            return MoveStart::Ready(result);
        }
        // Reset before linking: a cancel that closes the subscription from
        // here on stays recorded for this cycle
        let token = self.shared.reset();
        if !self.shared.ensure_linked(owned) {
            return MoveStart::Ready(Ok(false));
        }

        // The source may have changed before the subscription existed
        if let Some(result) = try_move(&mut owned.cursor) {
            metrics.record(CursorEvent::SyncMove);
            return MoveStart::Ready(result);
        }
        metrics.record(CursorEvent::AsyncMove);
        self.flight = Flight::Reset(token);
        MoveStart::Pending(token)
    }

    /// # Panics
    /// If `token` does not belong to the move currently in flight.
    fn check_token(&self, token: Token) {
        let current = self.flight.token();
        if current != Some(token) || self.shared.token() != token {
            panic!("stale completion token {:?} (current {:?})", token, current);
        }
    }

    /// Status of the suspended move. Does not move the cursor.
    ///
    /// # Panics
    /// On a stale token.
    pub fn poll_status(&self, token: Token) -> MoveStatus {
        self.check_token(token);
        self.shared.status()
    }

    /// Collect the result of a completed move
    ///
    /// # Panics
    /// On a stale token, or while the move is still pending.
    pub fn get_result(&mut self, token: Token) -> Result<bool, CursorError> {
        self.check_token(token);
        let result = self.shared.take_result();
        self.flight = Flight::Idle;
        self.abandoned = false;
        self.waker = None;
        result
    }

    /// Store the one continuation of the suspended move
    ///
    /// If the move already completed, the continuation is scheduled rather
    /// than run on this stack. With `capture_context`, it resumes on the
    /// scheduler context current at registration, if any.
    ///
    /// 为挂起的移动存储唯一的 continuation。
    ///
    /// # Panics
    /// On a stale token, or if a continuation is already registered for
    /// this move.
    pub fn register_continuation(
        &mut self,
        token: Token,
        continuation: Continuation,
        capture_context: bool,
    ) {
        if let Some(parked) = self.park(token, continuation, capture_context) {
            self.shared.dispatch(parked, true);
        }
    }

    /// Returns the continuation back if the move already completed
    fn park(
        &mut self,
        token: Token,
        continuation: Continuation,
        capture_context: bool,
    ) -> Option<Parked> {
        self.check_token(token);
        let context = if capture_context {
            scheduler::capture()
        } else {
            None
        };

        match self.flight {
            Flight::Reset(_) => {
                let registration = self.shared.cell.register((continuation, context));
                self.flight = Flight::Waiting(token);
                match registration {
                    Registration::Stored => {
                        tracing::trace!(?token, "continuation registered");
                        self.shared.hand_off();
                        None
                    }
                    Registration::AlreadyFired(parked) => Some(parked),
                }
            }
            Flight::Detached(_) => {
                self.flight = Flight::Waiting(token);
                match self.shared.cell.register((continuation, context)) {
                    Registration::Stored => None,
                    Registration::AlreadyFired(parked) => Some(parked),
                }
            }
            Flight::Waiting(_) | Flight::Idle => {
                panic!("a continuation is already registered for this move")
            }
        }
    }

    /// Drive the current move from a task context
    pub(crate) fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Result<bool, CursorError>> {
        loop {
            match self.flight {
                Flight::Idle => {
                    if let MoveStart::Ready(result) = self.start_move() {
                        return Poll::Ready(result);
                    }
                }
                Flight::Reset(token) | Flight::Detached(token) => {
                    let waker = cx.waker().clone();
                    self.waker = Some(waker.clone());
                    let capture = self.config.capture_context;
                    if self.park(token, Continuation::Waker(waker), capture).is_none()
                        && !self.shared.cell.is_fired()
                    {
                        return Poll::Pending;
                    }
                }
                Flight::Waiting(token) => {
                    if self.shared.cell.is_fired() {
                        match self.finish_cycle() {
                            Some(result) => return Poll::Ready(result),
                            None => continue,
                        }
                    }
                    if self
                        .waker
                        .as_ref()
                        .is_some_and(|waker| waker.will_wake(cx.waker()))
                    {
                        return Poll::Pending;
                    }
                    // Polled from a different task; swap the continuation
                    drop(self.shared.cell.retract());
                    self.flight = Flight::Detached(token);
                }
            }
        }
    }

    /// Collect a fired cycle. `None` restarts an abandoned move that ended
    /// up canceled.
    fn finish_cycle(&mut self) -> Option<Result<bool, CursorError>> {
        let result = self.shared.take_result();
        self.flight = Flight::Idle;
        self.waker = None;
        let abandoned = std::mem::take(&mut self.abandoned);
        match result {
            Err(CursorError::Canceled) if abandoned => {
                tracing::debug!("abandoned move was canceled, restarting");
                None
            }
            result => Some(result),
        }
    }

    /// The future of the current move went away before completing
    pub(crate) fn abandon(&mut self) {
        match self.flight {
            Flight::Idle => {}
            Flight::Reset(_) => self.flight = Flight::Idle,
            Flight::Detached(_) | Flight::Waiting(_) => {
                self.abandoned = true;
                self.waker = None;
                if self.shared.settle_abandoned() {
                    let _ = self.shared.take_result();
                    self.flight = Flight::Idle;
                    self.abandoned = false;
                }
            }
        }
    }

    /// Whether a move is in flight and the cursor belongs to a drive step
    #[inline]
    pub fn is_busy(&self) -> bool {
        match self.flight {
            Flight::Idle | Flight::Reset(_) => false,
            Flight::Detached(_) | Flight::Waiting(_) => !self.shared.cell.is_fired(),
        }
    }

    /// The underlying cursor
    ///
    /// # Panics
    /// While a move is in flight.
    pub fn get_ref(&self) -> &C {
        assert!(!self.is_busy(), "cursor is busy with an in-flight move");
        // SAFETY: not busy, the consumer holds the flag
        unsafe { &self.shared.owned().cursor }
    }

    /// The underlying cursor, for repositioning
    ///
    /// A completed move nobody collected is discarded.
    ///
    /// # Panics
    /// While a move is in flight.
    pub fn get_mut(&mut self) -> &mut C {
        assert!(!self.is_busy(), "cursor is busy with an in-flight move");
        match self.flight {
            Flight::Idle => {}
            Flight::Reset(_) => self.flight = Flight::Idle,
            Flight::Detached(_) | Flight::Waiting(_) => {
                let _ = self.shared.take_result();
                self.flight = Flight::Idle;
                self.abandoned = false;
                self.waker = None;
            }
        }
        // SAFETY: not busy, the consumer holds the flag
        unsafe { &mut self.shared.owned_mut().cursor }
    }

    #[inline]
    pub fn move_next(&mut self) -> Result<bool, SourceError> {
        self.get_mut().move_next()
    }

    #[inline]
    pub fn move_at(&mut self, key: &C::Key, lookup: Lookup) -> bool {
        self.get_mut().move_at(key, lookup)
    }

    #[inline]
    pub fn move_first(&mut self) -> bool {
        self.get_mut().move_first()
    }

    #[inline]
    pub fn move_last(&mut self) -> bool {
        self.get_mut().move_last()
    }

    #[inline]
    pub fn move_previous(&mut self) -> bool {
        self.get_mut().move_previous()
    }

    #[inline]
    pub fn current_key(&self) -> Option<&C::Key> {
        self.get_ref().current_key()
    }

    #[inline]
    pub fn current_value(&self) -> Option<&C::Value> {
        self.get_ref().current_value()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.get_ref().is_completed()
    }

    /// Release the cursor, cancelling a pending move
    pub fn dispose(self) {
        drop(self);
    }
}

impl<C: Cursor + Clone> Clone for AsyncCursor<C> {
    /// A fresh async cursor at the same position. No subscription or
    /// pending move is shared.
    ///
    /// # Panics
    /// While a move is in flight.
    fn clone(&self) -> Self {
        Self::with_config(self.get_ref().clone(), self.config.clone())
    }
}

impl<C: Cursor> Drop for AsyncCursor<C> {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl<C: Cursor> fmt::Debug for AsyncCursor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCursor")
            .field("flight", &self.flight)
            .field("cell", &self.shared.cell)
            .finish_non_exhaustive()
    }
}
