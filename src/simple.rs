//! Allocation-per-await cursor built on the change signal.
//!
//! 基于变更信号、每次等待分配一次的游标。
//!
//! [`SimpleCursor`] waits on the source's [`Changed`](crate::Changed) future
//! instead of a reusable completion source. It is slower but has no shared
//! state beyond the signal, which makes it a handy reference for the
//! behavior of [`AsyncCursor`](crate::AsyncCursor).

use std::fmt;
use std::pin::pin;

use futures::future::{self, Either};
use tokio_util::sync::CancellationToken;

use crate::cursor::{try_move, Cursor};
use crate::error::CursorError;

/// Cursor that awaits one fresh change future per suspended move
///
/// 每次挂起都等待一个新的变更 future 的游标
pub struct SimpleCursor<C: Cursor> {
    cursor: C,
    cancel: CancellationToken,
}

impl<C: Cursor> SimpleCursor<C> {
    pub fn new(cursor: C) -> Self {
        Self::with_cancellation(cursor, CancellationToken::new())
    }

    /// Pending moves fail with [`CursorError::Canceled`] once `cancel` fires
    pub fn with_cancellation(cursor: C, cancel: CancellationToken) -> Self {
        Self { cursor, cancel }
    }

    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to the next element, waiting for the source if necessary
    ///
    /// 移动到下一个元素，必要时等待数据源
    pub async fn move_next_async(&mut self) -> Result<bool, CursorError> {
        loop {
            if let Some(result) = try_move(&mut self.cursor) {
                return result;
            }
            let Some(changed) = self.cursor.updated() else {
                return Ok(false);
            };
            // The change may have landed before the future existed
            if let Some(result) = try_move(&mut self.cursor) {
                return result;
            }

            let cancelled = pin!(self.cancel.cancelled());
            match future::select(changed, cancelled).await {
                Either::Left(_) => continue,
                Either::Right(_) => {
                    tracing::debug!("simple cursor move canceled");
                    return Err(CursorError::Canceled);
                }
            }
        }
    }

    #[inline]
    pub fn current_key(&self) -> Option<&C::Key> {
        self.cursor.current_key()
    }

    #[inline]
    pub fn current_value(&self) -> Option<&C::Value> {
        self.cursor.current_value()
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.cursor
    }

    pub fn into_inner(self) -> C {
        self.cursor
    }
}

impl<C: Cursor> fmt::Debug for SimpleCursor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCursor")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
