//! Batch-mode overlay: drain pre-grouped chunks before single-item moves.
//!
//! 批处理模式覆盖层：先消费预分组的数据块，再回到逐项移动。
//!
//! While batch mode is on, moves are served from a local buffer filled by
//! [`Cursor::next_batch`]. The first time the source reports no further
//! batches, batch mode is switched off for good, the underlying cursor is
//! repositioned on the last key handed out, and every later move goes
//! through the inner [`AsyncCursor`].

use std::collections::VecDeque;
use std::fmt;

use crate::async_cursor::AsyncCursor;
use crate::cursor::{BatchPoll, Cursor, Lookup};
use crate::error::CursorError;

/// [`AsyncCursor`] with a batch-draining fast path
///
/// 带批量消费快速路径的 [`AsyncCursor`]
pub struct BatchCursor<C: Cursor> {
    inner: AsyncCursor<C>,
    buffer: VecDeque<(C::Key, C::Value)>,
    current: Option<(C::Key, C::Value)>,
    batch_mode: bool,
}

impl<C: Cursor> BatchCursor<C> {
    /// Batch mode starts enabled if the cursor's config allows it
    pub fn new(inner: AsyncCursor<C>) -> Self {
        let batch_mode = inner.config().batch_mode;
        Self {
            inner,
            buffer: VecDeque::new(),
            current: None,
            batch_mode,
        }
    }

    #[inline]
    pub fn is_batch_mode(&self) -> bool {
        self.batch_mode
    }

    /// Move to the next element
    ///
    /// # Panics
    /// If the source hands out an empty batch, or no longer contains the
    /// last batch key when batch mode ends.
    pub async fn move_next_async(&mut self) -> Result<bool, CursorError> {
        while self.batch_mode {
            if let Some(item) = self.buffer.pop_front() {
                self.current = Some(item);
                return Ok(true);
            }

            match self.inner.get_mut().next_batch() {
                BatchPoll::Ready(items) => {
                    assert!(!items.is_empty(), "source handed out an empty batch");
                    tracing::trace!(len = items.len(), "batch fetched");
                    self.buffer.extend(items);
                }
                BatchPoll::Pending => self.wait_for_batch().await,
                BatchPoll::Exhausted | BatchPoll::Unsupported => self.leave_batch_mode(),
            }
        }
        self.inner.move_next_async().await
    }

    /// Wait for the source to change, re-checking after the future exists
    async fn wait_for_batch(&mut self) {
        let Some(changed) = self.inner.get_ref().updated() else {
            // Nothing will ever wake us
            self.leave_batch_mode();
            return;
        };
        match self.inner.get_mut().next_batch() {
            BatchPoll::Ready(items) => {
                assert!(!items.is_empty(), "source handed out an empty batch");
                self.buffer.extend(items);
            }
            BatchPoll::Pending => {
                changed.await;
            }
            BatchPoll::Exhausted | BatchPoll::Unsupported => self.leave_batch_mode(),
        }
    }

    fn leave_batch_mode(&mut self) {
        self.batch_mode = false;
        if let Some((key, _)) = self.current.take() {
            let found = self.inner.move_at(&key, Lookup::Eq);
            assert!(found, "last batch key vanished from the source");
        }
        tracing::debug!("batch mode disabled");
    }

    #[inline]
    pub fn current_key(&self) -> Option<&C::Key> {
        match &self.current {
            Some((key, _)) => Some(key),
            None => self.inner.current_key(),
        }
    }

    #[inline]
    pub fn current_value(&self) -> Option<&C::Value> {
        match &self.current {
            Some((_, value)) => Some(value),
            None => self.inner.current_value(),
        }
    }

    /// The wrapped cursor. Items still buffered are dropped.
    pub fn into_inner(self) -> AsyncCursor<C> {
        self.inner
    }
}

impl<C: Cursor> fmt::Debug for BatchCursor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCursor")
            .field("batch_mode", &self.batch_mode)
            .field("buffered", &self.buffer.len())
            .field("inner", &self.inner)
            .finish()
    }
}
