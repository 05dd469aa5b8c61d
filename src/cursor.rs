//! The synchronous cursor surface the async machinery drives.
//!
//! 异步机制所驱动的同步游标接口。

use crate::completer::AsyncCompleter;
use crate::error::{CursorError, SourceError};
use crate::signal::Changed;

/// Direction of a keyed lookup
///
/// 按键查找的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    /// Exactly the key
    Eq,
    /// Greatest key strictly below
    Lt,
    /// Greatest key at or below
    Le,
    /// Smallest key strictly above
    Gt,
    /// Smallest key at or above
    Ge,
}

/// Outcome of asking a source for its next pre-grouped batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPoll<K, V> {
    /// A non-empty batch following the last one handed out
    Ready(Vec<(K, V)>),
    /// No batch yet, but one may follow; wait on [`Cursor::updated`]
    Pending,
    /// No more batches will ever be produced
    Exhausted,
    /// The source has no batch concept
    Unsupported,
}

/// Single-reader, key-addressable iterator over a container
///
/// Implementations only need to be correct for one thread at a time; the
/// async wrappers guarantee exclusive access while they move the cursor.
///
/// 单读者、可按键寻址的容器迭代器。
pub trait Cursor: Send + 'static {
    type Key: Clone + Send + 'static;
    type Value: Send + 'static;

    /// Advance one element. `Ok(false)` means "nothing more right now" and
    /// must be safe to repeat.
    fn move_next(&mut self) -> Result<bool, SourceError>;

    fn move_at(&mut self, key: &Self::Key, lookup: Lookup) -> bool;

    fn move_first(&mut self) -> bool;

    fn move_last(&mut self) -> bool;

    fn move_previous(&mut self) -> bool;

    /// Valid right after a successful move
    fn current_key(&self) -> Option<&Self::Key>;

    fn current_value(&self) -> Option<&Self::Value>;

    /// `true` once the source will never produce more data
    fn is_completed(&self) -> bool;

    /// Push-notification registry of the source. `None` disables suspension:
    /// async moves resolve to `false` instead of waiting.
    fn completer(&self) -> Option<AsyncCompleter>;

    /// Edge-triggered change future of the source, if it has one
    fn updated(&self) -> Option<Changed>;

    /// Next pre-grouped batch, for sources that keep data in chunks
    fn next_batch(&mut self) -> BatchPoll<Self::Key, Self::Value> {
        BatchPoll::Unsupported
    }
}

/// One synchronous attempt as the async paths see it
///
/// `None` means the caller has to wait. A failed move on a completed
/// source gets one final attempt, so items published right before
/// completion are not lost.
pub(crate) fn try_move<C: Cursor>(cursor: &mut C) -> Option<Result<bool, CursorError>> {
    match cursor.move_next() {
        Ok(true) => Some(Ok(true)),
        Err(err) => Some(Err(err.into())),
        Ok(false) if cursor.is_completed() => Some(cursor.move_next().map_err(CursorError::from)),
        Ok(false) => None,
    }
}
