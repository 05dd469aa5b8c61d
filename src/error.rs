//! Error types shared across the crate.
//!
//! 跨模块共享的错误类型。
//!
//! Only recoverable outcomes are represented here. Misuse of the single-reader
//! cursor contract (stale tokens, double continuations, reading a pending
//! result, completing twice) panics instead.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Fault raised by an underlying synchronous move.
///
/// Cloneable so it can sit in a cursor's reusable result slot and be handed
/// out more than once. The original error is kept for diagnostics.
///
/// 底层同步移动抛出的错误，可克隆，保留原始错误用于诊断。
#[derive(Clone)]
pub struct SourceError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl SourceError {
    /// Wrap an arbitrary error.
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self { inner: Arc::new(err) }
    }

    /// Build a source error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// The wrapped error.
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}

impl fmt::Debug for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceError").field(&self.inner).finish()
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for SourceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.inner)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

/// Error delivered through an asynchronous move's result channel
///
/// 异步移动结果中携带的错误
#[derive(Debug, Clone)]
pub enum CursorError {
    /// The move was cancelled before data arrived
    ///
    /// 在数据到达之前移动被取消
    Canceled,

    /// The underlying cursor faulted while moving
    ///
    /// 底层游标在移动时出错
    Source(SourceError),
}

impl CursorError {
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, CursorError::Canceled)
    }

    #[inline]
    pub fn is_source(&self) -> bool {
        matches!(self, CursorError::Source(_))
    }
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorError::Canceled => write!(f, "cursor move canceled"),
            CursorError::Source(err) => write!(f, "cursor source faulted: {}", err),
        }
    }
}

impl StdError for CursorError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CursorError::Canceled => None,
            CursorError::Source(err) => Some(err),
        }
    }
}

impl From<SourceError> for CursorError {
    fn from(err: SourceError) -> Self {
        CursorError::Source(err)
    }
}

/// Error returned when the write lock cannot be acquired
///
/// 无法获取写锁时返回的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The unlock policy gave up after the spin budget was exhausted
    ///
    /// 自旋次数耗尽后解锁策略放弃
    Timeout {
        /// Failed acquisition attempts in the last spin round.
        spins: u32,
        /// Committed version observed when giving up.
        version: u64,
    },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Timeout { spins, version } => write!(
                f,
                "write lock still held after {} spins (committed version {})",
                spins, version
            ),
        }
    }
}

impl StdError for LockError {}
