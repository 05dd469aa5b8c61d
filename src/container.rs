//! Write-side glue a mutable container embeds.
//!
//! 可变容器内嵌的写入端组件。
//!
//! [`ContainerCore`] bundles the version lock, the change signal and the
//! subscriber registry, and fires both notification paths from inside the
//! lock right after a commit is published.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::completer::AsyncCompleter;
use crate::config::LockConfig;
use crate::error::LockError;
use crate::signal::{ChangeSignal, Changed};
use crate::version::VersionLock;

/// Synchronization state shared by a container and its cursors
///
/// 容器及其游标共享的同步状态
pub struct ContainerCore {
    lock: VersionLock,
    signal: ChangeSignal,
    completer: AsyncCompleter,
    completed: AtomicBool,
}

impl ContainerCore {
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            lock: VersionLock::with_config(config),
            signal: ChangeSignal::new(),
            completer: AsyncCompleter::new(),
            completed: AtomicBool::new(false),
        }
    }

    /// See [`VersionLock::begin_write`]
    #[inline]
    pub fn begin_write(&self, take_lock: bool) -> Result<i64, LockError> {
        self.lock.begin_write(take_lock)
    }

    /// Release the write lock. On commit, the change signal and every armed
    /// subscriber are fired before the lock flag is cleared.
    ///
    /// 释放写锁。提交时在清除锁标志之前触发变更信号和所有已武装的订阅者。
    pub fn end_write(&self, saved: i64, committed: bool) -> bool {
        self.lock.end_write_with(saved, committed, || {
            self.signal.notify(true);
            self.completer.notify();
        })
    }

    /// Open a write transaction. It aborts unless committed.
    ///
    /// 开启写事务，未提交时自动中止。
    pub fn write(&self) -> Result<WriteTxn<'_>, LockError> {
        let saved = self.begin_write(true)?;
        Ok(WriteTxn {
            core: self,
            saved,
            finished: false,
        })
    }

    /// Mark the container as permanently complete
    ///
    /// Wakes every waiter so it can observe the end of data. Returns `false`
    /// if the container was already complete.
    ///
    /// 将容器标记为永久完成并唤醒所有等待者。若已完成则返回 `false`。
    pub fn complete(&self) -> Result<bool, LockError> {
        let saved = self.lock.begin_write(true)?;
        let first = !self.completed.swap(true, Ordering::SeqCst);
        self.lock.end_write_with(saved, first, || {
            self.signal.notify(false);
            self.completer.notify();
        });
        if first {
            tracing::debug!(version = self.lock.version(), "container completed");
        }
        Ok(first)
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Edge-triggered future for the next committed change
    #[inline]
    pub fn updated(&self) -> Changed {
        self.signal.changed()
    }

    #[inline]
    pub fn completer(&self) -> &AsyncCompleter {
        &self.completer
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.lock.version()
    }

    #[inline]
    pub fn lock(&self) -> &VersionLock {
        &self.lock
    }
}

impl Default for ContainerCore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContainerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerCore")
            .field("lock", &self.lock)
            .field("completed", &self.is_completed())
            .field("subscribers", &self.completer.subscriber_count())
            .finish()
    }
}

/// Scoped write access to a [`ContainerCore`]
///
/// 对 [`ContainerCore`] 的作用域写访问
#[must_use = "dropping a write transaction aborts it"]
pub struct WriteTxn<'a> {
    core: &'a ContainerCore,
    saved: i64,
    finished: bool,
}

impl WriteTxn<'_> {
    /// Version the transaction will publish on commit
    #[inline]
    pub fn next_version(&self) -> u64 {
        self.core.lock.next_version()
    }

    /// Publish the change and notify readers
    pub fn commit(mut self) {
        self.finished = true;
        self.core.end_write(self.saved, true);
    }

    /// Release the lock without bumping the version
    pub fn abort(mut self) {
        self.finished = true;
        self.core.end_write(self.saved, false);
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.core.end_write(self.saved, false);
        }
    }
}

impl fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTxn")
            .field("saved", &self.saved)
            .finish_non_exhaustive()
    }
}
