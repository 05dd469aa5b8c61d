//! Write-version protocol for a mutable container.
//!
//! 容器写入版本协议。
//!
//! A single writer at a time takes an exclusive spin lock, bumps
//! `next_version`, mutates, and on unlock either publishes `version + 1`
//! (commit) or rolls `next_version` back (abort). Readers never touch the lock
//! flag: they read `version` with acquire ordering and never block a writer.
//!
//! Invariant: `next_version == version` while unlocked and
//! `next_version == version + 1` while a writer holds the lock.

use std::fmt;

use crate::config::LockConfig;
use crate::error::LockError;
use crate::shim::atomic::{AtomicU32, AtomicU64, Ordering};
use crate::shim::Backoff;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Saved version returned by [`VersionLock::begin_write`] when the caller
/// already holds the lock. Passing it to `end_write` is a no-op.
pub const NOT_LOCKED: i64 = -1;

/// Decision taken by an [`UnlockPolicy`] once the spin budget is exhausted
///
/// 自旋预算耗尽后 [`UnlockPolicy`] 做出的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Spin for another round
    ///
    /// 再自旋一轮
    Retry,

    /// Give up and report [`LockError::Timeout`]
    ///
    /// 放弃并返回 [`LockError::Timeout`]
    Fault,
}

/// Container-specific deadlock breaker called when a writer cannot acquire
/// the lock within its spin budget.
///
/// A policy that detects a truly stuck writer may call
/// [`VersionLock::force_unlock`] and return [`Escalation::Retry`].
pub trait UnlockPolicy: Send + Sync {
    fn try_unlock(&self, lock: &VersionLock) -> Escalation;
}

/// Default policy: spinning past the budget is unsupported and faults.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaultOnTimeout;

impl UnlockPolicy for FaultOnTimeout {
    #[inline]
    fn try_unlock(&self, _lock: &VersionLock) -> Escalation {
        Escalation::Fault
    }
}

/// Exclusive write lock guarding a monotonically increasing version counter
///
/// 保护单调递增版本计数器的独占写锁
pub struct VersionLock {
    version: AtomicU64,
    next_version: AtomicU64,
    locked: AtomicU32,
    config: LockConfig,
}

impl VersionLock {
    /// Create an unlocked lock at version 0
    ///
    /// 创建版本为 0 的未加锁写锁
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            version: AtomicU64::new(0),
            next_version: AtomicU64::new(0),
            locked: AtomicU32::new(UNLOCKED),
            config,
        }
    }

    /// Last fully committed version
    ///
    /// 最后一次完整提交的版本
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Version claimed by the in-progress writer, equal to `version()` when
    /// unlocked
    #[inline]
    pub fn next_version(&self) -> u64 {
        self.next_version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire) == LOCKED
    }

    /// Acquire the write lock and claim the next version
    ///
    /// Returns the version to restore on abort, or [`NOT_LOCKED`] without
    /// touching anything when `take_lock` is false (the caller already holds
    /// the lock, e.g. a nested helper).
    ///
    /// 获取写锁并占用下一个版本号。返回中止时需要恢复的版本；
    /// 如果 `take_lock` 为 false，直接返回 [`NOT_LOCKED`]。
    ///
    /// # Errors
    /// [`LockError::Timeout`] when the spin budget is exhausted and the
    /// configured [`UnlockPolicy`] returns [`Escalation::Fault`].
    pub fn begin_write(&self, take_lock: bool) -> Result<i64, LockError> {
        if !take_lock {
            return Ok(NOT_LOCKED);
        }

        let mut backoff = Backoff::new();
        let mut spins = 0u32;
        loop {
            if self
                .locked
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Only the lock holder writes `version`, Relaxed is enough here
                let saved = self.version.load(Ordering::Relaxed);
                self.next_version.store(saved + 1, Ordering::Release);
                return Ok(saved as i64);
            }

            spins += 1;
            if spins >= self.config.spin_limit {
                tracing::warn!(spins, version = self.version(), "write lock spin budget exhausted");
                match self.config.policy.try_unlock(self) {
                    Escalation::Retry => {
                        spins = 0;
                        backoff.reset();
                        continue;
                    }
                    Escalation::Fault => {
                        return Err(LockError::Timeout {
                            spins,
                            version: self.version(),
                        });
                    }
                }
            }
            backoff.snooze();
        }
    }

    /// Release the write lock, publishing a new version if `committed`
    ///
    /// Returns whether the version advanced.
    ///
    /// 释放写锁，如果 `committed` 则发布新版本。返回版本是否前进。
    #[inline]
    pub fn end_write(&self, saved: i64, committed: bool) -> bool {
        self.end_write_with(saved, committed, || {})
    }

    /// Like [`end_write`](Self::end_write), running `on_commit` after the new
    /// version is visible and before the lock flag is released.
    pub fn end_write_with<F>(&self, saved: i64, committed: bool, on_commit: F) -> bool
    where
        F: FnOnce(),
    {
        if saved < 0 {
            return false;
        }
        let saved = saved as u64;
        if committed {
            self.version.store(saved + 1, Ordering::Release);
            on_commit();
        } else {
            self.next_version.store(saved, Ordering::Release);
        }
        // Lock flag goes last so nobody sees it free before the data is published
        self.locked.store(UNLOCKED, Ordering::Release);
        committed
    }

    /// Forcibly release a lock held by a stuck writer, discarding its claimed
    /// version. Meant for [`UnlockPolicy`] implementations.
    pub fn force_unlock(&self) {
        let version = self.version.load(Ordering::Acquire);
        self.next_version.store(version, Ordering::Release);
        self.locked.store(UNLOCKED, Ordering::Release);
        tracing::debug!(version, "write lock forcibly released");
    }
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VersionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionLock")
            .field("version", &self.version())
            .field("next_version", &self.next_version())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_commit_advances_version() {
        let lock = VersionLock::new();
        let saved = lock.begin_write(true).unwrap();
        assert_eq!(saved, 0);
        assert!(lock.is_locked());
        assert_eq!(lock.next_version(), 1);
        assert_eq!(lock.version(), 0);

        assert!(lock.end_write(saved, true));
        assert!(!lock.is_locked());
        assert_eq!(lock.version(), 1);
        assert_eq!(lock.next_version(), 1);
    }

    #[test]
    fn test_abort_keeps_version() {
        let lock = VersionLock::new();
        let saved = lock.begin_write(true).unwrap();
        assert!(!lock.end_write(saved, false));
        assert_eq!(lock.version(), 0);
        assert_eq!(lock.next_version(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_nested_write_is_noop() {
        let lock = VersionLock::new();
        let outer = lock.begin_write(true).unwrap();
        let inner = lock.begin_write(false).unwrap();
        assert_eq!(inner, NOT_LOCKED);
        assert!(!lock.end_write(inner, true));
        assert!(lock.is_locked());
        lock.end_write(outer, true);
        assert_eq!(lock.version(), 1);
    }

    #[test]
    fn test_on_commit_runs_while_locked() {
        let lock = VersionLock::new();
        let saved = lock.begin_write(true).unwrap();
        let mut seen = None;
        lock.end_write_with(saved, true, || {
            seen = Some((lock.version(), lock.is_locked()));
        });
        assert_eq!(seen, Some((1, true)));
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_default_policy_faults() {
        let lock = VersionLock::with_config(LockConfig::default().spin_limit(4));
        let saved = lock.begin_write(true).unwrap();

        let err = lock.begin_write(true).unwrap_err();
        assert_eq!(err, LockError::Timeout { spins: 4, version: 0 });

        lock.end_write(saved, true);
        assert_eq!(lock.begin_write(true).unwrap(), 1);
    }

    struct BreakStuck {
        calls: AtomicUsize,
    }

    impl UnlockPolicy for BreakStuck {
        fn try_unlock(&self, lock: &VersionLock) -> Escalation {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            lock.force_unlock();
            Escalation::Retry
        }
    }

    #[test]
    fn test_policy_can_break_stuck_writer() {
        let policy = Arc::new(BreakStuck {
            calls: AtomicUsize::new(0),
        });
        let lock = VersionLock::with_config(LockConfig::default().spin_limit(2).policy(policy.clone()));

        let _stuck = lock.begin_write(true).unwrap();
        assert_eq!(lock.next_version(), 1);

        let saved = lock.begin_write(true).unwrap();
        assert_eq!(saved, 0);
        assert_eq!(policy.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        lock.end_write(saved, true);
        assert_eq!(lock.version(), 1);
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let lock = Arc::new(VersionLock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let saved = lock.begin_write(true).unwrap();
                    assert_eq!(lock.next_version(), saved as u64 + 1);
                    lock.end_write(saved, true);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.version(), 4_000);
    }

    #[test]
    fn test_reader_sees_monotonic_versions() {
        let lock = Arc::new(VersionLock::new());
        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                for i in 0..2_000 {
                    let saved = lock.begin_write(true).unwrap();
                    lock.end_write(saved, i % 3 != 0);
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let now = lock.version();
            assert!(now >= last);
            last = now;
        }
        writer.join().unwrap();
        assert!(lock.version() >= last);
    }

    proptest::proptest! {
        #[test]
        fn prop_version_counts_commits(commits in proptest::collection::vec(proptest::bool::ANY, 0..64)) {
            let lock = VersionLock::new();
            let mut last = lock.version();
            for committed in &commits {
                let saved = lock.begin_write(true).unwrap();
                proptest::prop_assert_eq!(saved as u64, last);
                lock.end_write(saved, *committed);

                let now = lock.version();
                proptest::prop_assert!(now >= last);
                proptest::prop_assert_eq!(now - last, u64::from(*committed));
                proptest::prop_assert_eq!(lock.next_version(), now);
                last = now;
            }
            let expected = commits.iter().filter(|c| **c).count() as u64;
            proptest::prop_assert_eq!(lock.version(), expected);
        }
    }
}
