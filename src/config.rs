//! Configuration for cursors and container write locks.
//!
//! 游标与容器写锁的配置。

use std::fmt;
use std::sync::Arc;

use crate::metrics::{CursorMetrics, NoopMetrics};
use crate::scheduler::Scheduler;
use crate::version::{FaultOnTimeout, UnlockPolicy};

const DEFAULT_SPIN_LIMIT: u32 = 1 << 14;

/// Settings for an [`AsyncCursor`](crate::AsyncCursor)
///
/// [`AsyncCursor`](crate::AsyncCursor) 的设置
#[derive(Clone)]
pub struct CursorConfig {
    pub(crate) capture_context: bool,
    pub(crate) batch_mode: bool,
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
    pub(crate) metrics: Arc<dyn CursorMetrics>,
}

impl CursorConfig {
    pub fn new() -> Self {
        Self {
            capture_context: false,
            batch_mode: true,
            scheduler: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Resume continuations on the scheduler context that was current when
    /// they were registered, instead of inline on the completing worker.
    ///
    /// 在注册时的调度上下文上恢复 continuation，而不是在完成者线程上内联执行。
    pub fn capture_context(mut self, capture: bool) -> Self {
        self.capture_context = capture;
        self
    }

    /// Let a [`BatchCursor`](crate::BatchCursor) drain source batches before
    /// switching to single-item moves.
    pub fn batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    /// Worker used to run drive steps off the notifier's stack. Defaults to
    /// [`default_scheduler`](crate::scheduler::default_scheduler).
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn CursorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CursorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorConfig")
            .field("capture_context", &self.capture_context)
            .field("batch_mode", &self.batch_mode)
            .field("custom_scheduler", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

/// Settings for a [`VersionLock`](crate::VersionLock)
#[derive(Clone)]
pub struct LockConfig {
    pub(crate) spin_limit: u32,
    pub(crate) policy: Arc<dyn UnlockPolicy>,
}

impl LockConfig {
    pub fn new() -> Self {
        Self {
            spin_limit: DEFAULT_SPIN_LIMIT,
            policy: Arc::new(FaultOnTimeout),
        }
    }

    /// Failed acquisition attempts before the unlock policy is consulted.
    /// Clamped to at least 1.
    pub fn spin_limit(mut self, spins: u32) -> Self {
        self.spin_limit = spins.max(1);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn UnlockPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockConfig")
            .field("spin_limit", &self.spin_limit)
            .finish_non_exhaustive()
    }
}
