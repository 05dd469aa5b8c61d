//! Cursor telemetry behind a narrow, injectable interface.
//!
//! 通过可注入的窄接口收集游标遥测数据。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Events a cursor reports while moving
///
/// 游标移动过程中上报的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorEvent {
    /// A move resolved on the synchronous fast path
    SyncMove,
    /// A move had to suspend and wait for a notification
    AsyncMove,
    /// The cursor subscribed to its source's completer
    Subscribe,
    /// A notification arrived while another party owned the cursor
    SkippedUpdate,
    /// A drive step ran on a worker
    Drive,
    /// A pending move was completed
    Completion,
    /// A pending move was cancelled
    Canceled,
}

impl CursorEvent {
    const COUNT: usize = 7;

    #[inline]
    const fn index(self) -> usize {
        match self {
            CursorEvent::SyncMove => 0,
            CursorEvent::AsyncMove => 1,
            CursorEvent::Subscribe => 2,
            CursorEvent::SkippedUpdate => 3,
            CursorEvent::Drive => 4,
            CursorEvent::Completion => 5,
            CursorEvent::Canceled => 6,
        }
    }
}

/// Sink for [`CursorEvent`]s. Called on hot paths; keep it cheap.
pub trait CursorMetrics: Send + Sync {
    fn record(&self, event: CursorEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl CursorMetrics for NoopMetrics {
    #[inline]
    fn record(&self, _event: CursorEvent) {}
}

/// Relaxed atomic counter per event kind
///
/// 每种事件一个 Relaxed 原子计数器
#[derive(Default)]
pub struct CounterMetrics {
    counters: [AtomicU64; CursorEvent::COUNT],
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, event: CursorEvent) -> u64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sync_moves: self.get(CursorEvent::SyncMove),
            async_moves: self.get(CursorEvent::AsyncMove),
            subscriptions: self.get(CursorEvent::Subscribe),
            skipped_updates: self.get(CursorEvent::SkippedUpdate),
            drives: self.get(CursorEvent::Drive),
            completions: self.get(CursorEvent::Completion),
            cancellations: self.get(CursorEvent::Canceled),
        }
    }
}

impl CursorMetrics for CounterMetrics {
    #[inline]
    fn record(&self, event: CursorEvent) {
        self.counters[event.index()].fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for CounterMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Point-in-time copy of a [`CounterMetrics`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sync_moves: u64,
    pub async_moves: u64,
    pub subscriptions: u64,
    pub skipped_updates: u64,
    pub drives: u64,
    pub completions: u64,
    pub cancellations: u64,
}
