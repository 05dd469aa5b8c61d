//! Push-notification channel between a container and its cursors.
//!
//! 容器与其游标之间的推送通知通道。
//!
//! A cursor subscribes once, then arms one wake-up at a time with
//! [`Subscription::request_notification`]. When the container commits a
//! change, [`AsyncCompleter::notify`] calls [`Subscriber::try_complete`]
//! exactly once on every armed subscriber and disarms it. The registry is a
//! copy-on-write snapshot, so firing never takes a lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

/// Arm exactly one future wake-up
pub const REQUEST_ONE: i32 = 1;

/// Stay armed until acknowledged
pub const REQUEST_UNBOUNDED: i32 = i32::MAX;

/// Acknowledge a consumed wake-up and disarm
pub const ACKNOWLEDGE: i32 = -1;

// Outstanding notification requests
const DISARMED: u32 = 0;
const ARMED: u32 = 1;
const UNBOUNDED: u32 = u32::MAX;

/// Receiver of container notifications
///
/// 容器通知的接收者
pub trait Subscriber: Send + Sync + 'static {
    /// Called once per armed firing. `cancel` asks the subscriber to give up
    /// its pending operation with a cancellation error.
    fn try_complete(&self, cancel: bool);
}

struct Entry {
    id: u64,
    requested: AtomicU32,
    closed: AtomicBool,
    subscriber: Weak<dyn Subscriber>,
}

impl Entry {
    /// Consume one outstanding request, if any
    #[inline]
    fn take_request(&self) -> bool {
        // SeqCst pairs with the arming store: a subscriber that arms and then
        // re-checks its source either sees the data or gets this call
        let mut current = self.requested.load(Ordering::SeqCst);
        loop {
            match current {
                DISARMED => return false,
                UNBOUNDED => return true,
                _ => match self.requested.compare_exchange_weak(
                    current,
                    DISARMED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return true,
                    Err(actual) => current = actual,
                },
            }
        }
    }
}

struct Registry {
    entries: ArcSwap<Vec<Arc<Entry>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.entries.rcu(|entries| {
            entries
                .iter()
                .filter(|entry| entry.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

/// Per-container registry of subscribers
///
/// Cheap to clone; clones share the same registry.
///
/// 每个容器的订阅者注册表，克隆开销很小且共享同一注册表。
#[derive(Clone)]
pub struct AsyncCompleter {
    inner: Arc<Registry>,
}

impl AsyncCompleter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Registry {
                entries: ArcSwap::from_pointee(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber. It starts disarmed.
    ///
    /// 注册一个订阅者，初始为未武装状态。
    pub fn subscribe(&self, subscriber: Weak<dyn Subscriber>) -> Subscription {
        let entry = Arc::new(Entry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            requested: AtomicU32::new(DISARMED),
            closed: AtomicBool::new(false),
            subscriber,
        });
        self.inner.entries.rcu(|entries| {
            let mut next: Vec<Arc<Entry>> = entries.as_ref().clone();
            next.push(entry.clone());
            next
        });
        tracing::debug!(id = entry.id, "subscriber registered");
        Subscription {
            entry,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver one wake-up to every armed subscriber
    ///
    /// Returns how many subscribers were called.
    ///
    /// 向每个已武装的订阅者发送一次唤醒，返回被调用的订阅者数量。
    pub fn notify(&self) -> usize {
        let entries = self.inner.entries.load();
        let mut woken = 0;
        for entry in entries.iter() {
            if entry.closed.load(Ordering::Acquire) || !entry.take_request() {
                continue;
            }
            if let Some(subscriber) = entry.subscriber.upgrade() {
                subscriber.try_complete(false);
                woken += 1;
            }
        }
        woken
    }

    /// Ask every live subscriber to cancel its pending operation
    pub fn cancel_all(&self) {
        let entries = self.inner.entries.load();
        for entry in entries.iter() {
            if entry.closed.load(Ordering::Acquire) {
                continue;
            }
            if let Some(subscriber) = entry.subscriber.upgrade() {
                subscriber.try_complete(true);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.entries.load().len()
    }
}

impl Default for AsyncCompleter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncCompleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCompleter")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// One subscriber's registration. Unsubscribes on drop.
///
/// 单个订阅者的注册，drop 时取消订阅。
pub struct Subscription {
    entry: Arc<Entry>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Adjust outstanding notification requests
    ///
    /// - `1` ([`REQUEST_ONE`]): arm one wake-up
    /// - [`REQUEST_UNBOUNDED`]: stay armed across firings
    /// - `-1` ([`ACKNOWLEDGE`]) or any negative value: disarm a one-shot request
    /// - `0`: no-op
    ///
    /// 调整待处理的通知请求数量。
    pub fn request_notification(&self, n: i32) {
        if self.entry.closed.load(Ordering::Acquire) {
            return;
        }
        match n {
            0 => {}
            REQUEST_UNBOUNDED => self.entry.requested.store(UNBOUNDED, Ordering::SeqCst),
            n if n < 0 => {
                let _ = self.entry.requested.compare_exchange(
                    ARMED,
                    DISARMED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            _ => {
                let _ = self.entry.requested.compare_exchange(
                    DISARMED,
                    ARMED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.entry.requested.load(Ordering::Acquire) != DISARMED
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.entry.closed.load(Ordering::Acquire)
    }

    /// Deliver a cancellation to this subscriber, then unsubscribe
    pub fn cancel(&self) {
        if let Some(subscriber) = self.entry.subscriber.upgrade() {
            subscriber.try_complete(true);
        }
        self.close();
    }

    /// Unsubscribe. Idempotent.
    pub fn close(&self) {
        if self.entry.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.entry.requested.store(DISARMED, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.entry.id);
        }
        tracing::debug!(id = self.entry.id, "subscriber removed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("armed", &self.is_armed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        wakes: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl Subscriber for Counting {
        fn try_complete(&self, cancel: bool) {
            if cancel {
                self.cancels.fetch_add(1, Ordering::SeqCst);
            } else {
                self.wakes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn subscribe(completer: &AsyncCompleter) -> (Arc<Counting>, Subscription) {
        let subscriber = Arc::new(Counting::default());
        let weak: Weak<dyn Subscriber> = Arc::downgrade(&subscriber) as Weak<dyn Subscriber>;
        let subscription = completer.subscribe(weak);
        (subscriber, subscription)
    }

    #[test]
    fn test_disarmed_subscriber_is_not_called() {
        let completer = AsyncCompleter::new();
        let (subscriber, subscription) = subscribe(&completer);

        assert!(!subscription.is_armed());
        assert_eq!(completer.notify(), 0);
        assert_eq!(subscriber.wakes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_one_shot_request_fires_once() {
        let completer = AsyncCompleter::new();
        let (subscriber, subscription) = subscribe(&completer);

        subscription.request_notification(REQUEST_ONE);
        assert!(subscription.is_armed());
        assert_eq!(completer.notify(), 1);
        assert_eq!(completer.notify(), 0);
        assert_eq!(subscriber.wakes.load(Ordering::SeqCst), 1);

        subscription.request_notification(REQUEST_ONE);
        completer.notify();
        assert_eq!(subscriber.wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_acknowledge_disarms() {
        let completer = AsyncCompleter::new();
        let (subscriber, subscription) = subscribe(&completer);

        subscription.request_notification(REQUEST_ONE);
        subscription.request_notification(ACKNOWLEDGE);
        assert!(!subscription.is_armed());
        completer.notify();
        assert_eq!(subscriber.wakes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unbounded_stays_armed() {
        let completer = AsyncCompleter::new();
        let (subscriber, subscription) = subscribe(&completer);

        subscription.request_notification(REQUEST_UNBOUNDED);
        subscription.request_notification(ACKNOWLEDGE);
        for _ in 0..3 {
            completer.notify();
        }
        assert_eq!(subscriber.wakes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let completer = AsyncCompleter::new();
        let (_subscriber, subscription) = subscribe(&completer);
        let (_other, _keep) = subscribe(&completer);
        assert_eq!(completer.subscriber_count(), 2);

        drop(subscription);
        assert_eq!(completer.subscriber_count(), 1);
    }

    #[test]
    fn test_dead_subscriber_is_skipped() {
        let completer = AsyncCompleter::new();
        let (subscriber, subscription) = subscribe(&completer);
        subscription.request_notification(REQUEST_ONE);
        drop(subscriber);

        assert_eq!(completer.notify(), 0);
    }

    #[test]
    fn test_cancel_reaches_subscriber_and_closes() {
        let completer = AsyncCompleter::new();
        let (subscriber, subscription) = subscribe(&completer);

        subscription.cancel();
        assert_eq!(subscriber.cancels.load(Ordering::SeqCst), 1);
        assert!(subscription.is_closed());
        assert_eq!(completer.subscriber_count(), 0);

        subscription.request_notification(REQUEST_ONE);
        assert!(!subscription.is_armed());
    }

    #[test]
    fn test_cancel_all() {
        let completer = AsyncCompleter::new();
        let (a, _sa) = subscribe(&completer);
        let (b, _sb) = subscribe(&completer);

        completer.cancel_all();
        assert_eq!(a.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(b.cancels.load(Ordering::SeqCst), 1);
    }
}
