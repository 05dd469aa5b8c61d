//! Minimal sorted series used as the concrete container.
//!
//! 作为具体容器使用的最小有序序列。
//!
//! Appends and in-place updates go through the container write protocol, so
//! every commit bumps the version and wakes waiting cursors. Cursors are
//! positioned by key, which keeps them valid across appends.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::completer::AsyncCompleter;
use crate::config::LockConfig;
use crate::container::ContainerCore;
use crate::cursor::{BatchPoll, Cursor, Lookup};
use crate::error::{LockError, SourceError};
use crate::signal::Changed;

/// Failure of a series mutation
///
/// 序列修改失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendError {
    /// The key is not greater than the last key
    OutOfOrder,
    /// The series no longer accepts data
    Completed,
    /// The write lock could not be taken
    Lock(LockError),
}

impl fmt::Display for AppendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendError::OutOfOrder => write!(f, "key is not greater than the last key"),
            AppendError::Completed => write!(f, "series is completed"),
            AppendError::Lock(err) => write!(f, "series write failed: {}", err),
        }
    }
}

impl std::error::Error for AppendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppendError::Lock(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LockError> for AppendError {
    fn from(err: LockError) -> Self {
        AppendError::Lock(err)
    }
}

struct Inner<K, V> {
    core: ContainerCore,
    data: RwLock<Vec<(K, V)>>,
}

impl<K, V> Inner<K, V> {
    fn read(&self) -> RwLockReadGuard<'_, Vec<(K, V)>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(K, V)>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Append-only, key-sorted series with in-place updates
///
/// Clones share the same data.
///
/// 仅追加、按键排序、支持原地更新的序列，克隆共享同一份数据。
pub struct Series<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Series<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Series<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: ContainerCore::with_config(config),
                data: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Add an item after the last one
    ///
    /// 在末尾追加一项
    pub fn append(&self, key: K, value: V) -> Result<(), AppendError> {
        let txn = self.inner.core.write()?;
        if self.inner.core.is_completed() {
            return Err(AppendError::Completed);
        }
        {
            let mut data = self.inner.write();
            if data.last().is_some_and(|(last, _)| key <= *last) {
                return Err(AppendError::OutOfOrder);
            }
            data.push((key, value));
        }
        txn.commit();
        Ok(())
    }

    /// Update the value at `key`, or append it past the last key
    ///
    /// Returns `false`, without a version bump, when the value is unchanged.
    ///
    /// 更新 `key` 对应的值，或在末尾追加；值未变化时返回 `false` 且不增加版本。
    pub fn set(&self, key: K, value: V) -> Result<bool, AppendError> {
        let txn = self.inner.core.write()?;
        if self.inner.core.is_completed() {
            return Err(AppendError::Completed);
        }
        {
            let mut data = self.inner.write();
            match data.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(index) if data[index].1 == value => {
                    txn.abort();
                    return Ok(false);
                }
                Ok(index) => data[index].1 = value,
                Err(index) if index == data.len() => data.push((key, value)),
                Err(_) => return Err(AppendError::OutOfOrder),
            }
        }
        txn.commit();
        Ok(true)
    }

    /// Stop accepting data and let waiting cursors observe the end
    pub fn complete(&self) -> Result<bool, LockError> {
        self.inner.core.complete()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.inner.core.is_completed()
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.core.version()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn completer(&self) -> &AsyncCompleter {
        self.inner.core.completer()
    }

    #[inline]
    pub fn updated(&self) -> Changed {
        self.inner.core.updated()
    }

    /// Cursor before the first item, without batch support
    pub fn cursor(&self) -> SeriesCursor<K, V> {
        self.cursor_with_batches(0)
    }

    /// Cursor that hands out batches of up to `batch_size` items
    pub fn cursor_with_batches(&self, batch_size: usize) -> SeriesCursor<K, V> {
        SeriesCursor {
            series: self.clone(),
            current: None,
            batch_size,
            batch_end: None,
        }
    }
}

impl<K, V> Default for Series<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for Series<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Series")
            .field("len", &self.inner.read().len())
            .field("core", &self.inner.core)
            .finish()
    }
}

/// Key-positioned cursor over a [`Series`]
///
/// [`Series`] 上按键定位的游标
pub struct SeriesCursor<K, V> {
    series: Series<K, V>,
    current: Option<(K, V)>,
    batch_size: usize,
    batch_end: Option<K>,
}

impl<K, V> SeriesCursor<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn land(&mut self, data: &[(K, V)], index: Option<usize>) -> bool {
        match index.and_then(|i| data.get(i)) {
            Some(item) => {
                self.current = Some(item.clone());
                true
            }
            None => false,
        }
    }

    /// Index of the first item after `key`
    #[inline]
    fn after(data: &[(K, V)], key: &K) -> usize {
        data.partition_point(|(k, _)| k <= key)
    }
}

impl<K, V> Cursor for SeriesCursor<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    type Key = K;
    type Value = V;

    fn move_next(&mut self) -> Result<bool, SourceError> {
        let series = self.series.inner.clone();
        let data = series.read();
        let index = match &self.current {
            Some((key, _)) => Self::after(&data, key),
            None => 0,
        };
        Ok(self.land(&data, Some(index)))
    }

    fn move_at(&mut self, key: &K, lookup: Lookup) -> bool {
        let series = self.series.inner.clone();
        let data = series.read();
        let index = match lookup {
            Lookup::Eq => data.binary_search_by(|(k, _)| k.cmp(key)).ok(),
            Lookup::Lt => data.partition_point(|(k, _)| k < key).checked_sub(1),
            Lookup::Le => Self::after(&data, key).checked_sub(1),
            Lookup::Gt => Some(Self::after(&data, key)),
            Lookup::Ge => Some(data.partition_point(|(k, _)| k < key)),
        };
        self.land(&data, index)
    }

    fn move_first(&mut self) -> bool {
        let series = self.series.inner.clone();
        let data = series.read();
        self.land(&data, Some(0))
    }

    fn move_last(&mut self) -> bool {
        let series = self.series.inner.clone();
        let data = series.read();
        self.land(&data, data.len().checked_sub(1))
    }

    fn move_previous(&mut self) -> bool {
        let Some((key, _)) = &self.current else {
            return self.move_last();
        };
        let series = self.series.inner.clone();
        let data = series.read();
        let index = data.partition_point(|(k, _)| k < key).checked_sub(1);
        self.land(&data, index)
    }

    fn current_key(&self) -> Option<&K> {
        self.current.as_ref().map(|(key, _)| key)
    }

    fn current_value(&self) -> Option<&V> {
        self.current.as_ref().map(|(_, value)| value)
    }

    fn is_completed(&self) -> bool {
        self.series.is_completed()
    }

    fn completer(&self) -> Option<AsyncCompleter> {
        Some(self.series.completer().clone())
    }

    fn updated(&self) -> Option<Changed> {
        Some(self.series.updated())
    }

    /// Chunks of stored history after the current position. Live data past
    /// the last chunk is left to single-item moves.
    fn next_batch(&mut self) -> BatchPoll<K, V> {
        if self.batch_size == 0 {
            return BatchPoll::Unsupported;
        }
        let data = self.series.inner.read();
        let start = match self.batch_end.as_ref().or(self.current.as_ref().map(|(k, _)| k)) {
            Some(key) => Self::after(&data, key),
            None => 0,
        };
        let end = (start + self.batch_size).min(data.len());
        if start >= end {
            return BatchPoll::Exhausted;
        }
        let batch = data[start..end].to_vec();
        drop(data);
        self.batch_end = batch.last().map(|(k, _)| k.clone());
        BatchPoll::Ready(batch)
    }
}

impl<K: Clone, V: Clone> Clone for SeriesCursor<K, V> {
    fn clone(&self) -> Self {
        Self {
            series: self.series.clone(),
            current: self.current.clone(),
            batch_size: self.batch_size,
            batch_end: self.batch_end.clone(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SeriesCursor<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesCursor")
            .field("current", &self.current)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn filled(n: u32) -> Series<u32, u32> {
        let series = Series::new();
        for i in 0..n {
            series.append(i * 2, i).unwrap();
        }
        series
    }

    #[test]
    fn test_append_rules() {
        let series = filled(2);
        assert_eq!(series.version(), 2);
        assert_eq!(series.append(2, 9), Err(AppendError::OutOfOrder));
        assert_eq!(series.version(), 2);

        series.complete().unwrap();
        assert_eq!(series.append(10, 9), Err(AppendError::Completed));
    }

    #[test]
    fn test_unchanged_set_does_not_bump_version() {
        let series = filled(2);
        assert!(!series.set(2, 1).unwrap());
        assert_eq!(series.version(), 2);

        assert!(series.set(2, 5).unwrap());
        assert_eq!(series.version(), 3);
        assert!(series.set(4, 6).unwrap());
        assert_eq!(series.len(), 3);
        assert_eq!(series.set(1, 0), Err(AppendError::OutOfOrder));
    }

    #[test]
    fn test_positional_moves() {
        let series = filled(4); // keys 0 2 4 6
        let mut cursor = series.cursor();

        assert!(cursor.move_at(&3, Lookup::Ge));
        assert_eq!(cursor.current_key(), Some(&4));
        assert!(cursor.move_at(&3, Lookup::Le));
        assert_eq!(cursor.current_key(), Some(&2));
        assert!(!cursor.move_at(&3, Lookup::Eq));
        assert!(cursor.move_at(&6, Lookup::Lt));
        assert_eq!(cursor.current_key(), Some(&4));
        assert!(!cursor.move_at(&6, Lookup::Gt));

        assert!(cursor.move_last());
        assert!(cursor.move_previous());
        assert_eq!(cursor.current_key(), Some(&4));
        assert!(cursor.move_first());
        assert!(!cursor.move_previous());
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_key(), Some(&2));
    }

    #[test]
    fn test_cursor_sees_appends() {
        let series = filled(1);
        let mut cursor = series.cursor();
        assert!(cursor.move_next().unwrap());
        assert!(!cursor.move_next().unwrap());

        series.append(100, 7).unwrap();
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_value(), Some(&7));
    }

    #[test]
    fn test_batches_follow_each_other() {
        let series = filled(5);
        let mut cursor = series.cursor_with_batches(2);

        let BatchPoll::Ready(first) = cursor.next_batch() else {
            panic!("expected a batch");
        };
        assert_eq!(first, vec![(0, 0), (2, 1)]);
        let BatchPoll::Ready(second) = cursor.next_batch() else {
            panic!("expected a batch");
        };
        assert_eq!(second, vec![(4, 2), (6, 3)]);
        assert_eq!(cursor.next_batch(), BatchPoll::Ready(vec![(8, 4)]));
        assert_eq!(cursor.next_batch(), BatchPoll::Exhausted);

        assert_eq!(series.cursor().next_batch(), BatchPoll::Unsupported);
    }
}
