//! # series-sync
//!
//! Synchronization core for streaming time series: single-writer containers
//! that push change notifications to pull-based cursors.
//!
//! 流式时间序列的同步核心：单写者容器向拉取式游标推送变更通知。
//!
//! ## Overview / 概述
//!
//! A writer mutates a container under a [`VersionLock`]. On commit it fires
//! the container's [`ChangeSignal`] and every armed subscriber of its
//! [`AsyncCompleter`]. A cursor that could not move calls
//! `move_next_async`, which suspends until one of those notifications lets
//! a retry succeed, without polling and without missing a commit.
//!
//! 写者在 [`VersionLock`] 保护下修改容器。提交时触发容器的 [`ChangeSignal`]
//! 以及 [`AsyncCompleter`] 上所有已武装的订阅者。无法移动的游标调用
//! `move_next_async` 挂起，直到通知使重试成功，既不轮询也不会漏掉提交。
//!
//! ## Modules / 模块
//!
//! ### [`version`]
//!
//! Exclusive write lock plus a monotonically increasing version counter.
//! Readers never block on it.
//!
//! 独占写锁加单调递增的版本计数器，读者从不阻塞。
//!
//! ### [`signal`] and [`completer`]
//!
//! The two notification paths: an edge-triggered broadcast future with a
//! one-slot recycling pool, and a subscriber registry with
//! request-one-notification semantics.
//!
//! 两条通知路径：带单槽回收池的边沿触发广播 future，以及按次请求通知的订阅者注册表。
//!
//! ### [`async_cursor`]
//!
//! [`AsyncCursor`], the reusable zero-allocation completion source behind
//! `move_next_async`, with completion tokens, one continuation per move,
//! optional scheduler-context capture and cancellation as an error value.
//!
//! [`AsyncCursor`]：`move_next_async` 背后可复用的零分配完成源。
//!
//! ### [`batch`] and [`simple`]
//!
//! [`BatchCursor`] drains pre-grouped chunks before single-item moves.
//! [`SimpleCursor`] allocates a change future per wait and serves as a
//! plain reference implementation.
//!
//! ### [`series`]
//!
//! [`Series`], a small sorted container wired to all of the above.
//!
//! ## Example / 示例
//!
//! ```
//! use series_sync::{AsyncCursor, Series};
//!
//! # tokio_test::block_on(async {
//! let series = Series::<u32, &'static str>::new();
//! let mut cursor = AsyncCursor::new(series.cursor());
//!
//! let writer = series.clone();
//! tokio::spawn(async move {
//!     writer.append(1, "one").unwrap();
//!     writer.append(2, "two").unwrap();
//!     writer.complete().unwrap();
//! });
//!
//! let mut seen = Vec::new();
//! while cursor.move_next_async().await.unwrap() {
//!     seen.push(*cursor.current_value().unwrap());
//! }
//! assert_eq!(seen, ["one", "two"]);
//! # });
//! ```
//!
//! ## Usage faults / 使用错误
//!
//! A cursor is single-reader. Redeeming a stale token, registering a second
//! continuation for the same move, reading a pending result or completing a
//! move twice panics rather than returning an error.
//!
//! 游标是单读者的。使用过期令牌、为同一移动注册第二个 continuation、
//! 读取未完成的结果或重复完成都会直接 panic。

mod continuation;
mod shim;

pub mod async_cursor;
pub mod batch;
pub mod completer;
pub mod config;
pub mod container;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod series;
pub mod signal;
pub mod simple;
pub mod version;

pub use async_cursor::{AsyncCursor, MoveNext, MoveStart, MoveStatus, Token};
pub use batch::BatchCursor;
pub use completer::{AsyncCompleter, Subscriber, Subscription};
pub use config::{CursorConfig, LockConfig};
pub use container::{ContainerCore, WriteTxn};
pub use continuation::Continuation;
pub use cursor::{BatchPoll, Cursor, Lookup};
pub use error::{CursorError, LockError, SourceError};
pub use series::{AppendError, Series, SeriesCursor};
pub use signal::{ChangeSignal, Changed};
pub use simple::SimpleCursor;
pub use version::{UnlockPolicy, VersionLock};
