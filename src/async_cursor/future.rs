//! Future and stream adapters over the token-level move API.
//!
//! 基于令牌级移动 API 的 Future 与 Stream 适配器。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::Stream;

use crate::cursor::Cursor;
use crate::error::CursorError;

use super::{AsyncCursor, MoveStart, Token};

enum State {
    Ready(Result<bool, CursorError>),
    Pending(Token),
    Done,
}

/// Future returned by [`AsyncCursor::move_next_async`]
///
/// Dropping it before it resolves cancels the move.
///
/// [`AsyncCursor::move_next_async`] 返回的 Future，在完成前 drop 会取消该移动。
#[must_use = "futures do nothing unless polled"]
pub struct MoveNext<'a, C: Cursor> {
    cursor: &'a mut AsyncCursor<C>,
    state: State,
}

impl<'a, C: Cursor> MoveNext<'a, C> {
    pub(super) fn new(cursor: &'a mut AsyncCursor<C>, start: MoveStart) -> Self {
        let state = match start {
            MoveStart::Ready(result) => State::Ready(result),
            MoveStart::Pending(token) => State::Pending(token),
        };
        Self { cursor, state }
    }

    /// Token of the suspended move, `None` if it resolved synchronously
    #[inline]
    pub fn token(&self) -> Option<Token> {
        match self.state {
            State::Pending(token) => Some(token),
            _ => None,
        }
    }
}

impl<C: Cursor> Future for MoveNext<'_, C> {
    type Output = Result<bool, CursorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, State::Done) {
            State::Ready(result) => Poll::Ready(result),
            State::Pending(token) => match this.cursor.poll_step(cx) {
                Poll::Ready(result) => Poll::Ready(result),
                Poll::Pending => {
                    this.state = State::Pending(token);
                    Poll::Pending
                }
            },
            State::Done => panic!("MoveNext polled after completion"),
        }
    }
}

impl<C: Cursor> Drop for MoveNext<'_, C> {
    fn drop(&mut self) {
        if let State::Pending(_) = self.state {
            self.cursor.abandon();
        }
    }
}

impl<C: Cursor> fmt::Debug for MoveNext<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoveNext")
            .field("token", &self.token())
            .finish_non_exhaustive()
    }
}

/// Yields `(key, value)` pairs until the source completes
///
/// 逐个产出 `(key, value)`，直到数据源完成
impl<C> Stream for AsyncCursor<C>
where
    C: Cursor,
    C::Value: Clone,
{
    type Item = Result<(C::Key, C::Value), CursorError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(this.poll_step(cx)) {
            Ok(true) => {
                let cursor = this.get_ref();
                Poll::Ready(cursor.current_key().cloned().zip(cursor.current_value().cloned()).map(Ok))
            }
            Ok(false) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}
