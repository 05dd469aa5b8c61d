#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;
use series_sync::scheduler::{Scheduler, Task};
use series_sync::{
    AsyncCompleter, AsyncCursor, Changed, Continuation, Cursor, CursorConfig, Lookup, MoveStart,
    MoveStatus, SourceError,
};

// Drives run on the notifier's or the consumer's own thread
struct Inline;

impl Scheduler for Inline {
    fn schedule(self: std::sync::Arc<Self>, task: Task) {
        task();
    }
}

// One item, visible once `ready` is set
struct Gate {
    ready: Arc<AtomicBool>,
    completer: AsyncCompleter,
    pos: Option<u8>,
}

impl Cursor for Gate {
    type Key = u8;
    type Value = u8;

    fn move_next(&mut self) -> Result<bool, SourceError> {
        if self.ready.swap(false, Ordering::SeqCst) {
            self.pos = Some(1);
            Ok(true)
        } else {
            Ok(false)
        }
    }
    fn move_at(&mut self, _key: &u8, _lookup: Lookup) -> bool {
        false
    }
    fn move_first(&mut self) -> bool {
        false
    }
    fn move_last(&mut self) -> bool {
        false
    }
    fn move_previous(&mut self) -> bool {
        false
    }
    fn current_key(&self) -> Option<&u8> {
        self.pos.as_ref()
    }
    fn current_value(&self) -> Option<&u8> {
        self.pos.as_ref()
    }
    fn is_completed(&self) -> bool {
        false
    }
    fn completer(&self) -> Option<AsyncCompleter> {
        Some(self.completer.clone())
    }
    fn updated(&self) -> Option<Changed> {
        None
    }
}

fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    let mut builder = loom::model::Builder::new();
    builder.preemption_bound = Some(3);
    builder.check(f);
}

fn pending_gate() -> (AsyncCursor<Gate>, Arc<AtomicBool>, AsyncCompleter) {
    let ready = Arc::new(AtomicBool::new(false));
    let completer = AsyncCompleter::new();
    let cursor = AsyncCursor::with_config(
        Gate {
            ready: ready.clone(),
            completer: completer.clone(),
            pos: None,
        },
        CursorConfig::new().scheduler(std::sync::Arc::new(Inline)),
    );
    (cursor, ready, completer)
}

fn counting() -> (Arc<AtomicUsize>, Continuation) {
    let hits = Arc::new(AtomicUsize::new(0));
    let cont = Continuation::callback(
        |hits: Arc<AtomicUsize>| {
            hits.fetch_add(1, Ordering::SeqCst);
        },
        hits.clone(),
    );
    (hits, cont)
}

#[test]
fn loom_commit_races_hand_off() {
    model(|| {
        let (mut cursor, ready, completer) = pending_gate();
        let MoveStart::Pending(token) = cursor.start_move() else {
            panic!("nothing committed yet");
        };

        let writer = thread::spawn(move || {
            ready.store(true, Ordering::SeqCst);
            completer.notify();
        });

        let (hits, cont) = counting();
        cursor.register_continuation(token, cont, false);
        writer.join().unwrap();

        // Whichever side lost the flag, the commit is never missed
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(cursor.poll_status(token), MoveStatus::Succeeded);
        assert!(cursor.get_result(token).unwrap());
        assert_eq!(cursor.current_key(), Some(&1));
    });
}

#[test]
fn loom_cancel_races_drive_release() {
    model(|| {
        let (mut cursor, _ready, completer) = pending_gate();
        let MoveStart::Pending(token) = cursor.start_move() else {
            panic!("nothing committed yet");
        };

        let canceller = thread::spawn(move || {
            completer.cancel_all();
        });

        let (hits, cont) = counting();
        cursor.register_continuation(token, cont, false);
        canceller.join().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(cursor.poll_status(token), MoveStatus::Canceled);
        assert!(cursor.get_result(token).unwrap_err().is_canceled());
    });
}

#[test]
fn loom_abandon_races_commit() {
    model(|| {
        let (mut cursor, ready, completer) = pending_gate();
        let MoveStart::Pending(token) = cursor.start_move() else {
            panic!("nothing committed yet");
        };
        let (hits, cont) = counting();
        cursor.register_continuation(token, cont, false);

        let writer = thread::spawn(move || {
            ready.store(true, Ordering::SeqCst);
            completer.notify();
        });

        // The cycle settles exactly once, by the drive or by the drop
        drop(cursor);
        writer.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    });
}
