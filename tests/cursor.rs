#![cfg(not(feature = "loom"))]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use series_sync::metrics::CounterMetrics;
use series_sync::scheduler::{self, Scheduler, ThreadScheduler};
use series_sync::{AsyncCursor, BatchCursor, CursorConfig, MoveStart, Series, SimpleCursor};
use tokio::time::{sleep, timeout};

const HANG: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_round_trip() {
    let series = Series::<u32, u32>::new();
    let mut cursor = AsyncCursor::new(series.cursor());

    let writer = series.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        writer.append(1, 10).unwrap();
    });

    // Subscribed before the commit
    let next = cursor.move_next_async();
    assert!(next.token().is_some(), "empty series resolved synchronously");
    assert!(timeout(HANG, next).await.unwrap().unwrap());
    assert_eq!(cursor.current_key(), Some(&1));
    assert_eq!(cursor.current_value(), Some(&10));

    let writer = series.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        writer.complete().unwrap();
    });
    assert!(!timeout(HANG, cursor.move_next_async()).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_idempotent_exhaustion() {
    let series = Series::<u32, u32>::new();
    series.append(1, 1).unwrap();
    series.complete().unwrap();

    let metrics = Arc::new(CounterMetrics::new());
    let mut cursor =
        AsyncCursor::with_config(series.cursor(), CursorConfig::new().metrics(metrics.clone()));

    assert!(cursor.move_next_async().await.unwrap());
    for _ in 0..3 {
        let next = cursor.move_next_async();
        assert!(next.token().is_none());
        assert!(!next.await.unwrap());
    }
    assert_eq!(metrics.snapshot().subscriptions, 0);
    assert_eq!(series.completer().subscriber_count(), 0);
}

#[tokio::test]
async fn test_cancellation_surfaces_once() {
    let series = Series::<u32, u32>::new();
    let metrics = Arc::new(CounterMetrics::new());
    let mut cursor =
        AsyncCursor::with_config(series.cursor(), CursorConfig::new().metrics(metrics.clone()));

    let completer = series.completer().clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        completer.cancel_all();
    });

    let err = timeout(HANG, cursor.move_next_async())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(metrics.snapshot().cancellations, 1);

    // The cursor stays usable
    let writer = series.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        writer.append(5, 50).unwrap();
    });
    assert!(timeout(HANG, cursor.move_next_async()).await.unwrap().unwrap());
    assert_eq!(cursor.current_value(), Some(&50));
    assert_eq!(metrics.snapshot().cancellations, 1);
}

#[tokio::test]
async fn test_batch_fallback() {
    let series = Series::<u32, u32>::new();
    for i in 1..=3 {
        series.append(i, i * 100).unwrap();
    }
    let mut cursor = BatchCursor::new(AsyncCursor::new(series.cursor_with_batches(16)));

    for i in 1..=3 {
        assert!(cursor.move_next_async().await.unwrap());
        assert_eq!(cursor.current_key(), Some(&i));
    }
    assert!(cursor.is_batch_mode());

    let writer = series.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(10)).await;
        writer.append(4, 400).unwrap();
    });

    // No further batch: batch mode ends, the cursor re-syncs on key 3 and
    // waits for the next item like any other async cursor
    assert!(timeout(HANG, cursor.move_next_async()).await.unwrap().unwrap());
    assert!(!cursor.is_batch_mode());
    assert_eq!(cursor.current_key(), Some(&4));
    assert_eq!(cursor.current_value(), Some(&400));
}

#[tokio::test]
async fn test_timeout_then_adopt() {
    let series = Series::<u32, u32>::new();
    let mut cursor = AsyncCursor::new(series.cursor());

    for round in 0..5u32 {
        assert!(timeout(Duration::from_millis(5), cursor.move_next_async())
            .await
            .is_err());

        series.append(round, round).unwrap();
        assert!(timeout(HANG, cursor.move_next_async()).await.unwrap().unwrap());
        assert_eq!(cursor.current_key(), Some(&round));
    }
}

#[tokio::test]
async fn test_stream_matches_simple_cursor() {
    let series = Series::<u32, u32>::new();
    let mut stream = AsyncCursor::new(series.cursor());
    let mut oracle = SimpleCursor::new(series.cursor());

    let writer = series.clone();
    tokio::spawn(async move {
        for i in 0..50 {
            writer.append(i, i * 3).unwrap();
            if i % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
        writer.complete().unwrap();
    });

    let streamed: Vec<_> = timeout(HANG, (&mut stream).map(Result::unwrap).collect())
        .await
        .unwrap();

    let mut expected = Vec::new();
    while timeout(HANG, oracle.move_next_async()).await.unwrap().unwrap() {
        expected.push((*oracle.current_key().unwrap(), *oracle.current_value().unwrap()));
    }
    assert_eq!(streamed.len(), 50);
    assert_eq!(streamed, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stress_no_missed_wakeup() {
    const ITEMS: u32 = 20_000;

    let series = Series::<u32, u32>::new();
    let metrics = Arc::new(CounterMetrics::new());
    let mut cursor =
        AsyncCursor::with_config(series.cursor(), CursorConfig::new().metrics(metrics.clone()));

    let writer = {
        let series = series.clone();
        std::thread::spawn(move || {
            for i in 0..ITEMS {
                series.append(i, i).unwrap();
                if i % 64 == 0 {
                    std::thread::yield_now();
                }
            }
            series.complete().unwrap();
        })
    };

    let mut expected = 0;
    while timeout(HANG, cursor.move_next_async()).await.unwrap().unwrap() {
        assert_eq!(cursor.current_key(), Some(&expected));
        expected += 1;
    }
    assert_eq!(expected, ITEMS);
    writer.join().unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.sync_moves + snapshot.completions, u64::from(ITEMS) + 1);
}

#[test]
fn test_captured_context_resumes_there() {
    let home: Arc<dyn Scheduler> = ThreadScheduler::spawn("home");
    let series = Series::<u32, u32>::new();
    let mut cursor = AsyncCursor::with_config(
        series.cursor(),
        CursorConfig::new()
            .capture_context(true)
            .scheduler(ThreadScheduler::spawn("drive")),
    );

    let MoveStart::Pending(token) = cursor.start_move() else {
        panic!("empty series resolved synchronously");
    };

    let (tx, rx) = std::sync::mpsc::channel();
    {
        let _enter = scheduler::enter(home.clone());
        let expected = home.clone();
        cursor.register_continuation(
            token,
            series_sync::Continuation::callback(
                move |tx: std::sync::mpsc::Sender<bool>| {
                    let _ = tx.send(scheduler::is_current(&expected));
                },
                tx,
            ),
            true,
        );
    }

    series.append(1, 1).unwrap();
    assert!(rx.recv_timeout(HANG).unwrap());
    assert!(cursor.get_result(token).unwrap());
    assert_eq!(cursor.current_key(), Some(&1));
}
