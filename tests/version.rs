#![cfg(feature = "loom")]

use loom::sync::Arc;
use loom::thread;
use series_sync::VersionLock;

#[test]
fn loom_writers_serialize() {
    loom::model(|| {
        let lock = Arc::new(VersionLock::new());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let saved = lock.begin_write(true).unwrap();
                    assert_eq!(lock.next_version(), saved as u64 + 1);
                    lock.end_write(saved, true);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(lock.version(), 2);
        assert_eq!(lock.next_version(), 2);
        assert!(!lock.is_locked());
    });
}

#[test]
fn loom_abort_never_advances() {
    loom::model(|| {
        let lock = Arc::new(VersionLock::new());

        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                let saved = lock.begin_write(true).unwrap();
                lock.end_write(saved, false);
            })
        };

        // A reader only ever sees the initial version
        assert_eq!(lock.version(), 0);
        writer.join().unwrap();
        assert_eq!(lock.version(), 0);
        assert_eq!(lock.next_version(), 0);
    });
}

#[test]
fn loom_commit_publishes_before_unlock() {
    loom::model(|| {
        let lock = Arc::new(VersionLock::new());

        let writer = {
            let lock = lock.clone();
            thread::spawn(move || {
                let saved = lock.begin_write(true).unwrap();
                lock.end_write(saved, true);
            })
        };

        let saved = lock.begin_write(true).unwrap();
        // Whoever goes second starts from the first writer's commit
        assert!(saved == 0 || saved == 1);
        assert_eq!(lock.version(), saved as u64);
        lock.end_write(saved, true);

        writer.join().unwrap();
        assert_eq!(lock.version(), 2);
    });
}
