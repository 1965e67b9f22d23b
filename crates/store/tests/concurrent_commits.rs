//! Concurrent update transactions.
//!
//! Many threads build private deltas at once and commit through the single
//! merge worker. No commit may be lost and no reader may ever observe a
//! partially merged commit.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use fbdb_store::{Database, DatabaseConfig, IndexSchema, Schema};
use fbdb_test_utils::TestDir;

const RECORD_LEN: usize = 12;

fn record(n: usize) -> Vec<u8> {
    let mut s = format!("{n}transaction");
    s.truncate(RECORD_LEN);
    s.into_bytes()
}

fn create_table(db: &Database) {
    let mut tran = db.update();
    tran.create_table(Schema::builder().table("tmp").indexes(vec![IndexSchema::key([0])]).build())
        .unwrap();
    tran.commit().unwrap();
}

#[test]
fn test_no_lost_updates() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 4000;

    let dir = TestDir::new();
    let path = dir.db_path();
    let config = DatabaseConfig::builder()
        .checkpoint_interval(Duration::from_millis(100))
        .sync_on_checkpoint(false)
        .build();
    {
        let db = Database::create(&path, config.clone()).unwrap();
        create_table(&db);

        thread::scope(|s| {
            for t in 0..THREADS {
                let db = &db;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        let mut tran = db.update();
                        tran.output("tmp", &record(t * PER_THREAD + i)).unwrap();
                        tran.commit().unwrap();
                    }
                });
            }
        });

        let info = db.read().info("tmp").unwrap().unwrap();
        assert_eq!(info.nrows, (THREADS * PER_THREAD) as u64);
        assert_eq!(info.size, (THREADS * PER_THREAD * RECORD_LEN) as u64);
        db.close().unwrap();
    }

    let db = Database::open(&path, config).unwrap();
    let r = db.read();
    let info = r.info("tmp").unwrap().unwrap();
    assert_eq!(info.nrows, 32_000);
    assert_eq!(info.size, 384_000);
    assert!(r.search("tmp", 0, &record(31_999)).unwrap().is_some());
    let report = db.check().unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.rows_seen, 32_000);
}

#[test]
fn test_readers_see_whole_commits() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 300;
    const ROWS_PER_TRAN: usize = 3;

    let config = DatabaseConfig::builder().checkpoint_interval(Duration::from_millis(20)).build();
    let db = Database::open_in_memory(config).unwrap();
    create_table(&db);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let db = &db;
                s.spawn(move || {
                    for i in 0..PER_WRITER {
                        let mut tran = db.update();
                        for j in 0..ROWS_PER_TRAN {
                            let n = (w * PER_WRITER + i) * ROWS_PER_TRAN + j;
                            tran.output("tmp", &record(n)).unwrap();
                        }
                        tran.commit().unwrap();
                    }
                })
            })
            .collect();

        s.spawn(|| {
            let mut last = 0;
            while !done.load(Ordering::Acquire) {
                let info = db.read().info("tmp").unwrap().unwrap();
                assert_eq!(info.nrows % ROWS_PER_TRAN as u64, 0, "partial commit visible");
                assert_eq!(info.size, info.nrows * RECORD_LEN as u64);
                assert!(info.nrows >= last, "snapshot went backwards");
                last = info.nrows;
            }
        });

        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    let r = db.read();
    let total = (WRITERS * PER_WRITER * ROWS_PER_TRAN) as u64;
    assert_eq!(r.info("tmp").unwrap().unwrap().nrows, total);
    assert_eq!(r.iter("tmp", 0).unwrap().len() as u64, total);
}
