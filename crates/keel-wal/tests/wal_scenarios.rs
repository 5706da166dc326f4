use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tempfile::TempDir;

use keel_wal::{
    AppendEntry, AppliedEntry, MemoryMode, StateMachine, Wal, WalConfig, WalError, WalResult,
};

fn config_in(tmp: &TempDir, memory: MemoryMode) -> WalConfig {
    WalConfig {
        root_dir: tmp.path().join("wal"),
        memory,
        ..WalConfig::default()
    }
}

#[derive(Default)]
struct RecordingMachine {
    seen: Mutex<Vec<(u64, u64, Vec<u8>)>>,
}

impl StateMachine for RecordingMachine {
    fn apply(&self, applied: AppliedEntry) -> BoxFuture<'_, WalResult<()>> {
        async move {
            self.seen.lock().push((
                applied.entry.index,
                applied.entry.term,
                applied.entry.payload.clone(),
            ));
            Ok(())
        }
        .boxed()
    }
}

/// Sums little-endian i64 payloads, the shape of the restart law.
#[derive(Default)]
struct SumMachine {
    sum: AtomicI64,
}

impl StateMachine for SumMachine {
    fn apply(&self, applied: AppliedEntry) -> BoxFuture<'_, WalResult<()>> {
        async move {
            let bytes: [u8; 8] = applied.entry.payload.as_slice().try_into().map_err(|_| {
                WalError::invalid_state("sum machine expects 8-byte payloads")
            })?;
            self.sum.fetch_add(i64::from_le_bytes(bytes), Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test]
async fn fresh_append_commit_apply() {
    let tmp = TempDir::new().expect("tempdir");
    let machine = Arc::new(RecordingMachine::default());
    let wal = Wal::open_with_state_machine(
        config_in(&tmp, MemoryMode::SharedMemory),
        machine.clone(),
    )
    .expect("open");

    let index = wal.append(42, b"SET X=0").await.expect("append");
    assert_eq!(index, 1);
    assert_eq!(wal.commit(1).await.expect("commit"), 1);
    wal.wait_for_apply(1).await.expect("apply");

    assert_eq!(wal.last_entry(), 1);
    assert_eq!(wal.last_committed(), 1);
    let seen = machine.seen.lock().clone();
    assert_eq!(seen, vec![(1, 42, b"SET X=0".to_vec())]);
    wal.close().await.expect("close");
}

#[tokio::test]
async fn overwrite_uncommitted_suffix() {
    let tmp = TempDir::new().expect("tempdir");
    let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");

    for term in [42u64, 43, 44, 45, 46] {
        wal.append(term, format!("term-{term}").as_bytes())
            .await
            .expect("append");
    }
    assert_eq!(wal.last_entry(), 5);

    let last = wal
        .append_range(vec![AppendEntry::new(99, "winner")], 1)
        .await
        .expect("overwrite");
    assert_eq!(last, 1);
    assert_eq!(wal.last_entry(), 1);

    let batch = wal.read(1, 1).await.expect("read");
    assert_eq!(batch.entries[0].term, 99);
    assert_eq!(batch.entries[0].payload, b"winner");

    assert!(matches!(
        wal.read(2, 2).await.expect_err("out of range"),
        WalError::OutOfRange { index: 2, .. }
    ));
    wal.close().await.expect("close");
}

#[tokio::test]
async fn reject_overwrite_of_committed() {
    let tmp = TempDir::new().expect("tempdir");
    let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");

    for term in 1..=5u64 {
        wal.append(term, b"stable").await.expect("append");
    }
    wal.commit(3).await.expect("commit");

    let err = wal
        .append_range(vec![AppendEntry::new(9, "usurper")], 2)
        .await
        .expect_err("must reject");
    assert!(matches!(err, WalError::OverwriteCommitted { index: 2, .. }));

    // State unchanged.
    assert_eq!(wal.last_entry(), 5);
    assert_eq!(wal.last_committed(), 3);
    for term in 1..=5u64 {
        let batch = wal.read(term, term).await.expect("read");
        assert_eq!(batch.entries[0].term, term);
        assert_eq!(batch.entries[0].payload, b"stable");
    }
    wal.close().await.expect("close");
}

#[tokio::test]
async fn restart_after_commit_replays_into_sum_machine() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_in(&tmp, MemoryMode::SharedMemory);

    {
        let wal = Wal::open(config.clone()).expect("open");
        for i in 0..1000i64 {
            wal.append(1, &i.to_le_bytes()).await.expect("append");
        }
        wal.commit(1000).await.expect("commit");
        wal.flush().await.expect("flush");
        wal.close().await.expect("close");
    }

    let machine = Arc::new(SumMachine::default());
    let wal = Wal::open_with_state_machine(config, machine.clone()).expect("reopen");
    assert_eq!(wal.last_committed(), 1000);
    wal.wait_for_apply(1000).await.expect("apply");
    assert_eq!(machine.sum.load(Ordering::SeqCst), 1000 * 999 / 2);
    wal.close().await.expect("close");
}

#[tokio::test]
async fn large_entry_spans_pages() {
    let tmp = TempDir::new().expect("tempdir");
    let config = WalConfig {
        chunk_size: 4096,
        ..config_in(&tmp, MemoryMode::SharedMemory)
    };
    let wal = Wal::open(config).expect("open");
    let page_size = wal.config().chunk_size as usize;

    // Strictly larger than one page even where the OS page (and so
    // the normalized chunk) is bigger than 4 KiB.
    let payload: Vec<u8> = (0..page_size * 2 + 808).map(|i| (i % 256) as u8).collect();
    wal.append(5, &payload).await.expect("append");
    wal.commit(1).await.expect("commit");

    let batch = wal.read(1, 1).await.expect("read");
    assert_eq!(batch.entries[0].payload, payload);
    assert!(wal.stats().resident_pages >= 2);
    wal.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_read_during_append() {
    const N: u64 = 200;

    let tmp = TempDir::new().expect("tempdir");
    let wal = Arc::new(Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open"));

    for i in 1..=N {
        wal.append(1, &i.to_le_bytes()).await.expect("append");
    }

    let reader = {
        let wal = Arc::clone(&wal);
        tokio::spawn(async move { wal.read(1, N).await })
    };
    let appender = {
        let wal = Arc::clone(&wal);
        tokio::spawn(async move { wal.append(2, b"latecomer").await })
    };

    let batch = reader.await.expect("join").expect("read");
    assert_eq!(batch.entries.len(), N as usize);
    assert!(batch.entries.iter().all(|entry| entry.term == 1));

    let appended = appender.await.expect("join").expect("append");
    assert_eq!(appended, N + 1);

    let follow_up = wal.read(1, N + 1).await.expect("read");
    assert_eq!(follow_up.entries.len(), (N + 1) as usize);
    assert_eq!(follow_up.entries[N as usize].payload, b"latecomer");
    wal.close().await.expect("close");
}

#[tokio::test]
async fn compaction_drops_applied_prefix_pages() {
    let tmp = TempDir::new().expect("tempdir");
    let config = WalConfig {
        chunk_size: 4096,
        ..config_in(&tmp, MemoryMode::PrivateMemory)
    };
    let machine = Arc::new(RecordingMachine::default());
    let wal = Wal::open_with_state_machine(config, machine).expect("open");
    let page_size = wal.config().chunk_size as usize;

    // One entry per page so compaction has whole pages to reclaim.
    for i in 0..8u8 {
        wal.append(1, &vec![i; page_size]).await.expect("append");
    }
    wal.commit(8).await.expect("commit");
    wal.wait_for_apply(8).await.expect("apply");

    let removed = wal.compact().await.expect("compact");
    assert!(removed >= 6, "expected most pages reclaimed, got {removed}");
    assert_eq!(wal.first_index(), 8);

    // Compacted indices are gone; the boundary entry is retained.
    assert!(matches!(
        wal.read(3, 3).await.expect_err("compacted"),
        WalError::OutOfRange { .. }
    ));
    let batch = wal.read(8, 8).await.expect("read boundary");
    assert_eq!(batch.entries[0].payload, vec![7u8; page_size]);

    // The tail keeps extending after compaction.
    let next = wal.append(2, b"after compaction").await.expect("append");
    assert_eq!(next, 9);
    wal.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interval_flusher_drains_the_dirty_tail() {
    use keel_wal::FlushInterval;
    use std::time::Duration;

    let tmp = TempDir::new().expect("tempdir");
    let config = WalConfig {
        flush_interval: FlushInterval::Every { millis: 10 },
        ..config_in(&tmp, MemoryMode::SharedMemory)
    };
    let wal = Wal::open(config).expect("open");

    wal.append(1, b"background me").await.expect("append");
    let tail = wal.stats().tail_address;

    // The worker runs on a dedicated thread with real time.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if wal.stats().durable_address >= tail {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "interval flusher never caught up"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(wal.metrics().interval_flushes >= 1);
    wal.close().await.expect("close");
}

#[tokio::test]
async fn private_memory_behaves_like_shared() {
    let tmp = TempDir::new().expect("tempdir");
    let wal = Wal::open(config_in(&tmp, MemoryMode::PrivateMemory)).expect("open");

    for term in 1..=3u64 {
        wal.append(term, format!("payload-{term}").as_bytes())
            .await
            .expect("append");
    }
    wal.commit(2).await.expect("commit");

    let batch = wal.read(1, 3).await.expect("read");
    assert_eq!(batch.entries.len(), 3);
    assert_eq!(batch.entries[2].payload, b"payload-3");
    assert_eq!(wal.last_committed(), 2);
    wal.close().await.expect("close");
}
