// tests/sync_tests.rs

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{answer_record, checkpoint, wait_until};
use exam_checkpoint::{
    error::AppError,
    models::{
        checkpoint::{Checkpoint, CheckpointAck, CheckpointKey},
        sync::{SyncProgress, SyncStatus},
    },
    monitor::ConnectionMonitor,
    store::LocalStore,
    sync::{BackgroundSync, CheckpointSink, RetryPolicy, SkipReason, SyncOutcome},
};

/// Sink that fails each key a scripted number of times before acking.
#[derive(Default)]
struct ScriptedSink {
    failures: Mutex<HashMap<CheckpointKey, u32>>,
    disconnected: Mutex<bool>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    delivered: Mutex<Vec<CheckpointKey>>,
}

impl ScriptedSink {
    fn failing(key: CheckpointKey, times: u32) -> Self {
        let sink = Self::default();
        sink.failures.lock().unwrap().insert(key, times);
        sink
    }

    fn delivered(&self) -> Vec<CheckpointKey> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointSink for ScriptedSink {
    async fn deliver(&self, checkpoint: &Checkpoint) -> Result<CheckpointAck, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.disconnected.lock().unwrap() {
            return Err(AppError::Disconnected);
        }

        let key = checkpoint.key();
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AppError::AckTimeout {
                        question_id: key.question_id,
                        sequence: key.sequence,
                    });
                }
            }
        }

        self.delivered.lock().unwrap().push(key);
        Ok(CheckpointAck {
            question_id: checkpoint.question_id,
            sequence: checkpoint.sequence,
            saved_at: Utc::now(),
            time_remaining_seconds: 3_000,
        })
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(5),
    }
}

async fn setup(sink: ScriptedSink) -> (Arc<LocalStore>, Arc<ScriptedSink>, Arc<BackgroundSync>) {
    let store = Arc::new(LocalStore::in_memory());
    store.init().await.unwrap();
    let sink = Arc::new(sink);
    let sync = Arc::new(BackgroundSync::new(
        Arc::clone(&store),
        sink.clone(),
        fast_policy(),
        Some(1),
    ));
    (store, sink, sync)
}

#[test]
fn retry_delay_doubles_from_base() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(8_000));
    assert_eq!(policy.max_attempts(), 4);
}

#[tokio::test]
async fn drains_queue_in_sequence_order() {
    let (store, sink, sync) = setup(ScriptedSink::default()).await;
    for seq in [3, 1, 2] {
        store.enqueue_checkpoint(&checkpoint(1, 7, "C", seq)).await.unwrap();
    }
    // Other attempts are out of scope.
    store.enqueue_checkpoint(&checkpoint(2, 7, "C", 1)).await.unwrap();

    let outcome = sync.sync_all().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Completed(SyncProgress {
            total: 3,
            synced: 3,
            failed: 0,
            in_progress: false,
        })
    );

    let sequences: Vec<i64> = sink.delivered().iter().map(|k| k.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(store.queued_count(Some(1)).await.unwrap(), 0);
    assert_eq!(store.queued_count(Some(2)).await.unwrap(), 1);
    assert_eq!(store.get_sync_status().await.unwrap(), SyncStatus::Idle);
    assert!(store.get_last_sync_time().await.unwrap().is_some());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let cp = checkpoint(1, 7, "B", 1);
    let (store, sink, sync) = setup(ScriptedSink::failing(cp.key(), 2)).await;
    store.enqueue_checkpoint(&cp).await.unwrap();

    let progress = sync.sync_all().await.unwrap().progress().unwrap();
    assert_eq!(progress.synced, 1);
    assert_eq!(progress.failed, 0);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert!(store.list_failed(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_move_to_failed_ledger() {
    let cp = checkpoint(1, 7, "B", 1);
    let (store, sink, sync) = setup(ScriptedSink::failing(cp.key(), u32::MAX)).await;
    store.enqueue_checkpoint(&cp).await.unwrap();

    let progress = sync.sync_all().await.unwrap().progress().unwrap();
    assert_eq!(progress.synced, 0);
    assert_eq!(progress.failed, 1);

    // One attempt plus three retries.
    assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
    assert_eq!(store.queued_count(None).await.unwrap(), 0);

    let failed = store.list_failed(Some(1)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 3);
    assert!(failed[0].last_error.as_deref().unwrap().contains("timeout"));
}

#[tokio::test]
async fn acked_checkpoint_marks_mirror_synced() {
    let (store, _sink, sync) = setup(ScriptedSink::default()).await;
    store.put_answer(&answer_record(1, 7, "D", 2)).await.unwrap();
    store.enqueue_checkpoint(&checkpoint(1, 7, "D", 2)).await.unwrap();

    sync.sync_all().await.unwrap();

    let mirror = store.answer_for(1, 7).await.unwrap().unwrap();
    assert!(!mirror.needs_sync);
}

#[tokio::test]
async fn concurrent_trigger_is_skipped() {
    let sink = ScriptedSink {
        delay: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let (store, sink, sync) = setup(sink).await;
    store.enqueue_checkpoint(&checkpoint(1, 7, "B", 1)).await.unwrap();

    let (first, second) = tokio::join!(sync.sync_all(), sync.sync_all());

    assert_eq!(first.unwrap().progress().unwrap().synced, 1);
    assert_eq!(second.unwrap(), SyncOutcome::Skipped(SkipReason::AlreadyRunning));
    assert_eq!(sink.delivered().len(), 1);
    assert!(!sync.is_syncing());
}

#[tokio::test]
async fn disconnect_interrupts_and_keeps_entries() {
    let sink = ScriptedSink::default();
    *sink.disconnected.lock().unwrap() = true;
    let (store, _sink, sync) = setup(sink).await;
    store.enqueue_checkpoint(&checkpoint(1, 7, "B", 1)).await.unwrap();
    store.enqueue_checkpoint(&checkpoint(1, 8, "A", 1)).await.unwrap();

    let outcome = sync.sync_all().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Interrupted(p) if p.synced == 0 && p.total == 2));

    let queued = store.list_queued(Some(1)).await.unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|entry| entry.retry_count == 0));
}

#[tokio::test]
async fn offline_skips_and_reconnect_drains() {
    let (store, sink, sync) = setup(ScriptedSink::default()).await;
    let monitor = ConnectionMonitor::new(false, 1_000);
    sync.attach_monitor(&monitor);

    store.enqueue_checkpoint(&checkpoint(1, 7, "B", 1)).await.unwrap();
    assert_eq!(
        sync.sync_all().await.unwrap(),
        SyncOutcome::Skipped(SkipReason::Offline)
    );
    assert!(sink.delivered().is_empty());

    monitor.set_online(None);
    let store_ref = Arc::clone(&store);
    assert!(wait_until(|| {
        let store = Arc::clone(&store_ref);
        async move { store.queued_count(Some(1)).await.unwrap() == 0 }
    })
    .await);
    assert_eq!(sink.delivered().len(), 1);
}

#[tokio::test]
async fn progress_is_published_to_subscribers() {
    let (store, _sink, sync) = setup(ScriptedSink::default()).await;
    store.enqueue_checkpoint(&checkpoint(1, 7, "B", 1)).await.unwrap();
    store.enqueue_checkpoint(&checkpoint(1, 8, "A", 1)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = sync.subscribe(move |progress| sink.lock().unwrap().push(*progress));

    sync.sync_all().await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.first().unwrap().in_progress);
    let last = seen.last().unwrap();
    assert!(!last.in_progress);
    assert_eq!(last.synced, 2);
    assert_eq!(last.remaining(), 0);
}

#[tokio::test]
async fn clear_queue_only_touches_scope() {
    let (store, _sink, sync) = setup(ScriptedSink::default()).await;
    store.enqueue_checkpoint(&checkpoint(1, 7, "B", 1)).await.unwrap();
    store.enqueue_checkpoint(&checkpoint(2, 7, "B", 1)).await.unwrap();

    assert_eq!(sync.clear_queue().await.unwrap(), 1);
    assert_eq!(sync.queued_count().await.unwrap(), 0);
    assert_eq!(store.queued_count(None).await.unwrap(), 1);
}
