// src/sync.rs

//! Background sync coordinator: drains the checkpoint retry queue against
//! the checkpoint channel whenever connectivity allows.
//!
//! Guarantees:
//! - single flight: at most one drain runs at a time; a second trigger returns
//!   at once and the running drain makes one more pass over the queue;
//! - entries are delivered one at a time in ascending sequence order;
//! - each entry gets `max_retries` retries with exponential backoff, then moves
//!   to the failed-checkpoint ledger;
//! - losing connectivity stops the drain between entries and leaves the rest queued;
//! - errors that retrying cannot fix go straight to the ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{
    channel::{ChannelState, CheckpointChannel},
    config::EngineConfig,
    error::AppError,
    models::{
        checkpoint::{Checkpoint, CheckpointAck, QueuedCheckpoint},
        sync::{SyncProgress, SyncStatus},
    },
    monitor::ConnectionMonitor,
    store::LocalStore,
    utils::{
        lock,
        observer::{ObserverList, Subscription},
    },
};

/// Where drained checkpoints go. Implemented by [`CheckpointChannel`].
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn deliver(&self, checkpoint: &Checkpoint) -> Result<CheckpointAck, AppError>;
}

#[async_trait]
impl CheckpointSink for CheckpointChannel {
    async fn deliver(&self, checkpoint: &Checkpoint) -> Result<CheckpointAck, AppError> {
        CheckpointChannel::deliver(self, checkpoint).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `3` means four attempts in total.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_sync_retries,
            base_delay: config.sync_retry_base,
        }
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry - 1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncProgress),
    /// Connectivity was lost mid-drain; remaining entries stay queued.
    Interrupted(SyncProgress),
}

impl SyncOutcome {
    pub fn progress(&self) -> Option<SyncProgress> {
        match self {
            SyncOutcome::Skipped(_) => None,
            SyncOutcome::Completed(p) | SyncOutcome::Interrupted(p) => Some(*p),
        }
    }
}

enum EntryResult {
    Delivered,
    Failed,
    Interrupted,
}

/// Clears the in-progress flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BackgroundSync {
    store: Arc<LocalStore>,
    sink: Arc<dyn CheckpointSink>,
    policy: RetryPolicy,
    /// Restricts the drain to one attempt's entries.
    scope: Option<i64>,
    in_progress: AtomicBool,
    /// Set when a trigger arrives mid-drain; the running drain makes another pass.
    rerun: AtomicBool,
    online: AtomicBool,
    progress: Mutex<SyncProgress>,
    observers: ObserverList<SyncProgress>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl BackgroundSync {
    pub fn new(
        store: Arc<LocalStore>,
        sink: Arc<dyn CheckpointSink>,
        policy: RetryPolicy,
        scope: Option<i64>,
    ) -> Self {
        Self {
            store,
            sink,
            policy,
            scope,
            in_progress: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            online: AtomicBool::new(true),
            progress: Mutex::new(SyncProgress::default()),
            observers: ObserverList::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> SyncProgress {
        *lock(&self.progress)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub async fn queued_count(&self) -> Result<i64, AppError> {
        self.store.queued_count(self.scope).await
    }

    pub async fn clear_queue(&self) -> Result<u64, AppError> {
        let removed = self.store.clear_queue(self.scope).await?;
        tracing::info!("Cleared {} queued checkpoints", removed);
        Ok(removed)
    }

    /// Follows the monitor: `offline` halts draining, the move back to a
    /// deliverable status triggers a drain.
    pub fn attach_monitor(self: &Arc<Self>, monitor: &ConnectionMonitor) {
        let weak = Arc::downgrade(self);
        let runtime = Handle::try_current().ok();
        let subscription = monitor.subscribe(move |state| {
            let Some(sync) = weak.upgrade() else { return };
            let deliverable = state.status.can_deliver();
            let was = sync.online.swap(deliverable, Ordering::SeqCst);
            if deliverable && !was {
                spawn_sync(&runtime, &weak, "connectivity restored");
            }
        });
        lock(&self.subscriptions).push(subscription);
    }

    /// Every (re)connection of the channel forces a full drain.
    pub fn attach_channel(self: &Arc<Self>, channel: &CheckpointChannel) {
        let weak = Arc::downgrade(self);
        let runtime = Handle::try_current().ok();
        let subscription = channel.on_state(move |state| {
            if let ChannelState::Connected { recovered } = state {
                let reason = if *recovered {
                    "channel recovered"
                } else {
                    "channel connected"
                };
                spawn_sync(&runtime, &weak, reason);
            }
        });
        lock(&self.subscriptions).push(subscription);
    }

    /// Drains on a fixed period until the handle is aborted.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sync) = weak.upgrade() else { break };
                if let Err(e) = sync.sync_all().await {
                    tracing::error!("Periodic sync failed: {}", e);
                }
            }
        })
    }

    pub fn detach(&self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
    }

    pub async fn manual_sync(&self) -> Result<SyncOutcome, AppError> {
        tracing::info!("Manual sync requested");
        self.sync_all().await
    }

    /// One drain. Store failures propagate and leave the status at `error`;
    /// delivery failures are absorbed into the progress counters.
    pub async fn sync_all(&self) -> Result<SyncOutcome, AppError> {
        if !self.online.load(Ordering::SeqCst) {
            tracing::debug!("Offline; sync skipped");
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync already in progress; skipped");
            self.rerun.store(true, Ordering::SeqCst);
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = FlightGuard(&self.in_progress);
        self.rerun.store(false, Ordering::SeqCst);

        let mut totals = SyncProgress::default();
        loop {
            match self.drain().await {
                Ok(SyncOutcome::Completed(pass)) => {
                    accumulate(&mut totals, &pass);
                    if self.rerun.swap(false, Ordering::SeqCst) {
                        continue;
                    }
                    return Ok(SyncOutcome::Completed(totals));
                }
                Ok(SyncOutcome::Interrupted(pass)) => {
                    accumulate(&mut totals, &pass);
                    // A reconnect trigger may have landed while this pass was failing.
                    if self.rerun.swap(false, Ordering::SeqCst) && self.online.load(Ordering::SeqCst)
                    {
                        continue;
                    }
                    return Ok(SyncOutcome::Interrupted(totals));
                }
                Ok(skipped) => return Ok(skipped),
                Err(e) => return Err(self.record_failure(e).await),
            }
        }
    }

    async fn record_failure(&self, e: AppError) -> AppError {
        tracing::error!("Sync pass failed: {}", e);
        let mut progress = self.progress();
        progress.in_progress = false;
        self.publish(progress);
        if let Err(status_err) = self.store.set_sync_status(SyncStatus::Error).await {
            tracing::error!("Could not record sync error status: {}", status_err);
        }
        e
    }

    async fn drain(&self) -> Result<SyncOutcome, AppError> {
        self.store.set_sync_status(SyncStatus::Syncing).await?;

        let entries = self.store.list_queued(self.scope).await?;
        let mut progress = SyncProgress {
            total: entries.len(),
            synced: 0,
            failed: 0,
            in_progress: true,
        };
        self.publish(progress);

        if !entries.is_empty() {
            tracing::info!("Syncing {} queued checkpoints", entries.len());
        }

        let mut interrupted = false;
        for entry in &entries {
            if !self.online.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            match self.deliver_with_retry(entry).await? {
                EntryResult::Delivered => progress.synced += 1,
                EntryResult::Failed => progress.failed += 1,
                EntryResult::Interrupted => {
                    interrupted = true;
                    break;
                }
            }
            self.publish(progress);
        }

        if interrupted {
            tracing::warn!(
                "Sync interrupted; {} checkpoints left queued",
                progress.remaining()
            );
        }

        progress.in_progress = false;
        self.publish(progress);
        self.store.set_last_sync_time(Utc::now()).await?;
        self.store.set_sync_status(SyncStatus::Idle).await?;

        tracing::info!(
            "Sync pass finished: {} synced, {} failed of {}",
            progress.synced,
            progress.failed,
            progress.total
        );

        Ok(if interrupted {
            SyncOutcome::Interrupted(progress)
        } else {
            SyncOutcome::Completed(progress)
        })
    }

    async fn deliver_with_retry(&self, entry: &QueuedCheckpoint) -> Result<EntryResult, AppError> {
        let checkpoint = &entry.checkpoint;
        let mut retries = entry.retry_count;

        loop {
            let (error, transient) = match self.sink.deliver(checkpoint).await {
                Ok(ack) => {
                    self.store.remove_from_queue(&entry.key).await?;
                    self.store
                        .mark_answer_synced(checkpoint.attempt_id, checkpoint.question_id, ack.sequence)
                        .await?;
                    tracing::debug!("Checkpoint {} synced", entry.key);
                    return Ok(EntryResult::Delivered);
                }
                Err(AppError::Disconnected) => {
                    tracing::warn!("Channel disconnected while syncing {}", entry.key);
                    return Ok(EntryResult::Interrupted);
                }
                Err(e) => (e.to_string(), e.is_transient()),
            };

            if !transient || retries >= self.policy.max_retries {
                self.store.fail_checkpoint(&entry.key, &error).await?;
                tracing::error!(
                    "Checkpoint {} failed after {} attempts: {}",
                    entry.key,
                    retries + 1,
                    error
                );
                return Ok(EntryResult::Failed);
            }

            retries += 1;
            self.store.increment_retry(&entry.key, &error).await?;
            let delay = self.policy.delay_for(retries);
            tracing::warn!(
                "Checkpoint {} failed ({}); retry {}/{} in {:?}",
                entry.key,
                error,
                retries,
                self.policy.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;

            if !self.online.load(Ordering::SeqCst) {
                return Ok(EntryResult::Interrupted);
            }
        }
    }

    fn publish(&self, progress: SyncProgress) {
        *lock(&self.progress) = progress;
        self.observers.notify(&progress);
    }
}

fn accumulate(totals: &mut SyncProgress, pass: &SyncProgress) {
    totals.total += pass.total;
    totals.synced += pass.synced;
    totals.failed += pass.failed;
}

fn spawn_sync(runtime: &Option<Handle>, weak: &Weak<BackgroundSync>, reason: &'static str) {
    let Some(runtime) = runtime else {
        tracing::warn!("No runtime to run sync ({})", reason);
        return;
    };
    let weak = weak.clone();
    runtime.spawn(async move {
        let Some(sync) = weak.upgrade() else { return };
        tracing::info!("Sync triggered: {}", reason);
        match sync.sync_all().await {
            Ok(outcome) => tracing::debug!("Triggered sync outcome: {:?}", outcome),
            Err(e) => tracing::error!("Triggered sync failed: {}", e),
        }
    });
}
