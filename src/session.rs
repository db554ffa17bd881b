// src/session.rs

//! Session-scoped registry. One `ExamSession` owns the channel, the sync
//! coordinator and the state container for a single attempt, and shares
//! the store and the connection monitor handed to it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::{
    api::ApiClient,
    channel::{ChannelOptions, ChannelState, CheckpointChannel, Transport},
    config::EngineConfig,
    error::AppError,
    exam::ExamState,
    models::{
        answer::{AnswerPayload, AnswerRecord},
        checkpoint::{Checkpoint, CheckpointAck},
        exam::{AttemptSnapshot, AttemptStatus, ExamSnapshot},
        submission::{AttemptResult, SubmissionEnvelope},
    },
    monitor::ConnectionMonitor,
    store::LocalStore,
    sync::{BackgroundSync, RetryPolicy, SyncOutcome},
    utils::{crypto::SubmissionCrypto, lock, observer::Subscription},
};

/// Shared services a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: EngineConfig,
    pub store: Arc<LocalStore>,
    pub monitor: Arc<ConnectionMonitor>,
    pub transport: Arc<dyn Transport>,
    pub api: ApiClient,
}

/// What happened to a freshly recorded answer.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointDisposition {
    Delivered(CheckpointAck),
    /// Persisted in the retry queue; the sync coordinator will deliver it.
    Queued,
}

pub struct ExamSession {
    config: EngineConfig,
    username: String,
    store: Arc<LocalStore>,
    monitor: Arc<ConnectionMonitor>,
    api: ApiClient,
    channel: CheckpointChannel,
    sync: Arc<BackgroundSync>,
    state: Arc<Mutex<ExamState>>,
    online: Arc<AtomicBool>,
    crypto: SubmissionCrypto,
    envelope: OnceCell<SubmissionEnvelope>,
    submitted: AtomicBool,
    violations: AtomicU32,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ExamSession {
    /// Fetches the paper and starts (or resumes) the attempt, falling back to
    /// cached snapshots when the server cannot be reached.
    pub async fn start(
        deps: SessionDeps,
        username: &str,
        exam_id: i64,
        workstation_id: Option<String>,
    ) -> Result<Self, AppError> {
        deps.store.init().await?;

        let exam = match deps.api.get_exam(exam_id).await {
            Ok(exam) => exam,
            Err(AppError::Network(e)) => {
                tracing::warn!("Exam {} not reachable ({}); using cached copy", exam_id, e);
                deps.store
                    .get_exam(exam_id)
                    .await?
                    .ok_or(AppError::Network(e))?
            }
            Err(e) => return Err(e),
        };

        let attempt = match deps.api.start_attempt(exam_id, workstation_id).await {
            Ok(attempt) => attempt,
            Err(AppError::Network(e)) => {
                tracing::warn!("Attempt start not reachable ({}); resuming cached attempt", e);
                deps.store
                    .attempts_by_exam(exam_id)
                    .await?
                    .into_iter()
                    .rev()
                    .find(|a| a.status.is_open())
                    .ok_or(AppError::Network(e))?
            }
            Err(e) => return Err(e),
        };

        Self::open(deps, username, exam, attempt).await
    }

    /// Builds the session for a known attempt: caches snapshots, restores
    /// answer mirrors, wires subscriptions and starts the channel.
    pub async fn open(
        deps: SessionDeps,
        username: &str,
        exam: ExamSnapshot,
        attempt: AttemptSnapshot,
    ) -> Result<Self, AppError> {
        let SessionDeps {
            config,
            store,
            monitor,
            transport,
            api,
        } = deps;

        if !attempt.status.is_open() {
            return Err(AppError::Conflict(format!(
                "Attempt {} is {}",
                attempt.id, attempt.status
            )));
        }

        store.init().await?;
        store.put_exam(&exam).await?;
        store.put_attempt(&attempt).await?;

        let attempt_id = attempt.id;
        let mut exam_state = ExamState::new();
        exam_state.load(exam, attempt);
        exam_state.restore_answers(store.answers_by_attempt(attempt_id).await?);
        exam_state.set_queued_checkpoints(store.queued_count(Some(attempt_id)).await?);
        let state = Arc::new(Mutex::new(exam_state));

        let channel = CheckpointChannel::new(
            attempt_id,
            api.token(),
            transport,
            ChannelOptions::from_config(&config),
        );
        let sync = Arc::new(BackgroundSync::new(
            Arc::clone(&store),
            Arc::new(channel.clone()),
            RetryPolicy::from_config(&config),
            Some(attempt_id),
        ));

        let online = Arc::new(AtomicBool::new(monitor.snapshot().status.can_deliver()));
        let mut subscriptions = Vec::new();

        subscriptions.push({
            let state = Arc::clone(&state);
            channel.on_any_message(move |message| lock(&state).apply_server_message(message))
        });
        subscriptions.push({
            let state = Arc::clone(&state);
            channel.on_state(move |channel_state| {
                lock(&state).set_connected(channel_state.is_connected())
            })
        });
        subscriptions.push({
            let state = Arc::clone(&state);
            sync.subscribe(move |progress| {
                let mut state = lock(&state);
                state.set_syncing(progress.in_progress);
                if !progress.in_progress {
                    state.update_last_sync_time();
                }
            })
        });
        subscriptions.push({
            let state = Arc::clone(&state);
            let online = Arc::clone(&online);
            let channel = channel.clone();
            monitor.subscribe(move |connection| {
                let deliverable = connection.status.can_deliver();
                online.store(deliverable, Ordering::SeqCst);
                lock(&state).set_online(deliverable);
                if deliverable && channel.state() == ChannelState::Disconnected {
                    channel.reconnect();
                }
            })
        });

        sync.attach_monitor(&monitor);
        sync.attach_channel(&channel);
        channel.start();

        tracing::info!("Exam session opened for attempt {} ({})", attempt_id, username);

        Ok(Self {
            crypto: SubmissionCrypto::new(config.encryption_iterations),
            config,
            username: username.to_string(),
            store,
            monitor,
            api,
            channel,
            sync,
            state,
            online,
            envelope: OnceCell::new(),
            submitted: AtomicBool::new(false),
            violations: AtomicU32::new(0),
            subscriptions: Mutex::new(subscriptions),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn attempt_id(&self) -> i64 {
        self.channel.attempt_id()
    }

    pub fn channel(&self) -> &CheckpointChannel {
        &self.channel
    }

    pub fn sync(&self) -> &Arc<BackgroundSync> {
        &self.sync
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    /// Read access to the state container.
    pub fn with_state<R>(&self, f: impl FnOnce(&ExamState) -> R) -> R {
        f(&lock(&self.state))
    }

    /// Mutating access for UI actions that do not produce checkpoints
    /// (navigation, countdown ticks).
    pub fn update_state<R>(&self, f: impl FnOnce(&mut ExamState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    /// Records an answer and pushes its checkpoint: straight over the channel
    /// when connected and nothing is queued ahead of it, otherwise into the
    /// retry queue.
    pub async fn record_answer(
        &self,
        question_id: i64,
        answer: Option<AnswerPayload>,
        time_spent_seconds: i64,
    ) -> Result<CheckpointDisposition, AppError> {
        self.ensure_open()?;
        let checkpoint = lock(&self.state).set_answer(question_id, answer, time_spent_seconds)?;
        self.dispatch(checkpoint).await
    }

    /// Flags a question. The flag travels as a best-effort `flag` frame now
    /// and durably with the next auto-save.
    pub fn flag_question(&self, question_id: i64, is_flagged: bool) -> Result<(), AppError> {
        self.ensure_open()?;
        lock(&self.state).flag_question(question_id, is_flagged);
        if self.channel.is_connected() {
            self.channel.send_flag(question_id, is_flagged);
        }
        Ok(())
    }

    /// Pushes every answer that diverged from its last checkpoint.
    pub async fn autosave_tick(&self) -> Result<usize, AppError> {
        if self.is_sealed() {
            return Ok(0);
        }
        let deltas = lock(&self.state).collect_deltas()?;
        if !deltas.is_empty() {
            tracing::info!("Auto-saving {} answers", deltas.len());
        }
        let count = deltas.len();
        for checkpoint in deltas {
            self.dispatch(checkpoint).await?;
        }
        Ok(count)
    }

    /// Auto-save, periodic drain and server time sync on their intervals.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);

        let weak = Arc::downgrade(self);
        let autosave_interval = self.config.autosave_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(autosave_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if let Err(e) = session.autosave_tick().await {
                    tracing::error!("Auto-save failed: {}", e);
                }
            }
        }));

        tasks.push(self.sync.spawn_periodic(self.config.sync_interval));

        let channel = self.channel.clone();
        let time_sync_interval = self.config.sync_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(time_sync_interval);
            loop {
                ticker.tick().await;
                if channel.is_connected() {
                    channel.send_time_sync();
                }
            }
        }));
    }

    async fn dispatch(&self, checkpoint: Checkpoint) -> Result<CheckpointDisposition, AppError> {
        if let Err(e) = self.store.put_answer(&mirror_of(&checkpoint)).await {
            tracing::error!(
                "Could not mirror answer for question {}: {}",
                checkpoint.question_id,
                e
            );
            self.deliver_unbacked(&checkpoint).await;
            return Err(e);
        }

        let send_now = match self.can_send_now().await {
            Ok(send_now) => send_now,
            Err(e) => {
                tracing::error!("Checkpoint queue unreadable: {}", e);
                self.deliver_unbacked(&checkpoint).await;
                return Err(e);
            }
        };

        if send_now {
            match self.channel.deliver(&checkpoint).await {
                Ok(ack) => {
                    self.store
                        .mark_answer_synced(checkpoint.attempt_id, checkpoint.question_id, ack.sequence)
                        .await?;
                    return Ok(CheckpointDisposition::Delivered(ack));
                }
                Err(e) => {
                    tracing::warn!(
                        "Immediate delivery of {} failed, queueing: {}",
                        checkpoint.key(),
                        e
                    );
                }
            }
        }

        self.store.enqueue_checkpoint(&checkpoint).await?;
        // A drain that already listed the queue picks this up on its rerun pass.
        if self.online.load(Ordering::SeqCst) {
            self.trigger_sync();
        }
        self.refresh_queued_count().await;
        Ok(CheckpointDisposition::Queued)
    }

    /// Immediate delivery would overtake queued entries, so it is only used
    /// when the queue is empty and no drain is running.
    async fn can_send_now(&self) -> Result<bool, AppError> {
        if !self.online.load(Ordering::SeqCst) || !self.channel.is_connected() {
            return Ok(false);
        }
        if self.sync.is_syncing() {
            return Ok(false);
        }
        Ok(self.store.queued_count(Some(self.attempt_id())).await? == 0)
    }

    /// Store is down: the answer can only survive by reaching the server now.
    async fn deliver_unbacked(&self, checkpoint: &Checkpoint) {
        if !self.online.load(Ordering::SeqCst) || !self.channel.is_connected() {
            tracing::error!("Answer {} held in memory only", checkpoint.key());
            return;
        }
        match self.channel.deliver(checkpoint).await {
            Ok(ack) => tracing::warn!(
                "Answer {} delivered without a local copy (saved at {})",
                checkpoint.key(),
                ack.saved_at
            ),
            Err(e) => tracing::error!("Answer {} not delivered: {}", checkpoint.key(), e),
        }
    }

    fn trigger_sync(&self) {
        let sync = Arc::clone(&self.sync);
        tokio::spawn(async move {
            if let Err(e) = sync.sync_all().await {
                tracing::error!("Sync after queued answer failed: {}", e);
            }
        });
    }

    async fn refresh_queued_count(&self) {
        match self.store.queued_count(Some(self.attempt_id())).await {
            Ok(count) => lock(&self.state).set_queued_checkpoints(count),
            Err(e) => tracing::warn!("Could not count queued checkpoints: {}", e),
        }
    }

    pub async fn manual_sync(&self) -> Result<SyncOutcome, AppError> {
        let outcome = self.sync.manual_sync().await?;
        self.refresh_queued_count().await;
        Ok(outcome)
    }

    /// Logs a proctoring violation. Reaching the ceiling forces submission.
    pub async fn record_violation(&self, kind: &str) -> Result<Option<AttemptResult>, AppError> {
        let count = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            "Violation {} recorded for attempt {} ({}/{})",
            kind,
            self.attempt_id(),
            count,
            self.config.violation_limit
        );

        if count < self.config.violation_limit || self.submitted.load(Ordering::SeqCst) {
            return Ok(None);
        }

        tracing::warn!("Violation limit reached; forcing submission");
        lock(&self.state).request_submit();
        self.submit().await.map(Some)
    }

    pub fn violation_count(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    fn is_sealed(&self) -> bool {
        self.envelope.initialized()
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.is_sealed() || self.submitted.load(Ordering::SeqCst) {
            return Err(AppError::Conflict(
                "Attempt has been sealed for submission".to_string(),
            ));
        }
        Ok(())
    }

    /// Flushes pending changes, seals the answer set and submits it.
    ///
    /// The envelope is built once; a failed submit can be retried and sends
    /// the same envelope again.
    pub async fn submit(&self) -> Result<AttemptResult, AppError> {
        lock(&self.state).set_submitting(true);
        let result = self.submit_inner().await;
        lock(&self.state).set_submitting(false);
        result
    }

    async fn submit_inner(&self) -> Result<AttemptResult, AppError> {
        let attempt_id = self.attempt_id();

        if !self.is_sealed() {
            if let Err(e) = self.autosave_tick().await {
                tracing::warn!("Final auto-save failed: {}", e);
            }
            match self.sync.sync_all().await {
                Ok(outcome) => tracing::info!("Pre-submit sync: {:?}", outcome),
                Err(e) => tracing::warn!("Pre-submit sync failed: {}", e),
            }
        }

        let envelope = self
            .envelope
            .get_or_try_init(|| async {
                let (answers, exam_id, salt) = {
                    let state = lock(&self.state);
                    let attempt = state
                        .attempt()
                        .ok_or_else(|| AppError::BadRequest("No attempt loaded".to_string()))?;
                    (
                        state.submission_answers(),
                        attempt.exam_id,
                        attempt.encryption_salt.clone(),
                    )
                };
                tracing::info!("Sealing {} answers for attempt {}", answers.len(), attempt_id);
                self.crypto
                    .seal_answers_async(answers, self.username.clone(), exam_id, salt)
                    .await
            })
            .await?
            .clone();

        let result = self.api.submit(attempt_id, &envelope).await.map_err(|e| {
            tracing::error!("Submission of attempt {} failed: {}", attempt_id, e);
            e
        })?;

        self.submitted.store(true, Ordering::SeqCst);
        tracing::info!("Attempt {} submitted", attempt_id);

        let attempt = {
            let state = lock(&self.state);
            state.attempt().cloned()
        };
        if let Some(mut attempt) = attempt {
            attempt.status = AttemptStatus::Submitted;
            attempt.submit_time = result.submit_time;
            if let Err(e) = self.store.put_attempt(&attempt).await {
                tracing::warn!("Could not cache submitted attempt: {}", e);
            }
        }
        if let Err(e) = self.sync.clear_queue().await {
            tracing::warn!("Could not clear queue after submit: {}", e);
        }
        self.close();

        Ok(result)
    }

    /// The sealed envelope, once `submit` has produced it.
    pub fn envelope(&self) -> Option<&SubmissionEnvelope> {
        self.envelope.get()
    }

    /// Stops timers, drops subscriptions and closes the channel.
    pub fn close(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        self.sync.detach();
        self.channel.disconnect();
    }
}

fn mirror_of(checkpoint: &Checkpoint) -> AnswerRecord {
    AnswerRecord {
        id: None,
        attempt_id: checkpoint.attempt_id,
        question_id: checkpoint.question_id,
        answer: checkpoint.answer.clone(),
        is_flagged: checkpoint.is_flagged,
        time_spent_seconds: checkpoint.time_spent_seconds,
        sequence: checkpoint.sequence,
        needs_sync: true,
        last_sync_attempt: None,
    }
}
