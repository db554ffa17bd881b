// src/channel/mod.rs

//! Checkpoint channel: a long-lived, auto-reconnecting link scoped to one
//! attempt. Checkpoints are pushed with `deliver` and resolved by the
//! matching `checkpoint_ack`; everything else the server sends is fanned
//! out to subscribers.

pub mod memory;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{
    config::EngineConfig,
    error::AppError,
    models::{
        checkpoint::{Checkpoint, CheckpointAck},
        message::{ClientMessage, ServerMessage},
    },
    utils::{
        lock,
        observer::{ObserverList, Subscription},
    },
};

pub use transport::{Link, Transport, WebSocketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    /// `recovered` is set when this connection follows at least one failure.
    Connected { recovered: bool },
    Reconnecting { attempt: u32 },
    /// Reconnect ceiling reached. Only `reconnect()` leaves this state.
    Disconnected,
    Closed,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub ack_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_timeout: Duration,
}

impl ChannelOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

type AckWaiter = oneshot::Sender<Result<CheckpointAck, AppError>>;

struct Inner {
    attempt_id: i64,
    token: String,
    transport: Arc<dyn Transport>,
    options: ChannelOptions,
    state: watch::Sender<ChannelState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<(i64, i64), AckWaiter>>,
    state_observers: ObserverList<ChannelState>,
    message_observers: ObserverList<ServerMessage>,
    running: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Runtime the channel was built on. Reconnect signals may arrive from
    /// threads outside it.
    runtime: Option<Handle>,
}

#[derive(Clone)]
pub struct CheckpointChannel {
    inner: Arc<Inner>,
}

impl CheckpointChannel {
    pub fn new(
        attempt_id: i64,
        token: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: ChannelOptions,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            inner: Arc::new(Inner {
                attempt_id,
                token: token.into(),
                transport,
                options,
                state,
                outgoing: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                state_observers: ObserverList::new(),
                message_observers: ObserverList::new(),
                running: AtomicBool::new(false),
                supervisor: Mutex::new(None),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn attempt_id(&self) -> i64 {
        self.inner.attempt_id
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Starts the connection supervisor without waiting for the link.
    /// No-op while a supervisor is already running.
    pub fn start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.inner.set_state(ChannelState::Connecting);
        self.inner.spawn_supervisor(false);
    }

    /// Starts the supervisor and waits until the first connection succeeds
    /// or the reconnect ceiling is reached.
    pub async fn connect(&self) -> Result<(), AppError> {
        let mut state = self.inner.state.subscribe();
        self.start();

        let settled = state
            .wait_for(|s| {
                matches!(
                    s,
                    ChannelState::Connected { .. } | ChannelState::Disconnected | ChannelState::Closed
                )
            })
            .await
            .map(|s| *s)
            .map_err(|_| AppError::Disconnected)?;

        if settled.is_connected() {
            Ok(())
        } else {
            Err(AppError::Disconnected)
        }
    }

    /// Manual retry: restarts the supervisor with a fresh attempt budget.
    /// The next successful connection counts as a recovery.
    pub fn reconnect(&self) {
        self.inner.abort_supervisor();
        self.inner.drop_link();
        tracing::info!("Manual reconnect requested for attempt {}", self.inner.attempt_id);
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.set_state(ChannelState::Reconnecting { attempt: 0 });
        self.inner.spawn_supervisor(true);
    }

    /// Closes the link for good. Pending deliveries fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.inner.abort_supervisor();
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.drop_link();
        self.inner.set_state(ChannelState::Closed);
    }

    /// Sends a frame if connected. Never fails loudly; `false` means the
    /// frame was not handed to the link.
    pub fn send(&self, message: &ClientMessage) -> bool {
        self.inner.send(message)
    }

    pub fn send_time_sync(&self) -> bool {
        self.send(&ClientMessage::TimeSync {
            client_timestamp: Utc::now(),
        })
    }

    pub fn send_flag(&self, question_id: i64, is_flagged: bool) -> bool {
        self.send(&ClientMessage::Flag {
            question_id,
            is_flagged,
        })
    }

    /// Pushes one checkpoint and waits for its acknowledgement.
    pub async fn deliver(&self, checkpoint: &Checkpoint) -> Result<CheckpointAck, AppError> {
        if checkpoint.attempt_id != self.inner.attempt_id {
            return Err(AppError::BadRequest(format!(
                "checkpoint for attempt {} sent on channel for attempt {}",
                checkpoint.attempt_id, self.inner.attempt_id
            )));
        }

        let key = (checkpoint.question_id, checkpoint.sequence);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(key, tx);

        if !self.inner.send(&checkpoint.to_message()) {
            lock(&self.inner.pending).remove(&key);
            return Err(AppError::Disconnected);
        }

        match tokio::time::timeout(self.inner.options.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::Disconnected),
            Err(_) => {
                lock(&self.inner.pending).remove(&key);
                tracing::warn!(
                    "No acknowledgment for question {} sequence {} within {:?}",
                    checkpoint.question_id,
                    checkpoint.sequence,
                    self.inner.options.ack_timeout
                );
                Err(AppError::AckTimeout {
                    question_id: checkpoint.question_id,
                    sequence: checkpoint.sequence,
                })
            }
        }
    }

    pub fn on_state<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChannelState) + Send + Sync + 'static,
    {
        self.inner.state_observers.subscribe(listener)
    }

    /// Subscribes to one message type, e.g. `"time_update"`.
    pub fn on_message<F>(&self, kind: &'static str, listener: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.inner.message_observers.subscribe(move |message: &ServerMessage| {
            if message.kind() == kind {
                listener(message);
            }
        })
    }

    /// Subscribes to every inbound message.
    pub fn on_any_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.inner.message_observers.subscribe(listener)
    }
}

impl Inner {
    fn spawn_supervisor(self: &Arc<Self>, had_failure: bool) {
        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            tracing::error!(
                "No runtime to supervise the channel for attempt {}",
                self.attempt_id
            );
            self.running.store(false, Ordering::SeqCst);
            self.set_state(ChannelState::Disconnected);
            return;
        };
        let handle = runtime.spawn(supervise(Arc::clone(self), had_failure));
        if let Some(previous) = lock(&self.supervisor).replace(handle) {
            previous.abort();
        }
    }

    fn abort_supervisor(&self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }

    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(
                "Checkpoint channel for attempt {}: {:?} -> {:?}",
                self.attempt_id,
                previous,
                next
            );
            self.state_observers.notify(&next);
        }
    }

    fn send(&self, message: &ClientMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode client frame: {}", e);
                return false;
            }
        };

        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => {
                tracing::debug!("Not connected; frame not sent");
                false
            }
        }
    }

    fn drop_link(&self) {
        lock(&self.outgoing).take();
        let waiters: Vec<AckWaiter> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(AppError::Disconnected));
        }
    }

    fn handle_frame(&self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed server frame: {}", e);
                return;
            }
        };
        tracing::debug!("Received {} frame", message.kind());

        match &message {
            ServerMessage::Ping => {
                self.send(&ClientMessage::Pong {
                    timestamp: Utc::now(),
                });
            }
            ServerMessage::CheckpointAck(ack) => {
                let waiter = lock(&self.pending).remove(&(ack.question_id, ack.sequence));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(ack.clone()));
                }
            }
            ServerMessage::CheckpointError {
                question_id,
                sequence,
                reason,
            } => {
                let waiters: Vec<(i64, AckWaiter)> = {
                    let mut pending = lock(&self.pending);
                    let keys: Vec<(i64, i64)> = pending
                        .keys()
                        .filter(|(q, s)| *q == *question_id && sequence.is_none_or(|seq| seq == *s))
                        .copied()
                        .collect();
                    keys.into_iter()
                        .filter_map(|k| pending.remove(&k).map(|tx| (k.1, tx)))
                        .collect()
                };
                for (seq, waiter) in waiters {
                    let _ = waiter.send(Err(AppError::CheckpointRejected {
                        question_id: *question_id,
                        sequence: seq,
                        reason: reason.clone(),
                    }));
                }
            }
            _ => {}
        }

        self.message_observers.notify(&message);
    }

    /// Pumps one link until it closes or goes silent past the heartbeat window.
    async fn run_link(&self, link: Link, recovered: bool) {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        *lock(&self.outgoing) = Some(outgoing);
        self.set_state(ChannelState::Connected { recovered });

        loop {
            tokio::select! {
                frame = incoming.recv() => match frame {
                    Some(text) => self.handle_frame(&text),
                    None => {
                        tracing::warn!("Checkpoint link for attempt {} closed", self.attempt_id);
                        break;
                    }
                },
                _ = tokio::time::sleep(self.options.heartbeat_timeout) => {
                    tracing::warn!(
                        "No frames for {:?} on attempt {}; dropping link",
                        self.options.heartbeat_timeout,
                        self.attempt_id
                    );
                    break;
                }
            }
        }

        self.drop_link();
    }
}

/// Connection loop. Consecutive failures are capped by
/// `max_reconnect_attempts` with a fixed delay between tries; a successful
/// connection resets the budget.
async fn supervise(inner: Arc<Inner>, mut had_failure: bool) {
    let mut attempts: u32 = 0;

    loop {
        match inner.transport.open(inner.attempt_id, &inner.token).await {
            Ok(link) => {
                attempts = 0;
                inner.run_link(link, had_failure).await;
            }
            Err(e) => {
                tracing::warn!(
                    "Checkpoint channel for attempt {} failed to open: {}",
                    inner.attempt_id,
                    e
                );
            }
        }
        had_failure = true;

        if attempts >= inner.options.max_reconnect_attempts {
            tracing::error!(
                "Giving up on checkpoint channel for attempt {} after {} reconnect attempts",
                inner.attempt_id,
                attempts
            );
            inner.running.store(false, Ordering::SeqCst);
            inner.set_state(ChannelState::Disconnected);
            return;
        }

        attempts += 1;
        inner.set_state(ChannelState::Reconnecting { attempt: attempts });
        tokio::time::sleep(inner.options.reconnect_delay).await;
    }
}
