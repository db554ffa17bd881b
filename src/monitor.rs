// src/monitor.rs

//! Connection monitor: tri-state reachability (`online`, `slow`, `offline`)
//! published to subscribers. Consumers never poll it for decisions; they
//! subscribe and react to transitions.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::{
    error::AppError,
    models::sync::{ConnectionQuality, ConnectionState, ConnectionStatus, EffectiveType},
    utils::{
        lock,
        observer::{ObserverList, Subscription},
    },
};

/// Source of link quality samples for the periodic poll.
///
/// `Err` is the low-level "link down" signal; `Ok` means reachable.
#[async_trait]
pub trait QualityProbe: Send + Sync {
    async fn sample(&self) -> Result<ConnectionQuality, AppError>;
}

/// Measures round-trip time with a `HEAD` request against a health URL.
pub struct HttpQualityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpQualityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl QualityProbe for HttpQualityProbe {
    async fn sample(&self) -> Result<ConnectionQuality, AppError> {
        let started = Instant::now();
        let response = self.client.head(&self.url).send().await?;
        let rtt_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;

        if !response.status().is_success() && !response.status().is_client_error() {
            return Err(AppError::Network(format!(
                "probe answered {}",
                response.status()
            )));
        }

        Ok(ConnectionQuality {
            effective_type: EffectiveType::from_rtt_ms(rtt_ms),
            downlink_mbps: None,
            rtt_ms,
            save_data: false,
        })
    }
}

/// `slow` when the platform reports a very-low-bandwidth class or the
/// round-trip estimate exceeds `slow_rtt_ceiling_ms`.
pub fn classify(quality: &ConnectionQuality, slow_rtt_ceiling_ms: u32) -> ConnectionStatus {
    if quality.effective_type == EffectiveType::Slow2g || quality.rtt_ms > slow_rtt_ceiling_ms {
        ConnectionStatus::Slow
    } else {
        ConnectionStatus::Online
    }
}

pub struct ConnectionMonitor {
    state: Mutex<ConnectionState>,
    observers: ObserverList<ConnectionState>,
    slow_rtt_ceiling_ms: u32,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    /// `reachable` is the platform's reachability flag at construction.
    pub fn new(reachable: bool, slow_rtt_ceiling_ms: u32) -> Self {
        let status = if reachable {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        Self {
            state: Mutex::new(ConnectionState {
                status,
                quality: None,
            }),
            observers: ObserverList::new(),
            slow_rtt_ceiling_ms,
            poller: Mutex::new(None),
        }
    }

    /// Current state, for display only.
    pub fn snapshot(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Registers a listener. It receives the current state immediately and
    /// then every status transition.
    ///
    /// Registration happens before the replay, so a transition racing the
    /// call is never lost; the listener may see the same state twice.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let subscription = {
            let listener = Arc::clone(&listener);
            self.observers.subscribe(move |state: &ConnectionState| listener(state))
        };
        listener(&self.snapshot());
        subscription
    }

    /// Low-level disconnect signal.
    pub fn set_offline(&self) {
        self.transition(ConnectionState {
            status: ConnectionStatus::Offline,
            quality: None,
        });
    }

    /// Reconnect signal. Quality, when known, decides between `online` and `slow`.
    pub fn set_online(&self, quality: Option<ConnectionQuality>) {
        let status = quality
            .as_ref()
            .map(|q| classify(q, self.slow_rtt_ceiling_ms))
            .unwrap_or(ConnectionStatus::Online);
        self.transition(ConnectionState { status, quality });
    }

    fn transition(&self, next: ConnectionState) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.status != next.status;
            *state = next;
            changed
        };

        if changed {
            tracing::info!("Connection status changed to {:?}", next.status);
            self.observers.notify(&next);
        }
    }

    /// Starts the periodic quality poll, replacing a running one.
    pub fn start_quality_poll(self: &Arc<Self>, probe: Arc<dyn QualityProbe>, interval: Duration) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match probe.sample().await {
                    Ok(quality) => monitor.set_online(Some(quality)),
                    Err(e) => {
                        tracing::debug!("Quality probe failed: {}", e);
                        monitor.set_offline();
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.poller).replace(handle) {
            previous.abort();
        }
    }

    /// Stops the poll and drops every subscriber.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.poller).take() {
            handle.abort();
        }
        self.observers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }
}

/// Best-effort liveness probe. Any error or non-success status is `false`.
pub async fn ping_server(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("Could not build probe client: {}", e);
            return false;
        }
    };

    match client
        .head(url)
        .header(reqwest::header::CACHE_CONTROL, "no-cache")
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::debug!("Ping to {} failed: {}", url, e);
            false
        }
    }
}
