// src/channel/memory.rs

//! In-process transport. Each `open` hands a [`ServerEnd`] to whoever is
//! waiting in [`MemoryTransport::accept`], which lets tests and offline
//! demos play the server side of the protocol.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::{
    channel::transport::{Link, Transport},
    error::AppError,
    models::message::{ClientMessage, ServerMessage},
};

pub struct MemoryTransport {
    reachable: AtomicBool,
    fail_next: AtomicU32,
    opens: AtomicUsize,
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            reachable: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// While unreachable every `open` fails with `AppError::Network`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fails the next `count` opens, then behaves normally.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of `open` calls, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Waits for the next successful `open`.
    pub async fn accept(&self) -> Option<ServerEnd> {
        self.accept_rx.lock().await.recv().await
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, attempt_id: i64, token: &str) -> Result<Link, AppError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AppError::Network("server unreachable".to_string()));
        }
        let forced = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Err(AppError::Network("connection refused".to_string()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();

        let end = ServerEnd {
            attempt_id,
            token: token.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx
            .send(end)
            .map_err(|_| AppError::Network("listener gone".to_string()))?;

        Ok(Link { outgoing, incoming })
    }
}

/// Server side of one in-memory link. Dropping it closes the link.
pub struct ServerEnd {
    pub attempt_id: i64,
    pub token: String,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn send(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_raw(text),
            Err(_) => false,
        }
    }

    /// Sends an arbitrary frame, well-formed or not.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    /// Next decodable client frame; `None` once the client hangs up.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        while let Some(text) = self.from_client.recv().await {
            match serde_json::from_str(&text) {
                Ok(message) => return Some(message),
                Err(e) => tracing::debug!("Dropping undecodable client frame: {}", e),
            }
        }
        None
    }
}
