// src/channel/transport.rs

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::AppError;

/// One open connection, as a pair of text-frame queues.
///
/// The link is closed when `incoming` yields `None` or a send on
/// `outgoing` fails. Dropping the `Link` closes it from the client side.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens checkpoint links for an attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, attempt_id: i64, token: &str) -> Result<Link, AppError>;
}

/// WebSocket transport against `{base}/api/v1/ws/attempts/{id}?token=...`.
pub struct WebSocketTransport {
    base: Url,
}

impl WebSocketTransport {
    pub fn new(ws_base_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            base: Url::parse(ws_base_url)?,
        })
    }

    pub fn attempt_url(&self, attempt_id: i64, token: &str) -> Result<Url, AppError> {
        let mut url = self
            .base
            .join(&format!("api/v1/ws/attempts/{}", attempt_id))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, attempt_id: i64, token: &str) -> Result<Link, AppError> {
        let url = self.attempt_url(attempt_id, token)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        tracing::debug!("WebSocket opened for attempt {}", attempt_id);

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
