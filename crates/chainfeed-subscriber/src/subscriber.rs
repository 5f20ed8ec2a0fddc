//! Upstream subscriber with reconnect.
//!
//! [`ChainSubscriber::start`] dials the node, sends the subscription request
//! and hands the socket to a background listen task. The task decodes block
//! notifications onto a bounded queue and, when the socket drops, reconnects
//! with exponential backoff. Exhausting the attempt budget ends the task with
//! [`SubscriberError::ReconnectExhausted`] and closes the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use chainfeed_core::BlockEvent;

use crate::backoff::ReconnectPolicy;
use crate::config::SubscriberConfig;
use crate::error::SubscriberError;
use crate::parse::{decode_frame, subscribe_request};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the read loop returned.
enum Disconnect {
    Cancelled,
    ReceiverGone,
    Lost(String),
}

/// Live subscription to new blocks on an upstream node.
pub struct ChainSubscriber {
    config: SubscriberConfig,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
    events_tx: Option<mpsc::Sender<BlockEvent>>,
    events_rx: Option<mpsc::Receiver<BlockEvent>>,
    task: Option<JoinHandle<Result<(), SubscriberError>>>,
}

impl ChainSubscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            config,
            cancel: CancellationToken::new(),
            connected: Arc::new(AtomicBool::new(false)),
            events_tx: Some(tx),
            events_rx: Some(rx),
            task: None,
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Connect, subscribe and spawn the listen task.
    ///
    /// A failed first connection is returned to the caller; reconnects only
    /// apply once the subscription has been established.
    pub async fn start(&mut self) -> Result<(), SubscriberError> {
        if self.events_tx.is_none() {
            return Err(SubscriberError::AlreadyStarted);
        }
        let ws = connect(&self.config).await?;
        let Some(tx) = self.events_tx.take() else {
            return Err(SubscriberError::AlreadyStarted);
        };
        self.connected.store(true, Ordering::Relaxed);

        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let connected = Arc::clone(&self.connected);
        self.task = Some(tokio::spawn(async move {
            let result = listen(ws, tx, &config, &cancel, &connected).await;
            connected.store(false, Ordering::Relaxed);
            result
        }));
        Ok(())
    }

    /// Take the decoded block stream. Returns `None` after the first call.
    ///
    /// The stream ends when the subscriber stops or gives up reconnecting.
    pub fn events(&mut self) -> Option<mpsc::Receiver<BlockEvent>> {
        self.events_rx.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Cancel the listen task, close the socket and wait for the task to
    /// finish. Returns how the task ended; later calls return `Ok(())`.
    pub async fn stop(&mut self) -> Result<(), SubscriberError> {
        self.cancel.cancel();
        // A subscriber that never started must not be startable afterwards.
        self.events_tx.take();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| SubscriberError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ChainSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dial the node and send the subscription request.
async fn connect(config: &SubscriberConfig) -> Result<WsStream, SubscriberError> {
    tracing::info!(url = %config.url, "connecting to upstream node");
    let (mut ws, _) = time::timeout(config.handshake_timeout, connect_async(config.url.as_str()))
        .await
        .map_err(|_| SubscriberError::HandshakeTimeout {
            url: config.url.clone(),
            ms: config.handshake_timeout.as_millis() as u64,
        })?
        .map_err(|e| SubscriberError::Connect {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

    let request = subscribe_request(&config.query).to_string();
    ws.send(Message::Text(request))
        .await
        .map_err(|e| SubscriberError::Subscribe(e.to_string()))?;
    tracing::info!(url = %config.url, query = %config.query, "subscribed to upstream events");
    Ok(ws)
}

async fn listen(
    mut ws: WsStream,
    tx: mpsc::Sender<BlockEvent>,
    config: &SubscriberConfig,
    cancel: &CancellationToken,
    connected: &AtomicBool,
) -> Result<(), SubscriberError> {
    let policy = ReconnectPolicy::new(config.backoff.clone());

    loop {
        let reason = match read_until_disconnect(&mut ws, &tx, cancel).await {
            Disconnect::Cancelled => {
                let _ = ws.close(None).await;
                tracing::info!(url = %config.url, "subscriber stopped");
                return Ok(());
            }
            Disconnect::ReceiverGone => {
                let _ = ws.close(None).await;
                tracing::info!(url = %config.url, "event receiver dropped, stopping subscriber");
                return Ok(());
            }
            Disconnect::Lost(reason) => reason,
        };
        connected.store(false, Ordering::Relaxed);

        if !config.reconnect {
            tracing::warn!(url = %config.url, reason = %reason, "upstream connection lost");
            return Err(SubscriberError::Disconnected(reason));
        }
        tracing::warn!(url = %config.url, reason = %reason, "upstream connection lost, reconnecting");

        match reconnect(config, &policy, cancel).await? {
            Some(next) => {
                ws = next;
                connected.store(true, Ordering::Relaxed);
            }
            None => return Ok(()),
        }
    }
}

/// Retry [`connect`] per `policy`. `Ok(None)` means cancelled.
async fn reconnect(
    config: &SubscriberConfig,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> Result<Option<WsStream>, SubscriberError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let Some(delay) = policy.next_delay(attempt) else {
            let attempts = attempt - 1;
            tracing::error!(url = %config.url, attempts, "reconnect attempts exhausted, giving up");
            return Err(SubscriberError::ReconnectExhausted { attempts });
        };
        tracing::info!(
            url = %config.url,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            "waiting before reconnect"
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = async {
                time::sleep(delay).await;
                connect(config).await
            } => result,
        };
        match result {
            Ok(ws) => {
                tracing::info!(url = %config.url, attempt, "reconnected to upstream");
                return Ok(Some(ws));
            }
            Err(e) => {
                tracing::warn!(url = %config.url, attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
}

async fn read_until_disconnect(
    ws: &mut WsStream,
    tx: &mpsc::Sender<BlockEvent>,
    cancel: &CancellationToken,
) -> Disconnect {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Disconnect::Cancelled,
            msg = ws.next() => msg,
        };
        match msg {
            None => return Disconnect::Lost("stream ended".into()),
            Some(Err(e)) => return Disconnect::Lost(e.to_string()),
            Some(Ok(Message::Text(text))) => {
                let Some(block) = decode_frame(&text) else {
                    continue;
                };
                tracing::debug!(height = block.height, txs = block.tx_count(), "new block");
                tokio::select! {
                    _ = cancel.cancelled() => return Disconnect::Cancelled,
                    sent = tx.send(block) => {
                        if sent.is_err() {
                            return Disconnect::ReceiverGone;
                        }
                    }
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                if let Err(e) = ws.send(Message::Pong(payload)).await {
                    return Disconnect::Lost(e.to_string());
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| format!("closed by peer: {}", f.reason))
                    .unwrap_or_else(|| "closed by peer".into());
                return Disconnect::Lost(reason);
            }
            Some(Ok(_)) => {}
        }
    }
}
