//! Per-connection tasks.
//!
//! A connection moves through `connecting → registered → active →
//! unregistering → closed`. Once registered it runs a writer and a reader:
//!
//! - the writer drains the outbound queue into text frames and pings every
//!   heartbeat interval;
//! - the reader applies control frames to the client's topic set and answers
//!   `ping` with `pong`.
//!
//! Either task ending cancels the client token, which stops the other. The
//! connection then unregisters from the hub exactly once.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::hub::{ClientHandle, ClientId, Hub};
use crate::message::{pong_frame, ControlFrame, Frame};
use crate::topics::TopicSet;

/// A live client connection.
#[derive(Debug)]
pub struct Connection {
    id: ClientId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Wait until both tasks have exited and the client is unregistered.
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

impl Hub {
    /// Register an upgraded WebSocket and spawn its reader and writer.
    pub async fn attach<S>(&self, ws: WebSocketStream<S>) -> Result<Connection, HubError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config().clone();
        let id = self.next_client_id();
        let token = self.client_token();
        let topics = Arc::new(TopicSet::new());
        let (queue, outbound) = mpsc::channel(config.client_queue_capacity.max(1));

        self.register(ClientHandle {
            id,
            queue: queue.clone(),
            topics: Arc::clone(&topics),
            token: token.clone(),
        })
        .await?;
        tracing::info!(client = %id, "client connected");

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(write_loop(id, sink, outbound, token.clone(), config.clone()));
        let reader = tokio::spawn(read_loop(id, stream, queue, topics, token.clone(), config));

        let hub = self.clone();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                let (written, read) = tokio::join!(writer, reader);
                report_exit(id, "writer", written);
                report_exit(id, "reader", read);
                token.cancel();
                if let Err(e) = hub.unregister(id).await {
                    tracing::debug!(client = %id, error = %e, "unregister skipped");
                }
                tracing::info!(client = %id, "client disconnected");
            }
        });

        Ok(Connection { id, token, task })
    }
}

/// Log a reader or writer that panicked or was aborted. Returns `true` on a
/// clean exit.
fn report_exit(id: ClientId, task: &'static str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(client = %id, task, error = %e, "connection task failed");
            false
        }
    }
}

async fn write_loop<S>(
    id: ClientId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    token: CancellationToken,
    config: HubConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut heartbeat = time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.to_string()),
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Vec::new()),
        };
        match time::timeout(config.write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(client = %id, error = %e, "write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(client = %id, "write timed out");
                break;
            }
        }
    }

    token.cancel();
    // Sends the close frame.
    let _ = time::timeout(config.write_timeout, sink.close()).await;
}

async fn read_loop<S>(
    id: ClientId,
    mut stream: SplitStream<WebSocketStream<S>>,
    queue: mpsc::Sender<Frame>,
    topics: Arc<TopicSet>,
    token: CancellationToken,
    config: HubConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = time::timeout(config.pong_timeout, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                tracing::info!(client = %id, "no frames within pong timeout, dropping client");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(client = %id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        let Message::Text(text) = msg else {
            continue;
        };
        // Socket read limits reject oversized frames first.
        if text.len() > config.max_message_size {
            tracing::warn!(client = %id, size = text.len(), "control frame too large, dropping client");
            break;
        }
        handle_control(id, &text, &queue, &topics);
    }

    token.cancel();
}

fn handle_control(id: ClientId, text: &str, queue: &mpsc::Sender<Frame>, topics: &TopicSet) {
    match ControlFrame::parse(text) {
        Ok(ControlFrame::Subscribe { data }) => {
            topics.insert(data.topic);
            tracing::debug!(client = %id, topic = %data.topic, "subscribed");
        }
        Ok(ControlFrame::Unsubscribe { data }) => {
            topics.remove(data.topic);
            tracing::debug!(client = %id, topic = %data.topic, "unsubscribed");
        }
        Ok(ControlFrame::Ping) => match queue.try_send(pong_frame()) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(client = %id, "outbound queue full, pong dropped");
            }
        },
        Err(e) => {
            tracing::warn!(client = %id, error = %e, "ignoring malformed control frame");
        }
    }
}
