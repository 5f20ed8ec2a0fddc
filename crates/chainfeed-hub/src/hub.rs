//! The broadcast coordinator.
//!
//! One task owns the client registry and consumes a bounded command queue.
//! Registration, removal, fan-out and counting all happen there, so the
//! registry has a single writer and needs no lock. Fan-out never waits on a
//! client: each delivery is a `try_send`, and a client whose queue is full is
//! cancelled and dropped from the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use chainfeed_core::{BlockEvent, ChainEvent, Topic};

use crate::config::HubConfig;
use crate::error::HubError;
use crate::message::{BroadcastMessage, Frame};
use crate::topics::TopicSet;

/// Process-unique client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// The coordinator's view of one client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    /// Outbound queue drained by the client's writer.
    pub queue: mpsc::Sender<Frame>,
    pub topics: Arc<TopicSet>,
    /// Cancelled when the client must disconnect.
    pub token: CancellationToken,
}

enum Command {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Arc<BroadcastMessage>),
    ClientCount(oneshot::Sender<usize>),
}

/// Registry owned by the coordinator task.
#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientHandle>,
}

impl Registry {
    fn register(&mut self, client: ClientHandle) {
        tracing::debug!(client = %client.id, "client registered");
        self.clients.insert(client.id, client);
    }

    /// Remove a client. Returns `false` if it was already gone.
    fn unregister(&mut self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some(client) => {
                client.token.cancel();
                tracing::debug!(client = %id, "client unregistered");
                true
            }
            None => false,
        }
    }

    /// Deliver to every subscriber of the message's topic without waiting.
    /// Returns the number of clients the frame was queued for.
    fn fan_out(&mut self, msg: &BroadcastMessage) -> usize {
        let mut delivered = 0;
        let mut evicted = Vec::new();
        for (id, client) in &self.clients {
            if !client.topics.contains(msg.topic) {
                continue;
            }
            match client.queue.try_send(Frame::clone(&msg.frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        client = %id,
                        topic = %msg.topic,
                        "client queue full, disconnecting slow consumer"
                    );
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }
        for id in evicted {
            self.unregister(id);
        }
        delivered
    }

    fn shutdown(&mut self) {
        for (_, client) in self.clients.drain() {
            client.token.cancel();
        }
    }
}

struct Inner {
    config: HubConfig,
    commands: mpsc::Sender<Command>,
    mailbox: Mutex<Option<mpsc::Receiver<Command>>>,
    token: CancellationToken,
    next_id: AtomicU64,
}

/// Cloneable handle to a broadcast hub.
///
/// ```no_run
/// # async fn demo() -> Result<(), chainfeed_hub::HubError> {
/// use chainfeed_hub::{Hub, HubConfig};
///
/// let hub = Hub::new(HubConfig::default());
/// tokio::spawn({
///     let hub = hub.clone();
///     async move { hub.run().await }
/// });
/// hub.broadcast_transaction(&serde_json::json!({"hash": "ABC"}))?;
/// hub.stop();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (commands, mailbox) = mpsc::channel(config.command_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                commands,
                mailbox: Mutex::new(Some(mailbox)),
                token: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Run the coordinator until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), HubError> {
        let mut mailbox = self
            .inner
            .mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(HubError::AlreadyRunning)?;
        let mut registry = Registry::default();
        tracing::info!("hub coordinator started");

        loop {
            let command = tokio::select! {
                _ = self.inner.token.cancelled() => break,
                command = mailbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                Command::Register(client) => registry.register(client),
                Command::Unregister(id) => {
                    registry.unregister(id);
                }
                Command::Broadcast(msg) => {
                    let delivered = registry.fan_out(&msg);
                    tracing::trace!(topic = %msg.topic, delivered, "broadcast fanned out");
                }
                Command::ClientCount(reply) => {
                    let _ = reply.send(registry.clients.len());
                }
            }
        }

        let clients = registry.clients.len();
        registry.shutdown();
        mailbox.close();
        tracing::info!(clients, "hub coordinator stopped");
        Ok(())
    }

    /// Stop the coordinator and disconnect every client. Idempotent.
    pub fn stop(&self) {
        self.inner.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Allocate an id for a new client.
    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Token for a new client; cancelled when the hub stops.
    pub fn client_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    async fn submit(&self, command: Command) -> Result<(), HubError> {
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(HubError::Closed),
            sent = self.inner.commands.send(command) => sent.map_err(|_| HubError::Closed),
        }
    }

    /// Admit a client. Waits for mailbox space.
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.submit(Command::Register(client)).await
    }

    /// Remove a client. Removing an unknown client is a no-op.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.submit(Command::Unregister(id)).await
    }

    /// Number of registered clients, as seen by the coordinator.
    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (reply, count) = oneshot::channel();
        self.submit(Command::ClientCount(reply)).await?;
        count.await.map_err(|_| HubError::Closed)
    }

    /// Queue `payload` for every subscriber of `topic`.
    ///
    /// Never waits: if the mailbox is full the broadcast is dropped and
    /// [`HubError::Backlogged`] returned.
    pub fn broadcast(&self, topic: Topic, payload: &Value) -> Result<(), HubError> {
        if self.is_stopped() {
            return Err(HubError::Closed);
        }
        let msg = Arc::new(BroadcastMessage::new(topic, payload)?);
        match self.inner.commands.try_send(Command::Broadcast(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(topic = %topic, "hub mailbox full, dropping broadcast");
                Err(HubError::Backlogged { topic })
            }
            Err(TrySendError::Closed(_)) => Err(HubError::Closed),
        }
    }

    pub fn broadcast_block(&self, block: &BlockEvent) -> Result<(), HubError> {
        self.broadcast(Topic::Block, &serde_json::to_value(block)?)
    }

    pub fn broadcast_transaction(&self, tx: &Value) -> Result<(), HubError> {
        self.broadcast(Topic::Transaction, tx)
    }

    pub fn broadcast_event(&self, event: &Value) -> Result<(), HubError> {
        self.broadcast(Topic::Event, event)
    }

    pub fn broadcast_dex_swap(&self, swap: &Value) -> Result<(), HubError> {
        self.broadcast(Topic::DexSwap, swap)
    }

    pub fn broadcast_oracle_price(&self, price: &Value) -> Result<(), HubError> {
        self.broadcast(Topic::OraclePrice, price)
    }

    /// Broadcast a [`ChainEvent`] on its own topic.
    pub fn publish(&self, event: &ChainEvent) -> Result<(), HubError> {
        self.broadcast(event.topic(), &event.to_payload()?)
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.inner.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
