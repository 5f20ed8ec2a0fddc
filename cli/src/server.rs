//! The gateway: WebSocket endpoint, upgrade rate limiting and the upstream
//! bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};

use chainfeed_core::BlockEvent;
use chainfeed_hub::{Hub, HubError};
use chainfeed_ratelimit::{
    AdaptiveLimiter, FixedWindowLimiter, Identity, Limiter, MemoryCounterStore, Rejection,
    SlidingWindowLimiter, TokenBucketLimiter, API_KEY_HEADER,
};
use chainfeed_subscriber::ChainSubscriber;

use crate::config::{Algorithm, GatewayConfig, RateLimitConfig};

const LOAD_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Admission check applied to every upgrade request.
#[derive(Clone, Default)]
pub struct Gate {
    limiter: Option<Arc<dyn Limiter>>,
    adaptive: Option<Arc<AdaptiveLimiter>>,
    store: Option<Arc<MemoryCounterStore>>,
}

impl Gate {
    /// Build the limiter selected in `config`. Must run inside a runtime so
    /// bucket cleanup can start.
    pub fn new(config: &RateLimitConfig) -> anyhow::Result<Self> {
        let mut gate = Self::default();
        match config.algorithm {
            Algorithm::Disabled => {}
            Algorithm::TokenBucket => {
                gate.limiter = Some(Arc::new(TokenBucketLimiter::with_registry(
                    config.bucket_config(),
                    config.registry_config(),
                )));
            }
            Algorithm::Adaptive => {
                let bucket =
                    TokenBucketLimiter::with_registry(config.bucket_config(), config.registry_config());
                let adaptive = Arc::new(AdaptiveLimiter::with_bucket(bucket, config.adaptive_config()));
                gate.limiter = Some(adaptive.clone());
                gate.adaptive = Some(adaptive);
            }
            Algorithm::FixedWindow => {
                let store = Arc::new(MemoryCounterStore::new());
                gate.limiter = Some(Arc::new(
                    FixedWindowLimiter::new(store.clone(), config.window_config())
                        .context("invalid fixed window configuration")?,
                ));
                gate.store = Some(store);
            }
            Algorithm::SlidingWindow => {
                let store = Arc::new(MemoryCounterStore::new());
                gate.limiter = Some(Arc::new(
                    SlidingWindowLimiter::new(store.clone(), config.window_config())
                        .context("invalid sliding window configuration")?,
                ));
                gate.store = Some(store);
            }
        }
        Ok(gate)
    }

    pub fn limiter_name(&self) -> &'static str {
        self.limiter.as_ref().map_or("disabled", |l| l.name())
    }

    pub async fn admit(&self, identity: &Identity) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.allow(&identity.key()).await,
            None => true,
        }
    }
}

/// HTTP 429 with the JSON rejection body.
fn rejection_response() -> ErrorResponse {
    let rejection = Rejection::default();
    let mut response = ErrorResponse::new(Some(rejection.to_json()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::RETRY_AFTER, HeaderValue::from(rejection.retry_after));
    response
}

/// Upgrade one TCP connection and hand it to the hub, unless the gate
/// rejects it.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Hub, gate: Gate) {
    let runtime = Handle::current();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let credential = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        let identity = Identity::resolve(Some(peer.ip()), credential);
        // The handshake callback is synchronous; the limiter may await its store.
        let admitted = tokio::task::block_in_place(|| runtime.block_on(gate.admit(&identity)));
        if admitted {
            Ok(response)
        } else {
            tracing::warn!(
                identity = %identity,
                limiter = gate.limiter_name(),
                "upgrade rejected by rate limiter"
            );
            Err(rejection_response())
        }
    };

    let limits = hub.config().websocket_config();
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(limits));
    let ws = match tokio::time::timeout(hub.config().handshake_timeout, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, error = %e, "websocket handshake not completed");
            return;
        }
        Err(_) => {
            tracing::info!(peer = %peer, "websocket handshake timed out, dropping connection");
            return;
        }
    };
    if let Err(e) = hub.attach(ws).await {
        tracing::debug!(peer = %peer, error = %e, "hub refused connection");
    }
}

/// Forward decoded blocks into the hub until the stream ends.
async fn bridge(mut blocks: mpsc::Receiver<BlockEvent>, hub: Hub) {
    while let Some(block) = blocks.recv().await {
        match hub.broadcast_block(&block) {
            Ok(()) => {}
            Err(HubError::Closed) => break,
            Err(e) => tracing::warn!(height = block.height, error = %e, "block not broadcast"),
        }
    }
}

/// Feed the adaptive limiter with hub occupancy.
fn spawn_load_sampler(gate: &Gate, hub: Hub, capacity: usize) -> Option<JoinHandle<()>> {
    let adaptive = gate.adaptive.clone()?;
    let capacity = capacity.max(1) as f64;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOAD_SAMPLE_INTERVAL);
        loop {
            ticker.tick().await;
            match hub.client_count().await {
                Ok(clients) => adaptive.set_load(clients as f64 / capacity),
                Err(_) => break,
            }
        }
    }))
}

/// Periodically drop expired window counters.
fn spawn_store_purge(gate: &Gate, interval: Duration) -> Option<JoinHandle<()>> {
    let store = gate.store.clone()?;
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired rate limit counters removed");
            }
        }
    }))
}

/// Run the gateway until Ctrl-C or until the upstream feed gives up.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let hub = Hub::new(config.hub.hub_config());
    let coordinator = tokio::spawn({
        let hub = hub.clone();
        async move { hub.run().await }
    });

    let gate = Gate::new(&config.rate_limit)?;
    let sampler = spawn_load_sampler(&gate, hub.clone(), config.rate_limit.load_capacity);
    let purge = spawn_store_purge(&gate, config.rate_limit.registry_config().cleanup_interval);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        limiter = gate.limiter_name(),
        "gateway listening"
    );

    let mut subscriber = None;
    let mut upstream: JoinHandle<()> = if config.upstream.enabled {
        let mut sub = ChainSubscriber::new(config.upstream.subscriber_config());
        let blocks = sub.events().context("block stream already taken")?;
        sub.start()
            .await
            .with_context(|| format!("failed to subscribe to {}", config.upstream.url))?;
        subscriber = Some(sub);
        tokio::spawn(bridge(blocks, hub.clone()))
    } else {
        tracing::info!("upstream disabled, serving broadcasts from other producers only");
        tokio::spawn(futures::future::pending())
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            _ = &mut upstream => {
                tracing::error!("upstream block stream ended");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(stream, peer, hub.clone(), gate.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }

    let upstream_result = match subscriber.as_mut() {
        Some(sub) => sub.stop().await,
        None => Ok(()),
    };
    upstream.abort();
    hub.stop();
    for task in [sampler, purge].into_iter().flatten() {
        task.abort();
    }
    coordinator.await.context("hub coordinator panicked")??;

    upstream_result.context("upstream subscriber failed")?;
    tracing::info!("gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Error as WsError;

    /// Accept loop over `gate` without an upstream feed.
    async fn serve(gate: Gate) -> (Hub, String) {
        serve_with(chainfeed_hub::HubConfig::default(), gate).await
    }

    async fn serve_with(config: chainfeed_hub::HubConfig, gate: Gate) -> (Hub, String) {
        let hub = Hub::new(config);
        tokio::spawn({
            let hub = hub.clone();
            async move { hub.run().await }
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn({
            let hub = hub.clone();
            async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    tokio::spawn(handle_connection(stream, peer, hub.clone(), gate.clone()));
                }
            }
        });
        (hub, url)
    }

    fn limited(requests: u64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_window: requests,
            refill_interval_ms: Some(3_600_000),
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn over_limit_upgrade_gets_429() {
        let (hub, url) = serve(Gate::new(&limited(2)).unwrap()).await;

        let _a = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let _b = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(WsError::Http(response)) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
                let body: serde_json::Value =
                    serde_json::from_slice(response.body().as_deref().unwrap()).unwrap();
                assert_eq!(body["error"], "rate_limit_exceeded");
                assert_eq!(body["retry_after"], 60);
            }
            other => panic!("expected HTTP 429, got {:?}", other.map(|_| ())),
        }
        hub.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_key_has_its_own_budget() {
        let (hub, url) = serve(Gate::new(&limited(1)).unwrap()).await;

        let _by_ip = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static("team-a"));
        let (mut keyed, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        // The keyed client is live: it gets the server's close on shutdown.
        hub.stop();
        let closed = tokio::time::timeout(Duration::from_secs(5), keyed.next()).await;
        assert!(closed.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_gate_admits_everyone() {
        let gate = Gate::new(&RateLimitConfig {
            algorithm: Algorithm::Disabled,
            ..limited(1)
        })
        .unwrap();
        assert_eq!(gate.limiter_name(), "disabled");
        let (hub, url) = serve(gate).await;
        for _ in 0..3 {
            tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        }
        hub.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_peer_is_dropped_after_handshake_timeout() {
        use tokio::io::AsyncReadExt;

        let config = chainfeed_hub::HubConfig {
            handshake_timeout: Duration::from_millis(200),
            ..chainfeed_hub::HubConfig::default()
        };
        let (hub, url) = serve_with(config, Gate::default()).await;
        let addr = url.trim_start_matches("ws://").trim_end_matches("/ws");

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
            .await
            .expect("server kept the silent connection open");
        assert!(matches!(read, Ok(0) | Err(_)));
        hub.stop();
    }

    #[tokio::test]
    async fn gate_builds_each_algorithm() {
        for (algorithm, name) in [
            (Algorithm::TokenBucket, "token_bucket"),
            (Algorithm::FixedWindow, "fixed_window"),
            (Algorithm::SlidingWindow, "sliding_window"),
            (Algorithm::Adaptive, "adaptive"),
        ] {
            let gate = Gate::new(&RateLimitConfig {
                algorithm,
                ..RateLimitConfig::default()
            })
            .unwrap();
            assert_eq!(gate.limiter_name(), name);
            assert!(gate.admit(&Identity::Credential("k".into())).await);
        }
    }

    #[tokio::test]
    async fn bridge_forwards_blocks() {
        use chainfeed_core::Topic;
        use chainfeed_hub::{ClientHandle, TopicSet};

        let hub = Hub::new(chainfeed_hub::HubConfig::default());
        let coordinator = tokio::spawn({
            let hub = hub.clone();
            async move { hub.run().await }
        });
        let (queue, mut frames) = mpsc::channel(4);
        let topics = Arc::new(TopicSet::new());
        topics.insert(Topic::Block);
        hub.register(ClientHandle {
            id: hub.next_client_id(),
            queue,
            topics,
            token: hub.client_token(),
        })
        .await
        .unwrap();

        let (tx, rx) = mpsc::channel(4);
        let forward = tokio::spawn(bridge(rx, hub.clone()));
        let block: BlockEvent = serde_json::from_value(serde_json::json!({
            "height": 3,
            "time": "2024-05-01T12:00:00Z",
            "proposer": "A1B2C3"
        }))
        .unwrap();
        tx.send(block).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["type"], "block");
        assert_eq!(frame["data"]["height"], 3);

        drop(tx);
        forward.await.unwrap();
        hub.stop();
        coordinator.await.unwrap().unwrap();
    }
}
