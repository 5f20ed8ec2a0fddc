//! Hub tests over real WebSocket connections.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainfeed_core::Topic;
use chainfeed_hub::{Hub, HubConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Start a hub and an accept loop; returns the hub and its ws:// URL.
async fn serve(config: HubConfig) -> (Hub, String) {
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
            while let Ok((stream, _)) = listener.accept().await {
                let hub = hub.clone();
                let limits = hub.config().websocket_config();
                tokio::spawn(async move {
                    if let Ok(ws) =
                        tokio_tungstenite::accept_async_with_config(stream, Some(limits)).await
                    {
                        let _ = hub.attach(ws).await;
                    }
                });
            }
        }
    });
    (hub, url)
}

async fn connect(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping transport pings and pongs.
async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

/// Round-trip a ping so every earlier control frame has been applied.
async fn sync(ws: &mut Client) {
    send(ws, json!({"type": "ping"})).await;
    assert_eq!(next_json(ws).await["type"], "pong");
}

async fn subscribe(ws: &mut Client, topic: &str) {
    send(ws, json!({"type": "subscribe", "data": {"type": topic}})).await;
    sync(ws).await;
}

async fn wait_for_count(hub: &Hub, expected: usize) {
    timeout(WAIT, async {
        loop {
            if hub.client_count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client count never reached {expected}"));
}

/// Wait for the server to close the connection.
async fn expect_closed(ws: &mut Client) {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("connection was not closed");
}

#[tokio::test]
async fn registration_and_unregistration() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect(&url).await);
    }
    wait_for_count(&hub, 3).await;

    let mut gone = clients.pop().unwrap();
    gone.close(None).await.unwrap();
    wait_for_count(&hub, 2).await;

    drop(clients);
    wait_for_count(&hub, 0).await;
    hub.stop();
}

#[tokio::test]
async fn topic_isolation() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut blocks = connect(&url).await;
    let mut txs = connect(&url).await;
    subscribe(&mut blocks, "block").await;
    subscribe(&mut txs, "transaction").await;
    wait_for_count(&hub, 2).await;

    hub.broadcast_transaction(&json!({"hash": "T1"})).unwrap();
    hub.broadcast(Topic::Block, &json!({"height": 9})).unwrap();

    let frame = next_json(&mut blocks).await;
    assert_eq!(frame["type"], "block");
    assert_eq!(frame["data"]["height"], 9);
    assert!(frame["timestamp"].is_string());

    let frame = next_json(&mut txs).await;
    assert_eq!(frame["type"], "transaction");
    assert_eq!(frame["data"]["hash"], "T1");

    // Neither client saw the other's topic.
    sync(&mut blocks).await;
    sync(&mut txs).await;
    hub.stop();
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut ws = connect(&url).await;
    subscribe(&mut ws, "dex_swap").await;
    subscribe(&mut ws, "oracle_price").await;

    hub.broadcast_dex_swap(&json!({"n": 1})).unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "dex_swap");

    send(&mut ws, json!({"type": "unsubscribe", "data": {"Type": "dex_swap"}})).await;
    sync(&mut ws).await;

    hub.broadcast_dex_swap(&json!({"n": 2})).unwrap();
    hub.broadcast_oracle_price(&json!({"n": 3})).unwrap();
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "oracle_price");
    assert_eq!(frame["data"]["n"], 3);
    hub.stop();
}

#[tokio::test]
async fn ping_gets_exactly_one_pong() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut ws = connect(&url).await;
    send(&mut ws, json!({"type": "ping"})).await;
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_string());

    subscribe(&mut ws, "event").await;
    hub.broadcast_event(&json!({"kind": "transfer"})).unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "event");
    hub.stop();
}

#[tokio::test]
async fn malformed_control_frames_are_ignored() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut ws = connect(&url).await;
    ws.send(Message::Text("not json".into())).await.unwrap();
    send(&mut ws, json!({"type": "subscribe", "data": {"type": "blocks"}})).await;
    sync(&mut ws).await;
    assert_eq!(hub.client_count().await.unwrap(), 1);
    hub.stop();
}

#[tokio::test]
async fn oversized_frame_drops_client() {
    let (hub, url) = serve(HubConfig {
        max_message_size: 64,
        ..HubConfig::default()
    })
    .await;
    let mut ws = connect(&url).await;
    wait_for_count(&hub, 1).await;
    ws.send(Message::Text("x".repeat(65))).await.unwrap();
    expect_closed(&mut ws).await;
    wait_for_count(&hub, 0).await;
    hub.stop();
}

#[tokio::test]
async fn oversized_binary_frame_hits_read_limit() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut ws = connect(&url).await;
    wait_for_count(&hub, 1).await;
    // Binary frames are never parsed as control frames; only the socket
    // limit can drop this client.
    let _ = ws.send(Message::Binary(vec![0u8; 64 * 1024])).await;
    expect_closed(&mut ws).await;
    wait_for_count(&hub, 0).await;
    hub.stop();
}

#[tokio::test]
async fn concurrent_broadcasts_reach_all_clients() {
    const CLIENTS: usize = 50;
    const MESSAGES: usize = 100;

    let (hub, url) = serve(HubConfig::default()).await;
    let mut clients = Vec::with_capacity(CLIENTS);
    for _ in 0..CLIENTS {
        let mut ws = connect(&url).await;
        subscribe(&mut ws, "block").await;
        clients.push(ws);
    }
    wait_for_count(&hub, CLIENTS).await;

    let producers: Vec<_> = (0..10)
        .map(|p| {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..MESSAGES / 10 {
                    hub.broadcast(Topic::Block, &json!({"producer": p, "i": i}))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let readers: Vec<_> = clients
        .into_iter()
        .map(|mut ws| {
            tokio::spawn(async move {
                for _ in 0..MESSAGES {
                    assert_eq!(next_json(&mut ws).await["type"], "block");
                }
            })
        })
        .collect();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(hub.client_count().await.unwrap(), CLIENTS);
    hub.stop();
}

#[tokio::test]
async fn heartbeat_pings_clients() {
    let (hub, url) = serve(HubConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..HubConfig::default()
    })
    .await;
    let mut ws = connect(&url).await;
    let got_ping = timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Ping(_))) = ws.next().await {
                return true;
            }
        }
    })
    .await
    .unwrap();
    assert!(got_ping);
    hub.stop();
}

#[tokio::test]
async fn silent_client_times_out() {
    let (hub, url) = serve(HubConfig {
        pong_timeout: Duration::from_millis(150),
        ..HubConfig::default()
    })
    .await;
    let mut ws = connect(&url).await;
    expect_closed(&mut ws).await;
    wait_for_count(&hub, 0).await;
    hub.stop();
}

#[tokio::test]
async fn stop_disconnects_every_client() {
    let (hub, url) = serve(HubConfig::default()).await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect(&url).await);
    }
    wait_for_count(&hub, 5).await;

    hub.stop();
    for ws in &mut clients {
        expect_closed(ws).await;
    }
    assert!(hub.client_count().await.is_err());
}
