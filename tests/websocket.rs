// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2026 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Integration tests for the WebSocket engine using a mock Axum server.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use nautilus_ibkr::{
    IbkrWsClient, IbkrWsKey,
    config::IbkrWsConfig,
    websocket::ConnectionMode,
};
use serde_json::json;

// ------------------------------------------------------------------------------------------------
// Mock server
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    connections: AtomicUsize,
    frames: Mutex<Vec<(usize, String)>>,
    /// Drop the first connection right after its first subscribe frame.
    close_first_on_subscribe: AtomicBool,
    /// Echo a channel data frame back for every subscribe, confirming it.
    confirm_subscriptions: AtomicBool,
}

impl ServerState {
    fn frames_on(&self, connection: usize, payload: &str) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(conn, frame)| *conn == connection && frame == payload)
            .count()
    }

    fn frames_matching(&self, payload: &str) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, frame)| frame == payload)
            .count()
    }
}

/// Extracts `md+265598` from `smd+265598+{"fields":...}` or `smd+265598`.
fn channel_of(payload: &str) -> &str {
    let body = &payload[1..];
    match body.find("+{") {
        Some(idx) => &body[..idx],
        None => body,
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);

    // Heartbeat marks the client ready.
    let _ = socket
        .send(Message::Text(
            json!({"topic": "system", "hb": 1_700_000_000_000_i64}).to_string(),
        ))
        .await;

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                state.frames.lock().unwrap().push((connection, text.clone()));

                if text.starts_with('s') {
                    if state.confirm_subscriptions.load(Ordering::SeqCst) {
                        let channel = channel_of(&text);
                        let conid = channel.split_once('+').map_or("0", |(_, c)| c);
                        for seq in 1..=2 {
                            let frame = json!({
                                "topic": format!("s{channel}"),
                                "conid": conid.parse::<i64>().unwrap_or_default(),
                                "seq": seq,
                            });
                            let _ = socket.send(Message::Text(frame.to_string())).await;
                        }
                    }

                    if connection == 0
                        && state.close_first_on_subscribe.load(Ordering::SeqCst)
                    {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_server() -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/v1/api/ws", get(ws_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("failed to read local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server failed");
    });

    (addr, state)
}

fn create_client(addr: SocketAddr) -> IbkrWsClient {
    let config = IbkrWsConfig {
        ws_url: Some(format!("ws://{addr}/v1/api/ws")),
        timeout_secs: 5,
        subscription_retries: 2,
        subscription_timeout_secs: 0.5,
        ping_interval_secs: 45,
        ..Default::default()
    };
    IbkrWsClient::new(config, None).expect("failed to create client")
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_subscription_replay_after_forced_close() {
    let (addr, state) = spawn_server().await;
    state.close_first_on_subscribe.store(true, Ordering::SeqCst);

    let client = create_client(addr);
    client.start().await.expect("start failed");

    let subscribed = client
        .subscribe(
            "md+265598",
            Some(json!({"fields": ["31", "84", "86"]})),
            Some(false),
            None,
        )
        .await;
    assert!(subscribed);

    let expected = r#"smd+265598+{"fields":["31","84","86"]}"#;

    // The server drops connection 0 after the subscribe; the engine must
    // reconnect and replay exactly one subscribe frame with the stored data.
    assert!(
        wait_for(
            || state.connections.load(Ordering::SeqCst) >= 2
                && state.frames_on(1, expected) >= 1,
            Duration::from_secs(10),
        )
        .await,
        "no replayed subscribe frame observed"
    );

    // Allow any (incorrect) duplicates to arrive before counting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state.frames_on(1, expected), 1);
    assert!(client.is_subscription_active("md+265598"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_confirmation_timeout_returns_false_after_three_sends() {
    let (addr, state) = spawn_server().await;
    // Never confirm anything.

    let client = create_client(addr);
    client.start().await.expect("start failed");

    let subscribed = client.subscribe("sd+1234", None, Some(true), None).await;

    assert!(!subscribed);
    // retries = 2 means three identical sends in total.
    assert_eq!(state.frames_matching("ssd+1234"), 3);
    assert!(!client.is_subscription_active("sd+1234"));

    client.shutdown().await;
}

#[tokio::test]
async fn test_confirmed_subscribe_routes_to_queue_in_order() {
    let (addr, state) = spawn_server().await;
    state.confirm_subscriptions.store(true, Ordering::SeqCst);

    let client = create_client(addr);
    client.start().await.expect("start failed");

    let subscribed = client
        .subscribe("md+265598", Some(json!({"fields": ["31"]})), None, None)
        .await;
    assert!(subscribed);

    let first = client
        .get(IbkrWsKey::MarketData, true, Some(Duration::from_secs(2)))
        .await
        .expect("no first update");
    let second = client
        .get(IbkrWsKey::MarketData, true, Some(Duration::from_secs(2)))
        .await
        .expect("no second update");

    assert_eq!(first["265598"]["seq"], 1);
    assert_eq!(second["265598"]["seq"], 2);

    client.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_leaves_registry_empty() {
    let (addr, state) = spawn_server().await;
    state.confirm_subscriptions.store(true, Ordering::SeqCst);

    let client = create_client(addr);
    client.start().await.expect("start failed");

    assert!(
        client
            .subscribe("md+265598", Some(json!({"fields": ["31"]})), None, None)
            .await
    );
    // Market data unsubscriptions are not confirmed by the gateway.
    assert!(
        client
            .unsubscribe("md+265598", Some(json!({"fields": ["31"]})), None, None)
            .await
    );

    assert!(!client.has_subscription("md+265598"));
    assert_eq!(state.frames_matching(r#"umd+265598+{"fields":["31"]}"#), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_ready_on_heartbeat_and_clean_shutdown() {
    let (addr, _state) = spawn_server().await;

    let client = create_client(addr);
    client.start().await.expect("start failed");

    assert!(
        wait_for(|| client.is_ready(), Duration::from_secs(5)).await,
        "client never became ready"
    );

    client.shutdown().await;
    assert_eq!(client.connection_mode(), ConnectionMode::Closed);
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_hard_reset_reconnects() {
    let (addr, state) = spawn_server().await;

    let client = create_client(addr);
    client.start().await.expect("start failed");
    assert!(wait_for(|| client.is_ready(), Duration::from_secs(5)).await);

    client.hard_reset(true);

    assert!(
        wait_for(
            || state.connections.load(Ordering::SeqCst) >= 2 && client.is_ready(),
            Duration::from_secs(10),
        )
        .await,
        "client did not reconnect after hard reset"
    );

    client.shutdown().await;
}
