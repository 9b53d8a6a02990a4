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

//! Integration tests for the REST engine using a mock Axum server.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use nautilus_ibkr::{IbkrHttpError, IbkrRawHttpClient};
use serde_json::{Value, json};

// ------------------------------------------------------------------------------------------------
// Mock server
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    slow_hits: AtomicUsize,
    always_slow_hits: AtomicUsize,
}

async fn slow(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let hit = state.slow_hits.fetch_add(1, Ordering::SeqCst);
    if hit < 3 {
        // Outlasts the client's 1s request timeout.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
    }
    Json(json!({"ok": true}))
}

async fn always_slow(State(state): State<Arc<ServerState>>) -> Json<Value> {
    state.always_slow_hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    Json(json!({"ok": true}))
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(body)
}

async fn no_bridge() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "Bad Request: no bridge")
}

async fn empty() -> &'static str {
    ""
}

async fn unavailable() -> impl IntoResponse {
    (StatusCode::SERVICE_UNAVAILABLE, "gateway restarting")
}

async fn not_json() -> &'static str {
    "<html>definitely not json</html>"
}

async fn spawn_server() -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/v1/api/slow", get(slow))
        .route("/v1/api/always-slow", get(always_slow))
        .route("/v1/api/echo", post(echo))
        .route("/v1/api/iserver/auth/ssodh/bridge", post(no_bridge))
        .route("/v1/api/empty", get(empty))
        .route("/v1/api/unavailable", get(unavailable))
        .route("/v1/api/not-json", get(not_json))
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

fn create_client(addr: SocketAddr, timeout_secs: u64, max_retries: u32) -> IbkrRawHttpClient {
    IbkrRawHttpClient::new(
        format!("http://{addr}/v1/api/"),
        None,
        false,
        timeout_secs,
        max_retries,
        true,
        false,
        None,
    )
    .expect("failed to create client")
}

// ------------------------------------------------------------------------------------------------
// Tests
// ------------------------------------------------------------------------------------------------

#[tokio::test]
async fn test_retry_on_timeout_then_success() {
    let (addr, state) = spawn_server().await;
    let client = create_client(addr, 1, 3);

    let result = client.get("slow", None).await.expect("request failed");

    assert_eq!(result.data, json!({"ok": true}));
    // Three timed-out attempts plus the successful one.
    assert_eq!(state.slow_hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_retry_exhaustion_names_method_and_url() {
    let (addr, state) = spawn_server().await;
    let client = create_client(addr, 1, 3);

    let err = client
        .get("always-slow", None)
        .await
        .expect_err("expected retry exhaustion");

    assert!(matches!(err, IbkrHttpError::MaxRetriesReached { .. }));
    let message = err.to_string();
    assert!(message.contains("reached max retries (3)"));
    assert!(message.contains("GET"));
    assert!(message.contains(&format!("http://{addr}/v1/api/always-slow")));
    assert_eq!(state.always_slow_hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_no_bridge_rewritten_with_hint() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let err = client
        .post("iserver/auth/ssodh/bridge", None)
        .await
        .expect_err("expected 400");

    assert_eq!(err.status_code(), Some(400));
    assert!(err.to_string().contains("initialize_brokerage_session()"));
}

#[tokio::test]
async fn test_null_entries_elided_from_body() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let body = json!({
        "acctId": "DU123",
        "conid": null,
        "order": {"tif": "DAY", "price": null},
    });
    let result = client.post("echo", Some(&body)).await.expect("request failed");

    // The echo returns exactly what went over the wire.
    assert_eq!(
        result.data,
        json!({"acctId": "DU123", "order": {"tif": "DAY"}})
    );
}

#[tokio::test]
async fn test_empty_body_yields_null_data() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let result = client.get("empty", None).await.expect("request failed");

    assert_eq!(result.data, Value::Null);
}

#[tokio::test]
async fn test_error_status_carries_code_and_body() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let err = client
        .get("unavailable", None)
        .await
        .expect_err("expected 503");

    assert_eq!(err.status_code(), Some(503));
    assert!(err.to_string().contains("gateway restarting"));
}

#[tokio::test]
async fn test_invalid_json_is_external_broker_error() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let err = client
        .get("not-json", None)
        .await
        .expect_err("expected JSON failure");

    assert!(matches!(err, IbkrHttpError::ExternalBroker { .. }));
    assert!(err.to_string().contains("invalid JSON"));
}

#[tokio::test]
async fn test_request_snapshot_echoes_envelope() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let body = json!({"orders": [{"conid": 265598}]});
    let result = client.post("echo", Some(&body)).await.expect("request failed");

    assert_eq!(result.request.method, "POST");
    assert!(result.request.url.ends_with("/v1/api/echo"));
    assert_eq!(result.request.body, Some(body));
}

#[tokio::test]
async fn test_leading_slash_normalized() {
    let (addr, _state) = spawn_server().await;
    let client = create_client(addr, 5, 0);

    let result = client.get("/empty", None).await.expect("request failed");

    assert!(result.request.url.ends_with("/v1/api/empty"));
}
