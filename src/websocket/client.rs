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

//! WebSocket client for the IBKR Client Portal Web API.
//!
//! The [`IbkrWsClient`] runs a single I/O task owning the socket. Inbound
//! frames are routed through the subscription registry into per-topic queues;
//! outbound payloads go through a channel so callers never touch the sink.
//! The connection self-heals: unexpected closes and stale pings re-enter the
//! connecting state (bounded by `max_connection_attempts`), and every
//! reconnect replays the registry's desired subscriptions.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::tungstenite::{
    Message, client::IntoClientRequest, handshake::client::Request, http,
};
use tokio_util::sync::CancellationToken;
use ustr::Ustr;

use super::{
    error::{IbkrWsError, IbkrWsResult},
    messages::{IbkrWsKey, ParsedFrame, parse_raw_frame},
    queue::QueueHub,
    subscription::{
        IbkrSubscriptionProcessor, Subscription, SubscriptionProcessor, SubscriptionRegistry,
        SubscriptionUpdate,
    },
    tls::build_connector,
};
use crate::{
    client::IbkrHttpClient, common::consts::IBKR_GATEWAY_WS_USER_AGENT, config::IbkrWsConfig,
};

/// Pluggable pure transformation applied to market-data frames before enqueue.
pub type MarketDataUnwrapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionMode {
    /// Not yet started.
    Idle = 0,
    /// Establishing the socket.
    Connecting = 1,
    /// Socket open, awaiting the first system frame.
    Connected = 2,
    /// First system frame received; fully operational.
    Ready = 3,
    /// Tearing down.
    Disconnecting = 4,
    /// Terminal state.
    Closed = 5,
}

impl ConnectionMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Ready,
            4 => Self::Disconnecting,
            5 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SessionExit {
    Shutdown,
    Reset,
    Closed,
    Stale,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Waits until `condition` holds, polling, up to `timeout`.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return condition();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Self-healing WebSocket client with a confirmation-driven subscription
/// controller and per-topic queues.
#[derive(Clone)]
pub struct IbkrWsClient {
    config: Arc<IbkrWsConfig>,
    url: String,
    rest: Option<IbkrHttpClient>,
    registry: Arc<SubscriptionRegistry>,
    queues: QueueHub,
    processor: Arc<dyn SubscriptionProcessor>,
    unsolicited_to_queue: Arc<Vec<IbkrWsKey>>,
    market_data_unwrapper: Option<MarketDataUnwrapper>,
    mode: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    authenticated: Arc<AtomicBool>,
    last_pong_ms: Arc<AtomicU64>,
    last_heartbeat_ms: Arc<AtomicU64>,
    out_tx: Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>>,
    reset: Arc<Notify>,
    cancel: CancellationToken,
    task: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
    op_lock: Arc<tokio::sync::Mutex<()>>,
    server_id_conids: Arc<DashMap<String, Option<String>>>,
}

impl std::fmt::Debug for IbkrWsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbkrWsClient")
            .field("url", &self.url)
            .field("mode", &self.connection_mode())
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl IbkrWsClient {
    /// Creates a new [`IbkrWsClient`] instance.
    ///
    /// The REST client, when provided, supplies the session cookie on connect
    /// and the brokerage-session probe for [`Self::check_health`].
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be resolved or the CA bundle is
    /// missing.
    pub fn new(config: IbkrWsConfig, rest: Option<IbkrHttpClient>) -> anyhow::Result<Self> {
        let url = config.resolved_url()?;
        if let Some(path) = &config.cacert {
            anyhow::ensure!(
                path.exists(),
                "cacert path does not exist: {}",
                path.display()
            );
        }

        Ok(Self {
            config: Arc::new(config),
            url,
            rest,
            registry: Arc::new(SubscriptionRegistry::new()),
            queues: QueueHub::new(),
            processor: Arc::new(IbkrSubscriptionProcessor),
            unsolicited_to_queue: Arc::new(Vec::new()),
            market_data_unwrapper: None,
            mode: Arc::new(AtomicU8::new(ConnectionMode::Idle as u8)),
            running: Arc::new(AtomicBool::new(false)),
            // True by default for gateways that never send auth frames.
            authenticated: Arc::new(AtomicBool::new(true)),
            last_pong_ms: Arc::new(AtomicU64::new(0)),
            last_heartbeat_ms: Arc::new(AtomicU64::new(0)),
            out_tx: Arc::new(std::sync::Mutex::new(None)),
            reset: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            task: Arc::new(std::sync::Mutex::new(None)),
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            server_id_conids: Arc::new(DashMap::new()),
        })
    }

    /// Replaces the default subscription processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn SubscriptionProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Opts unsolicited topics into queueing.
    #[must_use]
    pub fn with_unsolicited_queued(mut self, keys: Vec<IbkrWsKey>) -> Self {
        self.unsolicited_to_queue = Arc::new(keys);
        self
    }

    /// Installs a market-data unwrap transformation applied before enqueue.
    #[must_use]
    pub fn with_market_data_unwrapper(mut self, unwrapper: MarketDataUnwrapper) -> Self {
        self.market_data_unwrapper = Some(unwrapper);
        self
    }

    /// Returns the resolved WebSocket URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the current connection mode.
    #[must_use]
    pub fn connection_mode(&self) -> ConnectionMode {
        ConnectionMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    fn set_mode(&self, mode: ConnectionMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Returns whether the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(
            self.connection_mode(),
            ConnectionMode::Connected | ConnectionMode::Ready
        )
    }

    /// Returns whether the client is fully operational.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.connection_mode() == ConnectionMode::Ready
    }

    /// Returns whether the client has been started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns whether the gateway currently reports the session authenticated.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Returns the server-id/contract map for market history streams.
    #[must_use]
    pub fn server_ids(&self) -> &DashMap<String, Option<String>> {
        &self.server_id_conids
    }

    // ------------------------------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------------------------------

    /// Starts the I/O worker and waits for the socket to open.
    ///
    /// Idempotent: a second call while running returns immediately.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if no connection is established within the
    /// configured state-change timeout.
    pub async fn start(&self) -> IbkrWsResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(url = %self.url, "Starting WebSocket client");
        self.set_mode(ConnectionMode::Connecting);

        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run_loop().await });
        *self.task.lock().expect("task lock poisoned") = Some(handle);

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        if wait_until(|| self.is_connected(), timeout).await {
            Ok(())
        } else {
            Err(IbkrWsError::Timeout(format!(
                "connection to {} not established within {}s",
                self.url, self.config.timeout_secs
            )))
        }
    }

    /// Signals all workers and waits for the I/O task to exit, abandoning it
    /// past the configured timeout.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down WebSocket client");
        self.running.store(false, Ordering::SeqCst);
        self.set_mode(ConnectionMode::Disconnecting);
        self.cancel.cancel();

        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("Abandoning WebSocket worker that did not stop in time");
            }
        }

        self.set_mode(ConnectionMode::Closed);
    }

    /// Forcibly closes the current socket; with `restart` the engine
    /// re-enters the connecting state.
    ///
    /// Must not be awaited on work executing inside the I/O worker's dispatch
    /// path; the reset is delivered as a signal so the worker itself tears
    /// the socket down.
    pub fn hard_reset(&self, restart: bool) {
        tracing::info!(restart, "Hard reset");
        if !restart {
            self.running.store(false, Ordering::SeqCst);
        }
        self.reset.notify_one();
    }

    /// Flags the gateway authentication state. Losing authentication forces a
    /// socket close so the reconnect path can re-establish it.
    pub fn set_authenticated(&self, authenticated: bool) {
        let was = self.authenticated.swap(authenticated, Ordering::SeqCst);
        if !authenticated && was {
            tracing::warn!("Session not authenticated, closing WebSocket");
            self.reset.notify_one();
        }
    }

    async fn run_loop(self) {
        let mut attempts: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            if attempts > 0 {
                let delay = Duration::from_millis(500 * u64::from(attempts.min(6)));
                tracing::info!(
                    "Connect reattempt {}/{}",
                    attempts + 1,
                    self.config.max_connection_attempts
                );
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            self.set_mode(ConnectionMode::Connecting);

            match self.run_session().await {
                Ok((_, SessionExit::Shutdown)) => break,
                Ok((was_ready, exit)) => {
                    if was_ready {
                        attempts = 0;
                    }
                    let reconnect = match exit {
                        // Hard resets and stale pings always reconnect while running.
                        SessionExit::Reset | SessionExit::Stale => true,
                        SessionExit::Closed => self.config.restart_on_close,
                        SessionExit::Shutdown => false,
                    };
                    if !reconnect || !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    attempts += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "WebSocket session error");
                    if !self.config.restart_on_critical || !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    attempts += 1;
                }
            }

            if attempts >= self.config.max_connection_attempts {
                tracing::warn!(
                    "Connection failed after {} attempts",
                    self.config.max_connection_attempts
                );
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_mode(ConnectionMode::Closed);
        tracing::debug!("WebSocket worker stopped");
    }

    async fn run_session(&self) -> IbkrWsResult<(bool, SessionExit)> {
        let request = self.build_request().await?;
        let connector = build_connector(
            &self.url,
            self.config.cacert.as_deref(),
            self.verify_ssl(),
        )?;

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let connect =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector));
        let (ws, _response) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| IbkrWsError::Timeout(format!("connection to {} timed out", self.url)))??;

        tracing::info!(url = %self.url, "Connection open");
        self.set_mode(ConnectionMode::Connected);
        self.last_pong_ms.store(now_ms(), Ordering::SeqCst);
        self.last_heartbeat_ms.store(0, Ordering::SeqCst);

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.out_tx.lock().expect("out_tx lock poisoned") = Some(tx);

        let ping_period = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut was_ready = false;
        let exit = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionExit::Shutdown;
                }
                () = self.reset.notified() => {
                    tracing::info!("Hard reset is closing the WebSocket");
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionExit::Reset;
                }
                Some(payload) = rx.recv() => {
                    if self.config.log_raw_messages {
                        tracing::debug!(payload = %payload, "Sending payload");
                    }
                    if let Err(e) = sink.send(Message::Text(payload)).await {
                        tracing::error!(error = %e, "Sending payload failed");
                        break SessionExit::Closed;
                    }
                }
                _ = ping.tick() => {
                    let silent_ms = now_ms().saturating_sub(self.last_pong_ms.load(Ordering::SeqCst));
                    if silent_ms > self.config.max_ping_interval_secs * 1000 {
                        tracing::warn!(
                            "Last ping response {:.2}s ago exceeds the max ping interval of {}s, restarting",
                            silent_ms as f64 / 1000.0,
                            self.config.max_ping_interval_secs,
                        );
                        break SessionExit::Stale;
                    }
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        tracing::error!(error = %e, "Ping failed");
                        break SessionExit::Closed;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        // Any inbound traffic proves the link alive.
                        self.last_pong_ms.store(now_ms(), Ordering::SeqCst);
                        self.dispatch(&text);
                        if !was_ready && self.is_ready() {
                            was_ready = true;
                            let replayer = self.clone();
                            tokio::spawn(async move { replayer.replay_subscriptions().await });
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.last_pong_ms.store(now_ms(), Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Server closed the connection");
                        break SessionExit::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read error");
                        break SessionExit::Closed;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break SessionExit::Closed;
                    }
                }
            }
        };

        *self.out_tx.lock().expect("out_tx lock poisoned") = None;
        if exit != SessionExit::Shutdown {
            self.set_mode(ConnectionMode::Disconnecting);
        }
        self.registry.invalidate_all();

        Ok((was_ready, exit))
    }

    fn verify_ssl(&self) -> bool {
        self.config.use_oauth || self.config.cacert.is_some()
    }

    async fn build_request(&self) -> IbkrWsResult<Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| IbkrWsError::Transport(e.to_string()))?;

        if self.config.use_oauth {
            request.headers_mut().insert(
                http::header::USER_AGENT,
                http::HeaderValue::from_static(IBKR_GATEWAY_WS_USER_AGENT),
            );
        }

        if let Some(cookie) = self.session_cookie().await {
            match http::HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    request.headers_mut().insert(http::header::COOKIE, value);
                }
                Err(e) => tracing::warn!(error = %e, "Invalid session cookie"),
            }
        }

        Ok(request)
    }

    /// Fetches the session id for the connection cookie. Failure is not
    /// fatal: the gateway accepts cookieless connections for some setups.
    async fn session_cookie(&self) -> Option<String> {
        let rest = self.rest.as_ref()?;
        match rest.tickle().await {
            Ok(result) => {
                let session = result.data.get("session")?.as_str()?.to_string();
                if self.config.use_oauth {
                    Some(format!("api={session}"))
                } else {
                    Some(format!("api={}", json!({ "session": session })))
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Acquiring session cookie failed, connection to the gateway may be broken"
                );
                None
            }
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------------------------------

    fn dispatch(&self, raw: &str) {
        if self.config.log_raw_messages {
            tracing::debug!(raw = %raw, "Raw message");
        }

        let frame = match parse_raw_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, raw = %raw, "Unparseable frame");
                self.route_unsolicited(
                    IbkrWsKey::Error,
                    json!({ "error": "unparseable frame", "raw": raw }),
                );
                return;
            }
        };

        if frame.message.get("error").is_some() {
            tracing::error!(message = %frame.message, "Error frame");
            self.route_unsolicited(IbkrWsKey::Error, frame.message);
            return;
        }

        let Some(topic) = frame.topic.clone() else {
            self.handle_frame_without_topic(&frame);
            return;
        };

        match topic.as_str() {
            "system" => self.handle_system(&frame),
            "act" => self.handle_account_update(&frame),
            "blt" => self.route_unsolicited(IbkrWsKey::Bulletins, frame.message),
            "ntf" => self.route_unsolicited(IbkrWsKey::Notifications, frame.args),
            "sts" => self.handle_authentication_status(&frame),
            "error" => {
                tracing::error!(message = %frame.message, "Error topic");
                self.route_unsolicited(IbkrWsKey::Error, frame.message);
            }
            _ => self.handle_channel_frame(&frame),
        }
    }

    fn handle_system(&self, frame: &ParsedFrame) {
        if let Some(hb) = frame.message.get("hb").and_then(Value::as_i64) {
            self.last_heartbeat_ms.store(hb.max(0) as u64, Ordering::SeqCst);
        }
        if self.connection_mode() == ConnectionMode::Connected {
            self.set_mode(ConnectionMode::Ready);
        }
        self.route_unsolicited(IbkrWsKey::System, frame.message.clone());
    }

    fn handle_account_update(&self, frame: &ParsedFrame) {
        self.route_unsolicited(IbkrWsKey::AccountUpdates, frame.message.clone());

        let Some(accounts) = frame.args.get("accounts").and_then(Value::as_array) else {
            tracing::error!(message = %frame.message, "Unknown account response");
            return;
        };
        if let Some(expected) = &self.config.account_id {
            if !accounts.iter().any(|a| a.as_str() == Some(expected)) {
                tracing::error!(
                    expected = %expected,
                    received = ?accounts,
                    "Account ID mismatch"
                );
            }
        }
    }

    fn handle_authentication_status(&self, frame: &ParsedFrame) {
        self.route_unsolicited(IbkrWsKey::AuthenticationStatus, frame.args.clone());

        if let Some(authenticated) = frame.args.get("authenticated").and_then(Value::as_bool) {
            if !authenticated {
                tracing::error!(args = %frame.args, "Status unauthenticated");
            }
            self.set_authenticated(authenticated);
        } else if let Some(competing) = frame.args.get("competing").and_then(Value::as_bool) {
            if competing {
                tracing::error!(args = %frame.args, "Status competing");
            }
        } else if frame.args.as_object().is_some_and(|o| !o.is_empty()) {
            tracing::info!(message = %frame.message, "Unknown status response");
        }
    }

    fn handle_frame_without_topic(&self, frame: &ParsedFrame) {
        if let Some(message) = frame.message.get("message").and_then(Value::as_str) {
            if message.contains("Unsubscribed") {
                self.handle_market_history_unsubscribe(message);
            } else if message == "waiting for session" {
                tracing::info!("Waiting for an active brokerage session");
            } else if !message.is_empty() {
                tracing::error!(message = %message, "Unrecognised message without a topic");
            }
            return;
        }

        if let Some(result) = frame.message.get("result").and_then(Value::as_str) {
            let channel = match result {
                "unsubscribed from summary" => self.account_channel("sd"),
                "unsubscribed from ledger" => self.account_channel("ld"),
                _ => None,
            };
            if let Some(channel) = channel {
                tracing::info!(channel = %channel, "Unsubscription confirmed");
                self.registry.set_confirmed(&channel, false);
                return;
            }
        }

        tracing::error!(message = %frame.message, "Unrecognised message without a topic");
    }

    fn account_channel(&self, prefix: &str) -> Option<String> {
        self.config
            .account_id
            .as_ref()
            .map(|account| format!("{prefix}+{account}"))
    }

    fn handle_market_history_unsubscribe(&self, message: &str) {
        let server_id = message
            .rsplit("Unsubscribed ")
            .next()
            .unwrap_or_default()
            .trim();

        match self.server_id_conids.get(server_id) {
            Some(entry) => match entry.value() {
                Some(conid) => {
                    tracing::info!(server_id, conid = %conid, "Unsubscription confirmed");
                    self.registry.set_confirmed(&format!("mh+{conid}"), false);
                }
                None => tracing::warn!(
                    server_id,
                    "Unknown contract for server id, cannot mark unsubscribed"
                ),
            },
            None => tracing::warn!(
                server_id,
                "Unsubscription confirmation for unknown server id"
            ),
        }
    }

    fn handle_channel_frame(&self, frame: &ParsedFrame) {
        let Some((marker, channel)) = frame.split_topic() else {
            return;
        };
        if marker != 's' && marker != 'u' {
            tracing::error!(topic = ?frame.topic, "Topic unrecognised");
            return;
        }

        if marker == 'u' {
            // An unsubscribe echo confirms removal for the channel.
            self.registry.set_confirmed(channel, false);
            return;
        }

        let prefix: String = channel.chars().take(2).collect();
        let Some(key) = IbkrWsKey::from_channel(&prefix) else {
            tracing::error!(topic = ?frame.topic, message = %frame.message, "Topic unrecognised");
            return;
        };

        if self.registry.has(channel) {
            if self.registry.is_active(channel) == Some(false) {
                self.registry.set_confirmed(channel, true);
            }
        } else {
            tracing::warn!(
                channel = %channel,
                "Handled a message for a channel that is missing a subscription"
            );
        }

        if let Some(payload) = self.preprocess(key, channel, &frame.message) {
            self.queues.push(key, payload);
        }
    }

    fn preprocess(&self, key: IbkrWsKey, channel: &str, message: &Value) -> Option<Value> {
        match key {
            IbkrWsKey::MarketData => {
                // Empty ticker updates carry no conid and are dropped.
                let conid = message.get("conid")?;
                let conid_key = match conid {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let payload = match &self.market_data_unwrapper {
                    Some(unwrap) => unwrap(message.clone()),
                    None => message.clone(),
                };
                Some(json!({ conid_key: payload }))
            }
            IbkrWsKey::MarketHistory => {
                if let Some(server_id) = message.get("serverId").and_then(Value::as_str) {
                    if !self.server_id_conids.contains_key(server_id) {
                        let conid = message
                            .get("conid")
                            .map(|c| match c {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .or_else(|| channel.split_once('+').map(|(_, c)| c.to_string()));
                        self.server_id_conids.insert(server_id.to_string(), conid);
                    }
                }
                Some(message.clone())
            }
            _ => Some(message.clone()),
        }
    }

    fn route_unsolicited(&self, key: IbkrWsKey, payload: Value) {
        if self.unsolicited_to_queue.contains(&key) {
            self.queues.push(key, payload);
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Subscription controller
    // ------------------------------------------------------------------------------------------------

    /// Sends a payload over the WebSocket.
    ///
    /// Returns false when the client is not started or has no active
    /// connection.
    pub fn send(&self, payload: &str) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            tracing::error!("Must be started before sending payloads");
            return false;
        }
        let guard = self.out_tx.lock().expect("out_tx lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(payload.to_string()).is_ok(),
            None => {
                tracing::warn!(payload = %payload, "No active connection");
                false
            }
        }
    }

    /// Sends a JSON payload over the WebSocket.
    pub fn send_json(&self, payload: &Value) -> bool {
        match serde_json::to_string(payload) {
            Ok(text) => self.send(&text),
            Err(e) => {
                tracing::error!(error = %e, "Cannot serialize payload");
                false
            }
        }
    }

    /// Subscribes to a channel.
    ///
    /// When `needs_confirmation` is unset it derives from the channel type.
    /// Confirmed channels retry the identical payload up to
    /// `subscription_retries` additional times, each waiting
    /// `subscription_timeout`; the outcome is returned as a bool and never
    /// raised.
    pub async fn subscribe(
        &self,
        channel: &str,
        data: Option<Value>,
        needs_confirmation: Option<bool>,
        processor: Option<Arc<dyn SubscriptionProcessor>>,
    ) -> bool {
        let _guard = self.op_lock.lock().await;

        if self.registry.is_active(channel) == Some(true) {
            return true;
        }

        let needs_confirmation = needs_confirmation.unwrap_or_else(|| {
            channel_key(channel).is_none_or(|key| key.confirms_subscribing())
        });
        let processor = processor.unwrap_or_else(|| self.processor.clone());

        self.registry.upsert(Subscription {
            channel: Ustr::from(channel),
            data: data.clone(),
            desired: true,
            confirmed: false,
            needs_confirmation,
            processor: Some(processor.clone()),
        });

        let payload = processor.make_subscribe_payload(channel, data.as_ref());
        self.attempt_subscribing(channel, &payload, needs_confirmation)
            .await
    }

    /// Unsubscribes from a channel, removing its record on success.
    pub async fn unsubscribe(
        &self,
        channel: &str,
        data: Option<Value>,
        needs_confirmation: Option<bool>,
        processor: Option<Arc<dyn SubscriptionProcessor>>,
    ) -> bool {
        let _guard = self.op_lock.lock().await;

        let needs_confirmation = needs_confirmation.unwrap_or_else(|| {
            channel_key(channel).is_some_and(|key| key.confirms_unsubscribing())
        });
        let processor = processor.unwrap_or_else(|| self.processor.clone());
        let payload = processor.make_unsubscribe_payload(channel, data.as_ref());

        if !needs_confirmation {
            let sent = self.send(&payload);
            if sent {
                tracing::info!(payload = %payload, "Unsubscribed without confirmation");
                self.registry.remove(channel);
            }
            return sent;
        }

        let wait = Duration::from_secs_f64(self.config.subscription_timeout_secs.max(0.0));
        for attempt in 0..=self.config.subscription_retries {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            if attempt > 0 {
                tracing::info!(
                    "Unsubscribing reattempt ({}/{}) {payload}",
                    attempt + 1,
                    self.config.subscription_retries + 1,
                );
            }
            if !self.send(&payload) {
                continue;
            }
            if wait_until(|| self.registry.is_active(channel) != Some(true), wait).await {
                tracing::info!(payload = %payload, "Unsubscribed");
                self.registry.remove(channel);
                return true;
            }
        }

        tracing::error!(
            "Unsubscribing failed after {} attempts: {payload}",
            self.config.subscription_retries + 1,
        );
        false
    }

    /// Updates a subscription's fields in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not registered.
    pub fn modify_subscription(
        &self,
        channel: &str,
        update: SubscriptionUpdate,
    ) -> anyhow::Result<()> {
        self.registry.modify(channel, update)
    }

    /// Returns whether the channel's subscription is confirmed.
    #[must_use]
    pub fn is_subscription_active(&self, channel: &str) -> bool {
        self.registry.is_active(channel) == Some(true)
    }

    /// Returns whether a record exists for the channel.
    #[must_use]
    pub fn has_subscription(&self, channel: &str) -> bool {
        self.registry.has(channel)
    }

    async fn attempt_subscribing(
        &self,
        channel: &str,
        payload: &str,
        needs_confirmation: bool,
    ) -> bool {
        if !needs_confirmation {
            let sent = self.send(payload);
            if sent {
                self.registry.set_confirmed(channel, true);
                tracing::info!(payload = %payload, "Subscribed without confirmation");
            } else {
                tracing::info!(payload = %payload, "Subscription failed");
            }
            return sent;
        }

        let wait = Duration::from_secs_f64(self.config.subscription_timeout_secs.max(0.0));
        for attempt in 0..=self.config.subscription_retries {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }
            if attempt > 0 {
                tracing::info!(
                    "Subscribing reattempt ({}/{}) {payload}",
                    attempt + 1,
                    self.config.subscription_retries + 1,
                );
            }
            if !self.send(payload) {
                continue;
            }
            if wait_until(|| self.registry.is_active(channel) == Some(true), wait).await {
                tracing::info!(payload = %payload, "Subscribed");
                return true;
            }
        }

        tracing::error!(
            "Subscribing failed after {} attempts: {payload}",
            self.config.subscription_retries + 1,
        );
        false
    }

    /// Re-issues subscribe for every desired record, using each record's
    /// stored processor and data. Runs after every reconnect, gated on the
    /// gateway reporting the session authenticated.
    async fn replay_subscriptions(&self) {
        if !wait_until(
            || self.authenticated.load(Ordering::SeqCst),
            Duration::from_secs(10),
        )
        .await
        {
            tracing::warn!("Skipping subscription replay: session not authenticated");
            return;
        }

        let _guard = self.op_lock.lock().await;
        let pending = self.registry.snapshot_pending();
        if pending.is_empty() {
            return;
        }

        tracing::info!(
            "Recreating {}/{} subscriptions",
            pending.len(),
            self.registry.len()
        );

        for subscription in pending {
            let processor = subscription
                .processor
                .clone()
                .unwrap_or_else(|| self.processor.clone());
            let payload =
                processor.make_subscribe_payload(subscription.channel.as_str(), subscription.data.as_ref());
            if !self
                .attempt_subscribing(
                    subscription.channel.as_str(),
                    &payload,
                    subscription.needs_confirmation,
                )
                .await
            {
                tracing::error!(channel = %subscription.channel, "Failed to re-subscribe");
            }
        }
    }

    // ------------------------------------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------------------------------------

    /// Returns the queue hub for direct access.
    #[must_use]
    pub fn queues(&self) -> &QueueHub {
        &self.queues
    }

    /// Retrieves the next message for a topic; see [`QueueHub::get`].
    pub async fn get(
        &self,
        key: IbkrWsKey,
        block: bool,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        self.queues.get(key, block, timeout).await
    }

    /// Returns whether the topic's queue is empty.
    #[must_use]
    pub fn empty(&self, key: IbkrWsKey) -> bool {
        self.queues.empty(key)
    }

    // ------------------------------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------------------------------

    /// Checks the last ping-response age, hard-resetting when it exceeds the
    /// max ping interval.
    pub fn check_ping(&self) -> bool {
        if !self.is_connected() {
            return true;
        }
        let last = self.last_pong_ms.load(Ordering::SeqCst);
        if last == 0 {
            return true;
        }

        let silent_ms = now_ms().saturating_sub(last);
        if silent_ms > self.config.max_ping_interval_secs * 1000 {
            tracing::warn!(
                "Last ping response {:.2}s ago exceeds the max ping interval of {}s, restarting",
                silent_ms as f64 / 1000.0,
                self.config.max_ping_interval_secs,
            );
            self.hard_reset(true);
            return false;
        }
        true
    }

    /// Cross-checks ping age, heartbeat age, and the brokerage-session probe.
    /// Returns true only when all are healthy; otherwise triggers a hard
    /// reset and returns false.
    pub async fn check_health(&self) -> bool {
        if !self.is_connected() {
            return true;
        }
        if !self.check_ping() {
            return false;
        }

        let heartbeat = self.last_heartbeat_ms.load(Ordering::SeqCst);
        if heartbeat != 0 {
            let silent_ms = now_ms().saturating_sub(heartbeat);
            if silent_ms > self.config.max_ping_interval_secs * 1000 {
                tracing::warn!(
                    "Last heartbeat {:.2}s ago exceeds the max ping interval of {}s, restarting",
                    silent_ms as f64 / 1000.0,
                    self.config.max_ping_interval_secs,
                );
                self.hard_reset(true);
                return false;
            }
        }

        if let Some(rest) = &self.rest {
            if !rest.check_health().await {
                tracing::warn!("Gateway session unhealthy, restarting WebSocket");
                self.hard_reset(true);
                return false;
            }
        }

        true
    }
}

fn channel_key(channel: &str) -> Option<IbkrWsKey> {
    let prefix: String = channel.chars().take(2).collect();
    IbkrWsKey::from_channel(&prefix)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_connection_mode_round_trip() {
        for mode in [
            ConnectionMode::Idle,
            ConnectionMode::Connecting,
            ConnectionMode::Connected,
            ConnectionMode::Ready,
            ConnectionMode::Disconnecting,
            ConnectionMode::Closed,
        ] {
            assert_eq!(ConnectionMode::from_u8(mode as u8), mode);
        }
    }

    #[rstest]
    #[case("md+265598", Some(IbkrWsKey::MarketData))]
    #[case("sd+DU12345", Some(IbkrWsKey::AccountSummary))]
    #[case("or", Some(IbkrWsKey::Orders))]
    #[case("zz+1", None)]
    fn test_channel_key(#[case] channel: &str, #[case] expected: Option<IbkrWsKey>) {
        assert_eq!(channel_key(channel), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn test_send_before_start_returns_false() {
        let client = IbkrWsClient::new(IbkrWsConfig::default(), None).unwrap();

        assert!(!client.send("smd+1"));
        assert_eq!(client.connection_mode(), ConnectionMode::Idle);
    }

    #[rstest]
    #[tokio::test]
    async fn test_wait_until_observes_condition() {
        assert!(wait_until(|| true, Duration::from_millis(10)).await);
        assert!(!wait_until(|| false, Duration::from_millis(50)).await);
    }
}
