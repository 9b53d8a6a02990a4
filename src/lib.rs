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

//! Client for the [Interactive Brokers](https://www.interactivebrokers.com) Client Portal Web API.
//!
//! The crate provides connectivity to IBKR's HTTP + WebSocket gateway over a
//! single, long-lived session:
//!
//! - **REST engine** ([`http`]): a session-oriented client with connection
//!   reuse, timeout/retry, structured error classification, a pluggable
//!   per-request signing hook, and a rate-limited parallel executor.
//! - **OAuth 1.0a** ([`oauth`]): the live-session-token handshake deriving a
//!   short-lived symmetric key from an RSA-encrypted secret and a
//!   Diffie-Hellman exchange, then signing every protected request with it.
//! - **WebSocket engine** ([`websocket`]): a self-healing duplex channel with
//!   a subscription registry, confirmation-driven subscribe/unsubscribe,
//!   per-topic queues, ping/heartbeat health checks, and automatic reconnect
//!   with subscription replay.
//! - **Typed client** ([`client`]): endpoint wrappers over the REST engine
//!   (session, accounts, market data, portfolio, orders) plus the session
//!   tickler.
//!
//! Connectivity targets either a locally running Client Portal Gateway or
//! IBKR's hosted OAuth endpoints; configuration resolves from explicit
//! arguments, `IBKR_`-prefixed environment variables, and built-in defaults,
//! in that order.
//!
//! # Example
//!
//! ```no_run
//! use nautilus_ibkr::{
//!     client::IbkrHttpClient,
//!     config::{IbkrClientConfig, IbkrWsConfig},
//!     websocket::{IbkrWsClient, IbkrWsKey},
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let rest = IbkrHttpClient::new(IbkrClientConfig::from_env()?)?;
//! rest.connect().await?;
//!
//! let ws = IbkrWsClient::new(IbkrWsConfig::from_env()?, Some(rest.clone()))?;
//! ws.start().await?;
//! ws.subscribe("md+265598", Some(serde_json::json!({"fields": ["31"]})), None, None)
//!     .await;
//!
//! while let Some(update) = ws.get(IbkrWsKey::MarketData, true, None).await {
//!     println!("{update}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod common;
pub mod config;
pub mod http;
pub mod logging;
pub mod oauth;
pub mod websocket;

pub use client::{Answers, IbkrHttpClient, QuestionType, SessionKeepAlive, Tickler};
pub use config::{IbkrClientConfig, IbkrWsConfig};
pub use http::{ApiResult, IbkrHttpError, IbkrHttpResult, IbkrRawHttpClient, RequestSnapshot};
pub use oauth::{OAuth1aConfig, OAuth1aSigner};
pub use websocket::{
    IbkrSubscriptionProcessor, IbkrWsClient, IbkrWsError, IbkrWsKey, IbkrWsResult, QueueHub,
    SubscriptionProcessor, SubscriptionRegistry,
};
