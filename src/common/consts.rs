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

//! Shared constants for the IBKR Client Portal adapter.

/// User agent applied to REST requests.
pub const IBKR_USER_AGENT: &str = concat!("nautilus-ibkr/", env!("CARGO_PKG_VERSION"));

/// User agent expected by the gateway on OAuth WebSocket connections.
pub const IBKR_GATEWAY_WS_USER_AGENT: &str = "ClientPortalGW/1";

/// Prefix applied to every environment variable this crate reads.
pub const IBKR_ENV_PREFIX: &str = "IBKR_";

/// Default host of a locally running Client Portal Gateway.
pub const IBKR_DEFAULT_HOST: &str = "127.0.0.1";

/// Default port of a locally running Client Portal Gateway.
pub const IBKR_DEFAULT_PORT: u16 = 5000;

/// Default REST base route on the gateway.
pub const IBKR_REST_BASE_ROUTE: &str = "/v1/api/";

/// Default WebSocket route on the gateway.
pub const IBKR_WS_BASE_ROUTE: &str = "/v1/api/ws";

/// IBKR-hosted REST base URL used in OAuth 1.0a mode.
pub const IBKR_OAUTH1A_REST_URL: &str = "https://api.ibkr.com/v1/api/";

/// IBKR-hosted WebSocket URL used in OAuth 1.0a mode.
pub const IBKR_OAUTH1A_WS_URL: &str = "wss://api.ibkr.com/v1/api/ws";

/// Endpoint requesting an OAuth 1.0a live session token.
pub const IBKR_OAUTH1A_LST_ENDPOINT: &str = "oauth/live_session_token";

/// Default OAuth 1.0a realm ("test_realm" applies to the TESTCONS consumer key).
pub const IBKR_OAUTH1A_DEFAULT_REALM: &str = "limited_poa";

/// Default Diffie-Hellman generator.
pub const IBKR_OAUTH1A_DEFAULT_DH_GENERATOR: u32 = 2;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WS_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_WS_PING_INTERVAL_SECS: u64 = 45;
pub const DEFAULT_WS_MAX_PING_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_WS_MAX_CONNECTION_ATTEMPTS: u32 = 10;
pub const DEFAULT_WS_SUBSCRIPTION_RETRIES: u32 = 5;
pub const DEFAULT_WS_SUBSCRIPTION_TIMEOUT_SECS: f64 = 2.0;
pub const DEFAULT_TICKLER_INTERVAL_SECS: u64 = 60;
