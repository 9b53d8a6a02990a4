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

//! Configuration structures for the IBKR adapter.
//!
//! Each field resolves explicit argument < environment variable < default at
//! construction time; the bundles are never mutated afterwards. Adjust fields
//! on the value returned by `from_env` before handing it to a client if an
//! override is needed.

use std::path::PathBuf;

use crate::{
    common::{
        consts::{
            DEFAULT_MAX_RETRIES, DEFAULT_TICKLER_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS,
            DEFAULT_WS_MAX_CONNECTION_ATTEMPTS, DEFAULT_WS_MAX_PING_INTERVAL_SECS,
            DEFAULT_WS_PING_INTERVAL_SECS, DEFAULT_WS_SUBSCRIPTION_RETRIES,
            DEFAULT_WS_SUBSCRIPTION_TIMEOUT_SECS, DEFAULT_WS_TIMEOUT_SECS, IBKR_DEFAULT_HOST,
            IBKR_DEFAULT_PORT, IBKR_REST_BASE_ROUTE, IBKR_WS_BASE_ROUTE,
        },
        env::{resolve_bool, resolve_f64, resolve_opt, resolve_u32, resolve_u64},
    },
    oauth::OAuth1aConfig,
};

/// Configuration for the IBKR HTTP client.
#[derive(Clone, Debug)]
pub struct IbkrClientConfig {
    /// Account ID used by account-scoped endpoints.
    pub account_id: Option<String>,
    /// Explicit REST base URL; overrides host/port and the OAuth URL.
    pub rest_url: Option<String>,
    /// Gateway host, used when no explicit URL is set.
    pub host: String,
    /// Gateway port, used when no explicit URL is set.
    pub port: u16,
    /// REST base route on the gateway.
    pub base_route: String,
    /// CA certificate bundle for the gateway's self-signed TLS; `None`
    /// disables verification (gateway mode only).
    pub cacert: Option<PathBuf>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum retries for transient I/O failures.
    pub max_retries: u32,
    /// Whether one reusable HTTP client is shared across requests.
    pub use_session: bool,
    /// Whether `close` is wired automatically on shutdown paths.
    pub auto_register_shutdown: bool,
    /// Whether response bodies are logged at debug level.
    pub log_responses: bool,
    /// Whether OAuth 1.0a authentication is active.
    pub use_oauth: bool,
    /// OAuth credentials; required when `use_oauth` is set.
    pub oauth: Option<OAuth1aConfig>,
    /// Whether `connect` runs the OAuth handshake automatically.
    pub init_oauth: bool,
    /// Whether the tickler starts automatically after the handshake.
    pub maintain_oauth: bool,
    /// Whether the brokerage session initializes automatically after the handshake.
    pub init_brokerage_session: bool,
    /// Whether `close` logs out of the OAuth session.
    pub shutdown_oauth: bool,
    /// Interval between keep-alive calls in seconds.
    pub tickler_interval_secs: u64,
}

impl IbkrClientConfig {
    /// Builds the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any boolean or integer variable fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let use_oauth = resolve_bool(None, "USE_OAUTH", false)?;
        let oauth = if use_oauth {
            Some(OAuth1aConfig::from_env()?)
        } else {
            None
        };

        Ok(Self {
            account_id: resolve_opt(None, "ACCOUNT_ID"),
            rest_url: resolve_opt(None, "REST_URL"),
            host: IBKR_DEFAULT_HOST.to_string(),
            port: IBKR_DEFAULT_PORT,
            base_route: IBKR_REST_BASE_ROUTE.to_string(),
            cacert: resolve_opt(None, "CACERT").map(PathBuf::from),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            use_session: resolve_bool(None, "USE_SESSION", true)?,
            auto_register_shutdown: resolve_bool(None, "AUTO_REGISTER_SHUTDOWN", true)?,
            log_responses: resolve_bool(None, "LOG_RESPONSES", false)?,
            use_oauth,
            oauth,
            init_oauth: resolve_bool(None, "INIT_OAUTH", true)?,
            maintain_oauth: resolve_bool(None, "MAINTAIN_OAUTH", true)?,
            init_brokerage_session: resolve_bool(None, "INIT_BROKERAGE_SESSION", true)?,
            shutdown_oauth: resolve_bool(None, "SHUTDOWN_OAUTH", true)?,
            tickler_interval_secs: resolve_u64(
                None,
                "TICKLER_INTERVAL",
                DEFAULT_TICKLER_INTERVAL_SECS,
            )?,
        })
    }

    /// Resolves the REST base URL: explicit URL, then the OAuth URL when OAuth
    /// is active, then the local gateway address.
    #[must_use]
    pub fn rest_base_url(&self) -> String {
        if let Some(url) = &self.rest_url {
            return url.clone();
        }
        if self.use_oauth {
            if let Some(oauth) = &self.oauth {
                return oauth.oauth_rest_url.clone();
            }
        }
        format!("https://{}:{}{}", self.host, self.port, self.base_route)
    }

    /// Returns whether TLS verification is active. OAuth mode always
    /// verifies; gateway mode verifies only when a CA bundle is configured.
    #[must_use]
    pub fn verify_ssl(&self) -> bool {
        self.use_oauth || self.cacert.is_some()
    }
}

impl Default for IbkrClientConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            rest_url: None,
            host: IBKR_DEFAULT_HOST.to_string(),
            port: IBKR_DEFAULT_PORT,
            base_route: IBKR_REST_BASE_ROUTE.to_string(),
            cacert: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            use_session: true,
            auto_register_shutdown: true,
            log_responses: false,
            use_oauth: false,
            oauth: None,
            init_oauth: true,
            maintain_oauth: true,
            init_brokerage_session: true,
            shutdown_oauth: true,
            tickler_interval_secs: DEFAULT_TICKLER_INTERVAL_SECS,
        }
    }
}

/// Configuration for the IBKR WebSocket client.
#[derive(Clone, Debug)]
pub struct IbkrWsConfig {
    /// Explicit WebSocket URL; overrides host/port and the OAuth URL.
    pub ws_url: Option<String>,
    /// Gateway host, used when no explicit URL is set.
    pub host: String,
    /// Gateway port, used when no explicit URL is set.
    pub port: u16,
    /// WebSocket route on the gateway.
    pub base_route: String,
    /// Account ID used for account-scoped subscriptions.
    pub account_id: Option<String>,
    /// CA certificate bundle; `None` disables verification (gateway mode only).
    pub cacert: Option<PathBuf>,
    /// Timeout in seconds for connection and shutdown state changes.
    pub timeout_secs: u64,
    /// Whether the connection restarts after an unexpected close.
    pub restart_on_close: bool,
    /// Whether the connection restarts after a fatal error.
    pub restart_on_critical: bool,
    /// Interval between outbound pings in seconds.
    pub ping_interval_secs: u64,
    /// Maximum tolerated silence before a hard reset, in seconds.
    pub max_ping_interval_secs: u64,
    /// Bound on automatic reconnection attempts.
    pub max_connection_attempts: u32,
    /// Retry budget for subscription requests.
    pub subscription_retries: u32,
    /// Confirmation wait per subscription attempt, in seconds.
    pub subscription_timeout_secs: f64,
    /// Whether raw inbound frames are logged at debug level.
    pub log_raw_messages: bool,
    /// Whether OAuth 1.0a is active (appends the access token to the URL).
    pub use_oauth: bool,
    /// Access token appended as `?oauth_token=...` in OAuth mode.
    pub access_token: Option<String>,
    /// OAuth WebSocket URL used when OAuth is active and no explicit URL is set.
    pub oauth_ws_url: Option<String>,
}

impl IbkrWsConfig {
    /// Builds the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any boolean or numeric variable fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            ws_url: resolve_opt(None, "WS_URL"),
            host: IBKR_DEFAULT_HOST.to_string(),
            port: IBKR_DEFAULT_PORT,
            base_route: IBKR_WS_BASE_ROUTE.to_string(),
            account_id: resolve_opt(None, "ACCOUNT_ID"),
            cacert: resolve_opt(None, "CACERT").map(PathBuf::from),
            timeout_secs: resolve_u64(None, "WS_TIMEOUT", DEFAULT_WS_TIMEOUT_SECS)?,
            restart_on_close: true,
            restart_on_critical: true,
            ping_interval_secs: resolve_u64(
                None,
                "WS_PING_INTERVAL",
                DEFAULT_WS_PING_INTERVAL_SECS,
            )?,
            max_ping_interval_secs: resolve_u64(
                None,
                "WS_MAX_PING_INTERVAL",
                DEFAULT_WS_MAX_PING_INTERVAL_SECS,
            )?,
            max_connection_attempts: DEFAULT_WS_MAX_CONNECTION_ATTEMPTS,
            subscription_retries: resolve_u32(
                None,
                "WS_SUBSCRIPTION_RETRIES",
                DEFAULT_WS_SUBSCRIPTION_RETRIES,
            )?,
            subscription_timeout_secs: resolve_f64(
                None,
                "WS_SUBSCRIPTION_TIMEOUT",
                DEFAULT_WS_SUBSCRIPTION_TIMEOUT_SECS,
            )?,
            log_raw_messages: resolve_bool(None, "WS_LOG_RAW_MESSAGES", false)?,
            use_oauth: resolve_bool(None, "USE_OAUTH", false)?,
            access_token: resolve_opt(None, "OAUTH1A_ACCESS_TOKEN"),
            oauth_ws_url: resolve_opt(None, "OAUTH1A_WS_URL"),
        })
    }

    /// Resolves the WebSocket URL, appending the OAuth access token when
    /// OAuth is active.
    ///
    /// # Errors
    ///
    /// Returns an error if OAuth is active but no access token is configured.
    pub fn resolved_url(&self) -> anyhow::Result<String> {
        let mut url = match (&self.ws_url, self.use_oauth, &self.oauth_ws_url) {
            (Some(url), _, _) => url.clone(),
            (None, true, Some(oauth_url)) => oauth_url.clone(),
            (None, true, None) => crate::common::consts::IBKR_OAUTH1A_WS_URL.to_string(),
            (None, false, _) => {
                format!("wss://{}:{}{}", self.host, self.port, self.base_route)
            }
        };

        if self.use_oauth {
            let token = self.access_token.as_ref().ok_or_else(|| {
                anyhow::anyhow!(
                    "OAuth access token not found; set IBKR_OAUTH1A_ACCESS_TOKEN or `access_token`"
                )
            })?;
            url.push_str(&format!("?oauth_token={token}"));
        }

        Ok(url)
    }
}

impl Default for IbkrWsConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            host: IBKR_DEFAULT_HOST.to_string(),
            port: IBKR_DEFAULT_PORT,
            base_route: IBKR_WS_BASE_ROUTE.to_string(),
            account_id: None,
            cacert: None,
            timeout_secs: DEFAULT_WS_TIMEOUT_SECS,
            restart_on_close: true,
            restart_on_critical: true,
            ping_interval_secs: DEFAULT_WS_PING_INTERVAL_SECS,
            max_ping_interval_secs: DEFAULT_WS_MAX_PING_INTERVAL_SECS,
            max_connection_attempts: DEFAULT_WS_MAX_CONNECTION_ATTEMPTS,
            subscription_retries: DEFAULT_WS_SUBSCRIPTION_RETRIES,
            subscription_timeout_secs: DEFAULT_WS_SUBSCRIPTION_TIMEOUT_SECS,
            log_raw_messages: false,
            use_oauth: false,
            access_token: None,
            oauth_ws_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_rest_url_falls_back_to_gateway() {
        let config = IbkrClientConfig::default();

        assert_eq!(config.rest_base_url(), "https://127.0.0.1:5000/v1/api/");
    }

    #[rstest]
    fn test_rest_url_explicit_wins() {
        let config = IbkrClientConfig {
            rest_url: Some("https://example.com/api/".to_string()),
            ..Default::default()
        };

        assert_eq!(config.rest_base_url(), "https://example.com/api/");
    }

    #[rstest]
    fn test_verify_ssl_disabled_only_for_bare_gateway() {
        let bare = IbkrClientConfig::default();
        let with_ca = IbkrClientConfig {
            cacert: Some(PathBuf::from("/tmp/ca.pem")),
            ..Default::default()
        };

        assert!(!bare.verify_ssl());
        assert!(with_ca.verify_ssl());
    }

    #[rstest]
    fn test_from_env_is_deterministic() {
        let a = IbkrClientConfig::from_env().unwrap();
        let b = IbkrClientConfig::from_env().unwrap();
        let ws_a = IbkrWsConfig::from_env().unwrap();
        let ws_b = IbkrWsConfig::from_env().unwrap();

        assert_eq!(format!("{a:?}"), format!("{b:?}"));
        assert_eq!(format!("{ws_a:?}"), format!("{ws_b:?}"));
    }

    #[rstest]
    fn test_ws_url_default_gateway() {
        let config = IbkrWsConfig::default();

        assert_eq!(
            config.resolved_url().unwrap(),
            "wss://127.0.0.1:5000/v1/api/ws"
        );
    }

    #[rstest]
    fn test_ws_url_oauth_requires_access_token() {
        let config = IbkrWsConfig {
            use_oauth: true,
            ..Default::default()
        };

        assert!(config.resolved_url().is_err());
    }

    #[rstest]
    fn test_ws_url_oauth_appends_token() {
        let config = IbkrWsConfig {
            use_oauth: true,
            access_token: Some("abc123".to_string()),
            ..Default::default()
        };

        assert_eq!(
            config.resolved_url().unwrap(),
            "wss://api.ibkr.com/v1/api/ws?oauth_token=abc123"
        );
    }
}
