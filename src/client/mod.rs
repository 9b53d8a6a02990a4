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

//! Typed client for the IBKR Client Portal Web API.
//!
//! [`IbkrHttpClient`] wraps the raw REST engine with endpoint wrappers
//! (grouped by topic into the submodules here), the OAuth lifecycle, and the
//! session tickler. Construction performs no I/O; call [`IbkrHttpClient::connect`]
//! to run the configured OAuth handshake and brokerage-session setup.

pub mod accounts;
pub mod marketdata;
pub mod orders;
pub mod portfolio;
pub mod session;
pub mod tickler;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

pub use orders::{Answers, QuestionType};
pub use tickler::{SessionKeepAlive, Tickler};

use crate::{
    config::IbkrClientConfig,
    http::{
        IbkrHttpError, IbkrHttpResult, IbkrRawHttpClient,
        models::ApiResult,
    },
    oauth::OAuth1aSigner,
};

/// HTTP client for the IBKR Client Portal Web API.
///
/// Cheap to clone: clones share the underlying engine, tickler, order lock,
/// and close flag.
#[derive(Clone)]
pub struct IbkrHttpClient {
    raw: Arc<IbkrRawHttpClient>,
    config: IbkrClientConfig,
    signer: Option<Arc<OAuth1aSigner>>,
    tickler: Arc<std::sync::Mutex<Option<Arc<Tickler>>>>,
    pub(crate) order_lock: Arc<tokio::sync::Mutex<()>>,
    closed: Arc<AtomicBool>,
    shutdown_registered: Arc<AtomicBool>,
}

impl std::fmt::Debug for IbkrHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbkrHttpClient")
            .field("base_url", &self.raw.base_url())
            .field("account_id", &self.config.account_id)
            .field("use_oauth", &self.config.use_oauth)
            .finish_non_exhaustive()
    }
}

impl IbkrHttpClient {
    /// Creates a new [`IbkrHttpClient`] instance.
    ///
    /// With OAuth enabled this verifies the credential bundle and loads both
    /// RSA keys, failing loudly on any missing piece.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration.
    pub fn new(config: IbkrClientConfig) -> anyhow::Result<Self> {
        let signer = if config.use_oauth {
            let oauth = config.oauth.clone().ok_or_else(|| {
                anyhow::anyhow!("use_oauth is set but no OAuth configuration was provided")
            })?;
            Some(Arc::new(OAuth1aSigner::new(oauth)?))
        } else {
            None
        };

        let raw = IbkrRawHttpClient::new(
            config.rest_base_url(),
            config.cacert.clone(),
            config.verify_ssl(),
            config.timeout_secs,
            config.max_retries,
            config.use_session,
            config.log_responses,
            signer.clone(),
        )?;

        tracing::info!(
            base_url = %raw.base_url(),
            account_id = ?config.account_id,
            use_oauth = config.use_oauth,
            "New IbkrHttpClient"
        );

        Ok(Self {
            raw: Arc::new(raw),
            config,
            signer,
            tickler: Arc::new(std::sync::Mutex::new(None)),
            order_lock: Arc::new(tokio::sync::Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_registered: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Creates a client from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::new(IbkrClientConfig::from_env()?)
    }

    /// Returns the underlying raw client.
    #[must_use]
    pub fn raw(&self) -> &IbkrRawHttpClient {
        &self.raw
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &IbkrClientConfig {
        &self.config
    }

    /// Returns the configured account ID.
    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        self.config.account_id.as_deref()
    }

    pub(crate) fn target_account(&self, account_id: Option<&str>) -> IbkrHttpResult<String> {
        account_id
            .map(str::to_string)
            .or_else(|| self.config.account_id.clone())
            .ok_or_else(|| {
                IbkrHttpError::Config(
                    "account_id required; set IBKR_ACCOUNT_ID or pass it explicitly".into(),
                )
            })
    }

    // ------------------------------------------------------------------------------------------------
    // Generic surface
    // ------------------------------------------------------------------------------------------------

    /// Sends a GET request to an endpoint.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn get(&self, endpoint: &str, params: Option<&Value>) -> IbkrHttpResult<ApiResult> {
        self.raw.get(endpoint, params).await
    }

    /// Sends a POST request to an endpoint.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn post(&self, endpoint: &str, body: Option<&Value>) -> IbkrHttpResult<ApiResult> {
        self.raw.post(endpoint, body).await
    }

    /// Sends a DELETE request to an endpoint.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn delete(&self, endpoint: &str, body: Option<&Value>) -> IbkrHttpResult<ApiResult> {
        self.raw.delete(endpoint, body).await
    }

    // ------------------------------------------------------------------------------------------------
    // OAuth lifecycle
    // ------------------------------------------------------------------------------------------------

    /// Runs the configured startup sequence: the OAuth handshake when
    /// `init_oauth` is set, the tickler when `maintain_oauth` is set, and the
    /// brokerage session when `init_brokerage_session` is set.
    ///
    /// # Errors
    ///
    /// Returns an auth error if the handshake or validation fails.
    pub async fn connect(&self) -> IbkrHttpResult<()> {
        if self.config.auto_register_shutdown {
            self.register_shutdown_handler();
        }
        if self.config.use_oauth && self.config.init_oauth {
            self.oauth_init(
                self.config.maintain_oauth,
                self.config.init_brokerage_session,
            )
            .await?;
        }
        Ok(())
    }

    /// Registers a Ctrl-C handler that closes the client exactly once.
    /// Idempotent; existing application signal handlers are unaffected, as
    /// every listener receives the signal.
    pub fn register_shutdown_handler(&self) {
        if self.shutdown_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, closing client");
                client.close().await;
            }
        });
    }

    /// Initializes OAuth: obtains and validates a live session token, then
    /// optionally starts the tickler and the brokerage session.
    ///
    /// # Errors
    ///
    /// Returns a config error when OAuth is not enabled, or an auth error if
    /// the handshake fails.
    pub async fn oauth_init(
        &self,
        maintain_oauth: bool,
        init_brokerage_session: bool,
    ) -> IbkrHttpResult<()> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| IbkrHttpError::Config("OAuth is not enabled".into()))?;

        tracing::info!("Initialising OAuth 1.0a");
        let _ = signer.live_session_token().await?;

        if maintain_oauth {
            self.start_tickler();
        }
        if init_brokerage_session {
            self.initialize_brokerage_session(true).await?;
        }

        Ok(())
    }

    /// Starts the tickler to maintain the session. Idempotent.
    pub fn start_tickler(&self) {
        let mut guard = self.tickler.lock().expect("tickler lock poisoned");
        if guard.as_ref().is_some_and(|t| t.is_running()) {
            tracing::info!("Tickler already running");
            return;
        }

        let tickler = Arc::new(Tickler::new(
            Arc::new(self.clone()) as Arc<dyn SessionKeepAlive>,
            Duration::from_secs(self.config.tickler_interval_secs.max(1)),
        ));
        tickler.start();
        *guard = Some(tickler);
    }

    /// Stops the tickler, waiting for the worker to exit. Idempotent.
    pub async fn stop_tickler(&self) {
        let tickler = self.tickler.lock().expect("tickler lock poisoned").take();
        if let Some(tickler) = tickler {
            tickler.stop().await;
        }
    }

    /// Shuts down the OAuth session: stops the tickler and logs out.
    pub async fn oauth_shutdown(&self) {
        tracing::info!("Shutting down OAuth session");
        self.stop_tickler().await;
        if let Err(e) = self.logout().await {
            tracing::error!(error = %e, "Logout failed during OAuth shutdown");
        }
    }

    /// Closes the client exactly once: runs the OAuth shutdown when
    /// configured, then releases the reusable HTTP client. Safe to call
    /// repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.use_oauth && self.config.shutdown_oauth {
            self.oauth_shutdown().await;
        }
        self.raw.close();
    }
}

#[async_trait]
impl SessionKeepAlive for IbkrHttpClient {
    async fn tickle(&self) -> IbkrHttpResult<ApiResult> {
        IbkrHttpClient::tickle(self).await
    }
}
