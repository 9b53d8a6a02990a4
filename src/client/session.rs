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

//! Session endpoints: keep-alive, authentication status, and the brokerage
//! session lifecycle.

use serde_json::{Value, json};

use super::IbkrHttpClient;
use crate::http::{IbkrHttpError, IbkrHttpResult, models::ApiResult};

impl IbkrHttpClient {
    /// Pings the gateway to prevent the session from timing out. Expected
    /// roughly every 60 seconds to maintain the brokerage session.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn tickle(&self) -> IbkrHttpResult<ApiResult> {
        self.post("tickle", None).await
    }

    /// Returns the current authentication status of the brokerage session.
    /// Market data and trading are unavailable while unauthenticated.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn authentication_status(&self) -> IbkrHttpResult<ApiResult> {
        self.post("iserver/auth/status", None).await
    }

    /// Initializes the brokerage session. Required before any `/iserver`
    /// endpoint, including trading and market data.
    ///
    /// `compete` disconnects other brokerage sessions to prioritize this one.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn initialize_brokerage_session(&self, compete: bool) -> IbkrHttpResult<ApiResult> {
        self.post(
            "iserver/auth/ssodh/init",
            Some(&json!({ "publish": true, "compete": compete })),
        )
        .await
    }

    /// Reauthenticates to the brokerage system while a valid session exists.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn reauthenticate(&self) -> IbkrHttpResult<ApiResult> {
        self.post("iserver/reauthenticate", None).await
    }

    /// Validates the current SSO session.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn validate_sso(&self) -> IbkrHttpResult<ApiResult> {
        self.get("sso/validate", None).await
    }

    /// Logs out of the gateway session. Further activity requires
    /// re-authentication.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn logout(&self) -> IbkrHttpResult<ApiResult> {
        self.post("logout", None).await
    }

    /// Probes gateway health via the keep-alive endpoint, returning true only
    /// when the session is authenticated, not competing, and connected.
    ///
    /// Every failure mode maps to false after logging: 401 means the session
    /// is gone, a retry-exhausted timeout means the gateway is unreachable,
    /// and anything else is logged as-is.
    pub async fn check_health(&self) -> bool {
        let result = match self.tickle().await {
            Ok(result) => result,
            Err(e) => {
                match &e {
                    IbkrHttpError::ExternalBroker {
                        status_code: Some(401),
                        ..
                    } => tracing::info!("Gateway session is not authenticated"),
                    IbkrHttpError::MaxRetriesReached { .. } => tracing::error!(
                        "Timeout communicating with the gateway; it may not be running"
                    ),
                    other => tracing::error!(error = %other, "Tickle request failed"),
                }
                return false;
            }
        };

        let Some(auth_status) = result.data.pointer("/iserver/authStatus") else {
            tracing::error!(data = %result.data, "Health check returned invalid data");
            return false;
        };

        let authenticated = auth_status
            .get("authenticated")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let competing = auth_status
            .get("competing")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let connected = auth_status
            .get("connected")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        authenticated && !competing && connected
    }
}
