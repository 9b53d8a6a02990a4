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

//! OAuth 1.0a credential bundle.

use std::{fmt::Debug, path::PathBuf};

use zeroize::ZeroizeOnDrop;

use crate::common::{
    consts::{
        IBKR_OAUTH1A_DEFAULT_DH_GENERATOR, IBKR_OAUTH1A_DEFAULT_REALM, IBKR_OAUTH1A_LST_ENDPOINT,
        IBKR_OAUTH1A_REST_URL, IBKR_OAUTH1A_WS_URL,
    },
    env::{resolve_string, resolve_u32},
};

/// Secret material kept out of `Debug` output and zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Creates a new [`Secret`] instance.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the inner value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns whether the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// OAuth 1.0a configuration for the IBKR Client Portal Web API.
///
/// The realm is generally `limited_poa`; `test_realm` applies when using the
/// `TESTCONS` consumer key.
#[derive(Clone, Debug)]
pub struct OAuth1aConfig {
    /// IBKR-hosted REST base URL used while OAuth is active.
    pub oauth_rest_url: String,
    /// IBKR-hosted WebSocket URL used while OAuth is active.
    pub oauth_ws_url: String,
    /// Endpoint requesting the live session token.
    pub live_session_token_endpoint: String,
    /// Access token generated in the self-service portal.
    pub access_token: String,
    /// Access token secret generated in the self-service portal (RSA-encrypted, base64).
    pub access_token_secret: Secret,
    /// Consumer key configured during onboarding.
    pub consumer_key: String,
    /// Hex representation of the Diffie-Hellman prime.
    pub dh_prime: String,
    /// Diffie-Hellman generator value.
    pub dh_generator: u32,
    /// Path to the private encryption key (decrypts the access token secret).
    pub encryption_key_fp: PathBuf,
    /// Path to the private signature key (signs the handshake base string).
    pub signature_key_fp: PathBuf,
    /// OAuth realm.
    pub realm: String,
}

impl OAuth1aConfig {
    /// Builds the configuration from `IBKR_OAUTH1A_*` environment variables.
    ///
    /// Missing values resolve to empty strings and are reported by [`Self::verify`].
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            oauth_rest_url: resolve_string(None, "OAUTH1A_REST_URL", IBKR_OAUTH1A_REST_URL),
            oauth_ws_url: resolve_string(None, "OAUTH1A_WS_URL", IBKR_OAUTH1A_WS_URL),
            live_session_token_endpoint: resolve_string(
                None,
                "OAUTH1A_LIVE_SESSION_TOKEN_ENDPOINT",
                IBKR_OAUTH1A_LST_ENDPOINT,
            ),
            access_token: resolve_string(None, "OAUTH1A_ACCESS_TOKEN", ""),
            access_token_secret: Secret::new(resolve_string(
                None,
                "OAUTH1A_ACCESS_TOKEN_SECRET",
                "",
            )),
            consumer_key: resolve_string(None, "OAUTH1A_CONSUMER_KEY", ""),
            dh_prime: resolve_string(None, "OAUTH1A_DH_PRIME", ""),
            dh_generator: resolve_u32(
                None,
                "OAUTH1A_DH_GENERATOR",
                IBKR_OAUTH1A_DEFAULT_DH_GENERATOR,
            )?,
            encryption_key_fp: PathBuf::from(resolve_string(None, "OAUTH1A_ENCRYPTION_KEY_FP", "")),
            signature_key_fp: PathBuf::from(resolve_string(None, "OAUTH1A_SIGNATURE_KEY_FP", "")),
            realm: resolve_string(None, "OAUTH1A_REALM", IBKR_OAUTH1A_DEFAULT_REALM),
        })
    }

    /// Validates that all required parameters are present and key files exist.
    ///
    /// # Errors
    ///
    /// Returns an error naming every missing parameter or unreadable key file.
    pub fn verify(&self) -> anyhow::Result<()> {
        let mut missing = Vec::new();
        if self.oauth_rest_url.is_empty() {
            missing.push("oauth_rest_url");
        }
        if self.live_session_token_endpoint.is_empty() {
            missing.push("live_session_token_endpoint");
        }
        if self.access_token.is_empty() {
            missing.push("access_token");
        }
        if self.access_token_secret.is_empty() {
            missing.push("access_token_secret");
        }
        if self.consumer_key.is_empty() {
            missing.push("consumer_key");
        }
        if self.dh_prime.is_empty() {
            missing.push("dh_prime");
        }
        if self.encryption_key_fp.as_os_str().is_empty() {
            missing.push("encryption_key_fp");
        }
        if self.signature_key_fp.as_os_str().is_empty() {
            missing.push("signature_key_fp");
        }
        if !missing.is_empty() {
            anyhow::bail!(
                "OAuth1aConfig is missing required parameters: {}",
                missing.join(", ")
            );
        }

        let mut unreadable = Vec::new();
        for path in [&self.encryption_key_fp, &self.signature_key_fp] {
            if !path.exists() {
                unreadable.push(path.display().to_string());
            }
        }
        if !unreadable.is_empty() {
            anyhow::bail!(
                "OAuth1aConfig key filepaths don't exist: {}",
                unreadable.join(", ")
            );
        }

        Ok(())
    }

    /// Returns the absolute URL of the live-session-token endpoint.
    #[must_use]
    pub fn live_session_token_url(&self) -> String {
        format!(
            "{}/{}",
            self.oauth_rest_url.trim_end_matches('/'),
            self.live_session_token_endpoint.trim_start_matches('/'),
        )
    }
}
