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

//! OAuth 1.0a request signing.
//!
//! Protected requests carry an `Authorization: OAuth realm="...", ...` header
//! whose signature is HMAC-SHA256 keyed by the live session token. The
//! handshake request itself is signed RSA-SHA256 with the prepended base
//! string. Signing is deterministic given nonce and timestamp, which the pure
//! functions in this module take as explicit parameters.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use rsa::{
    RsaPrivateKey,
    pkcs1v15::SigningKey,
    signature::{SignatureEncoding, Signer},
};
use sha2::Sha256;

use super::{
    config::OAuth1aConfig,
    lst::{
        calculate_live_session_token, calculate_prepend, generate_dh_challenge,
        generate_dh_random, read_private_key, validate_live_session_token,
    },
};
use crate::{
    common::consts::IBKR_USER_AGENT,
    http::error::{IbkrHttpError, IbkrHttpResult},
};

type HmacSha256 = Hmac<Sha256>;

/// Signature method for protected resources.
pub const SIGNATURE_METHOD_HMAC: &str = "HMAC-SHA256";

/// Signature method for the token handshake.
pub const SIGNATURE_METHOD_RSA: &str = "RSA-SHA256";

const NONCE_LENGTH: usize = 16;

/// A token within this margin of its expiration is refreshed before signing.
const LST_EXPIRY_MARGIN_MS: i64 = 60_000;

/// Characters kept verbatim by `quote_plus`-style encoding (unreserved set).
const QUOTE_PLUS_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encodes with the unreserved set, mapping space to `+`.
#[must_use]
pub fn percent_encode_plus(value: &str) -> String {
    utf8_percent_encode(value, QUOTE_PLUS_SET)
        .to_string()
        .replace("%20", "+")
}

/// Generates a random nonce of 16 alphanumeric characters.
#[must_use]
pub fn generate_oauth_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

/// Returns the current Unix timestamp in seconds, as a string.
#[must_use]
pub fn generate_request_timestamp() -> String {
    Utc::now().timestamp().to_string()
}

/// Assembles the OAuth base string.
///
/// The parameter list sorts all authorization and query parameters by
/// byte-lexicographic key order, formats them as `k=v` joined by `&`, then
/// percent-encodes URL and list. The handshake prefixes the decrypted access
/// token secret (`prepend`) with no separator.
#[must_use]
pub fn generate_base_string(
    method: &str,
    url: &str,
    params: &BTreeMap<String, String>,
    prepend: Option<&str>,
) -> String {
    let param_list = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let base = format!(
        "{method}&{}&{}",
        percent_encode_plus(url),
        percent_encode_plus(&param_list),
    );

    match prepend {
        Some(prefix) => format!("{prefix}{base}"),
        None => base,
    }
}

/// Signs the base string with HMAC-SHA256 keyed by the base64-decoded live
/// session token; the result is base64-encoded then percent-encoded.
///
/// # Errors
///
/// Returns an auth error if the live session token is not valid base64.
pub fn generate_hmac_sha256_signature(
    base_string: &str,
    live_session_token: &str,
) -> IbkrHttpResult<String> {
    let key = BASE64.decode(live_session_token).map_err(|e| {
        IbkrHttpError::Authentication(format!("live session token is not valid base64: {e}"))
    })?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| IbkrHttpError::Authentication(format!("HMAC key error: {e}")))?;
    mac.update(base_string.as_bytes());

    Ok(percent_encode_plus(&BASE64.encode(mac.finalize().into_bytes())))
}

/// Signs the base string with RSASSA-PKCS1-v1_5/SHA-256; the DER signature is
/// base64-encoded then percent-encoded.
#[must_use]
pub fn generate_rsa_sha256_signature(base_string: &str, signature_key: &RsaPrivateKey) -> String {
    let signing_key = SigningKey::<Sha256>::new(signature_key.clone());
    let signature = signing_key.sign(base_string.as_bytes());

    percent_encode_plus(&BASE64.encode(signature.to_bytes()))
}

/// Formats the authorization header: `OAuth realm="<realm>", k1="v1", ...`
/// with the realm leading and the remaining keys ASCII-sorted.
#[must_use]
pub fn generate_authorization_header(params: &BTreeMap<String, String>, realm: &str) -> String {
    let pairs = params
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!("OAuth realm=\"{realm}\", {pairs}")
}

/// Extracts `host[:port]` from an absolute URL.
#[must_use]
pub fn host_from_url(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Live session token state produced by the handshake.
#[derive(Clone, Debug)]
pub struct LiveSessionToken {
    /// Base64-encoded token bytes (the HMAC-SHA256 signing key).
    pub token: String,
    /// Expiration timestamp, milliseconds since epoch.
    pub expires_ms: i64,
    /// Server-returned hex signature used to verify the computed token.
    pub signature: String,
}

impl LiveSessionToken {
    /// Returns whether the token should be refreshed before further signing.
    #[must_use]
    pub fn is_expiring(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_ms - LST_EXPIRY_MARGIN_MS
    }
}

/// Per-request OAuth 1.0a signer holding the live session state.
///
/// The handshake is serialized by an async lock so concurrent protected
/// requests observe a consistent `(token, expiration)` pair and at most one
/// handshake is in flight. The handshake posts through the signer's own HTTP
/// client: the engine sends that endpoint unsigned, so routing it back through
/// the engine would add a dependency cycle without changing any wire bytes.
pub struct OAuth1aSigner {
    config: OAuth1aConfig,
    encryption_key: RsaPrivateKey,
    signature_key: RsaPrivateKey,
    state: tokio::sync::Mutex<Option<LiveSessionToken>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for OAuth1aSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1aSigner")
            .field("consumer_key", &self.config.consumer_key)
            .field("realm", &self.config.realm)
            .finish_non_exhaustive()
    }
}

impl OAuth1aSigner {
    /// Creates a new [`OAuth1aSigner`] instance, loading both RSA keys.
    ///
    /// # Errors
    ///
    /// Returns a config error if the configuration is incomplete or a key
    /// file cannot be read.
    pub fn new(config: OAuth1aConfig) -> IbkrHttpResult<Self> {
        config
            .verify()
            .map_err(|e| IbkrHttpError::Config(e.to_string()))?;

        let encryption_key = read_private_key(&config.encryption_key_fp)?;
        let signature_key = read_private_key(&config.signature_key_fp)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(IBKR_USER_AGENT)
            .build()
            .map_err(|e| IbkrHttpError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            config,
            encryption_key,
            signature_key,
            state: tokio::sync::Mutex::new(None),
            http,
        })
    }

    /// Returns the configuration backing this signer.
    #[must_use]
    pub fn config(&self) -> &OAuth1aConfig {
        &self.config
    }

    /// Returns whether the URL targets the live-session-token endpoint, which
    /// must never be signed with the HMAC path.
    #[must_use]
    pub fn is_lst_url(&self, url: &str) -> bool {
        url.trim_end_matches('/') == self.config.live_session_token_url().trim_end_matches('/')
    }

    /// Returns the current live session token, running the handshake if the
    /// stored token is absent or expiring.
    ///
    /// # Errors
    ///
    /// Returns an auth error if the handshake or validation fails.
    pub async fn live_session_token(&self) -> IbkrHttpResult<LiveSessionToken> {
        let mut guard = self.state.lock().await;
        let now_ms = Utc::now().timestamp_millis();

        if let Some(token) = guard.as_ref() {
            if !token.is_expiring(now_ms) {
                return Ok(token.clone());
            }
            tracing::info!("Live session token expiring, requesting a new one");
        }

        let token = self.request_live_session_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Performs the live-session-token handshake.
    ///
    /// # Errors
    ///
    /// Returns an auth error if the HTTP exchange fails, the response is
    /// malformed, or the token signature does not validate.
    pub async fn request_live_session_token(&self) -> IbkrHttpResult<LiveSessionToken> {
        let dh_random = generate_dh_random();
        let dh_challenge = generate_dh_challenge(
            &self.config.dh_prime,
            &dh_random,
            self.config.dh_generator,
        )?;
        let prepend =
            calculate_prepend(self.config.access_token_secret.expose(), &self.encryption_key)?;

        let url = self.config.live_session_token_url();
        let mut extra_params = BTreeMap::new();
        extra_params.insert("diffie_hellman_challenge".to_string(), dh_challenge);

        let headers = self.build_headers(
            "POST",
            &url,
            SIGNATURE_METHOD_RSA,
            None,
            Some(&extra_params),
            None,
            Some(&prepend),
        )?;

        tracing::debug!(url = %url, "Requesting live session token");

        let mut request = self.http.post(&url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| IbkrHttpError::Authentication(format!("LST request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IbkrHttpError::Authentication(format!("LST response unreadable: {e}")))?;

        if !status.is_success() {
            return Err(IbkrHttpError::Authentication(format!(
                "LST request returned {status}: {body}"
            )));
        }

        let payload: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            IbkrHttpError::Authentication(format!("LST response is not valid JSON: {e}"))
        })?;

        let dh_response = payload
            .get("diffie_hellman_response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                IbkrHttpError::Authentication("LST response missing diffie_hellman_response".into())
            })?;
        let expires_ms = payload
            .get("live_session_token_expiration")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                IbkrHttpError::Authentication(
                    "LST response missing live_session_token_expiration".into(),
                )
            })?;
        let signature = payload
            .get("live_session_token_signature")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                IbkrHttpError::Authentication(
                    "LST response missing live_session_token_signature".into(),
                )
            })?;

        let token = calculate_live_session_token(
            &self.config.dh_prime,
            &dh_random,
            dh_response,
            &prepend,
        )?;

        if !validate_live_session_token(&token, signature, &self.config.consumer_key)? {
            return Err(IbkrHttpError::Authentication(
                "live session token validation failed".into(),
            ));
        }

        tracing::info!(expires_ms, "Live session token obtained and validated");

        Ok(LiveSessionToken {
            token,
            expires_ms,
            signature: signature.to_string(),
        })
    }

    /// Generates the complete header set for one protected request.
    ///
    /// Query parameters, when provided, participate in the signature base
    /// string alongside the authorization parameters.
    ///
    /// # Errors
    ///
    /// Returns an auth error if no live session token can be obtained.
    pub async fn generate_oauth_headers(
        &self,
        method: &str,
        url: &str,
        params: Option<&BTreeMap<String, String>>,
    ) -> IbkrHttpResult<HashMap<String, String>> {
        let lst = self.live_session_token().await?;
        self.build_headers(
            method,
            url,
            SIGNATURE_METHOD_HMAC,
            Some(&lst.token),
            None,
            params,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_headers(
        &self,
        method: &str,
        url: &str,
        signature_method: &str,
        live_session_token: Option<&str>,
        extra_oauth_params: Option<&BTreeMap<String, String>>,
        request_params: Option<&BTreeMap<String, String>>,
        prepend: Option<&str>,
    ) -> IbkrHttpResult<HashMap<String, String>> {
        let mut oauth_params = BTreeMap::new();
        oauth_params.insert(
            "oauth_consumer_key".to_string(),
            self.config.consumer_key.clone(),
        );
        oauth_params.insert("oauth_nonce".to_string(), generate_oauth_nonce());
        oauth_params.insert(
            "oauth_signature_method".to_string(),
            signature_method.to_string(),
        );
        oauth_params.insert("oauth_timestamp".to_string(), generate_request_timestamp());
        oauth_params.insert("oauth_token".to_string(), self.config.access_token.clone());
        if let Some(extra) = extra_oauth_params {
            oauth_params.extend(extra.clone());
        }

        let mut base_params = oauth_params.clone();
        if let Some(params) = request_params {
            base_params.extend(params.clone());
        }

        let base_string = generate_base_string(method, url, &base_params, prepend);

        let signature = match signature_method {
            SIGNATURE_METHOD_HMAC => {
                let token = live_session_token.ok_or_else(|| {
                    IbkrHttpError::Authentication("HMAC signing requires a live session token".into())
                })?;
                generate_hmac_sha256_signature(&base_string, token)?
            }
            _ => generate_rsa_sha256_signature(&base_string, &self.signature_key),
        };
        oauth_params.insert("oauth_signature".to_string(), signature);

        let authorization = generate_authorization_header(&oauth_params, &self.config.realm);

        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "*/*".to_string());
        headers.insert("Accept-Encoding".to_string(), "gzip,deflate".to_string());
        headers.insert("Authorization".to_string(), authorization);
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("Host".to_string(), host_from_url(url));
        headers.insert("User-Agent".to_string(), IBKR_USER_AGENT.to_string());

        Ok(headers)
    }
}
