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

//! Raw HTTP client for the IBKR Client Portal Web API.
//!
//! Handles:
//! - Base URL and endpoint normalization.
//! - Recursive null elision on query parameters and JSON bodies.
//! - OAuth 1.0a signing for protected endpoints.
//! - Retries on read timeouts, with client rebuild on connection resets.
//! - Response classification into typed errors.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use reqwest::Method;
use serde_json::Value;

use super::{
    error::{IbkrHttpError, IbkrHttpResult},
    models::{ApiResult, RequestSnapshot, filter_none},
};
use crate::{common::consts::IBKR_USER_AGENT, oauth::OAuth1aSigner};

const NO_BRIDGE_MARKER: &str = "Bad Request: no bridge";
const BODY_EXCERPT_LEN: usize = 512;

/// Raw HTTP client with connection reuse, retry, and a pluggable signing hook.
pub struct IbkrRawHttpClient {
    base_url: String,
    client: ArcSwap<reqwest::Client>,
    cacert: Option<PathBuf>,
    verify_ssl: bool,
    timeout: Duration,
    max_retries: u32,
    use_session: bool,
    log_responses: bool,
    signer: Option<Arc<OAuth1aSigner>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for IbkrRawHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbkrRawHttpClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("use_session", &self.use_session)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl IbkrRawHttpClient {
    /// Creates a new [`IbkrRawHttpClient`] instance.
    ///
    /// # Errors
    ///
    /// Returns a config error if the base URL is empty, the CA bundle cannot
    /// be read, or the underlying client fails to build.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: String,
        cacert: Option<PathBuf>,
        verify_ssl: bool,
        timeout_secs: u64,
        max_retries: u32,
        use_session: bool,
        log_responses: bool,
        signer: Option<Arc<OAuth1aSigner>>,
    ) -> IbkrHttpResult<Self> {
        if base_url.is_empty() {
            return Err(IbkrHttpError::Config("base URL must not be empty".into()));
        }
        let base_url = if base_url.ends_with('/') {
            base_url
        } else {
            format!("{base_url}/")
        };

        if let Some(path) = &cacert {
            if !path.exists() {
                return Err(IbkrHttpError::Config(format!(
                    "cacert path does not exist: {}",
                    path.display()
                )));
            }
        }

        let timeout = Duration::from_secs(timeout_secs);
        let client = build_client(cacert.as_deref(), verify_ssl, timeout)?;

        Ok(Self {
            base_url,
            client: ArcSwap::from_pointee(client),
            cacert,
            verify_ssl,
            timeout,
            max_retries,
            use_session,
            log_responses,
            signer,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the base URL (always with a trailing slash).
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the configured signer, if OAuth is active.
    #[must_use]
    pub fn signer(&self) -> Option<&Arc<OAuth1aSigner>> {
        self.signer.as_ref()
    }

    /// Sends a GET request.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`Self::request`].
    pub async fn get(&self, endpoint: &str, params: Option<&Value>) -> IbkrHttpResult<ApiResult> {
        self.request(Method::GET, endpoint, params, None, None).await
    }

    /// Sends a POST request with an optional JSON body.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`Self::request`].
    pub async fn post(&self, endpoint: &str, body: Option<&Value>) -> IbkrHttpResult<ApiResult> {
        self.request(Method::POST, endpoint, None, body, None).await
    }

    /// Sends a DELETE request with an optional JSON body.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`Self::request`].
    pub async fn delete(&self, endpoint: &str, body: Option<&Value>) -> IbkrHttpResult<ApiResult> {
        self.request(Method::DELETE, endpoint, None, body, None)
            .await
    }

    /// Sends a request through the full pipeline.
    ///
    /// Null-valued entries are elided recursively from both query parameters
    /// and JSON body before anything touches the wire. Headers produced by
    /// the signer override caller-supplied headers of the same name. Total
    /// attempts are bounded by `max_retries + 1`; only read timeouts and
    /// connection resets are retried, the latter after rebuilding the
    /// reusable client.
    ///
    /// # Errors
    ///
    /// - [`IbkrHttpError::MaxRetriesReached`] after retry exhaustion.
    /// - [`IbkrHttpError::ExternalBroker`] for non-2xx responses or invalid JSON.
    /// - [`IbkrHttpError::Authentication`] if signing fails.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: Option<&Value>,
        body: Option<&Value>,
        extra_headers: Option<&HashMap<String, String>>,
    ) -> IbkrHttpResult<ApiResult> {
        let endpoint = endpoint.trim_start_matches('/');
        let url = format!("{}{endpoint}", self.base_url);

        let query_params = params.map(filter_none);
        let query = query_params.as_ref().map(flatten_query).transpose()?;
        let full_url = match &query {
            Some(q) if !q.is_empty() => format!("{url}?{}", encode_query(q)),
            _ => url.clone(),
        };

        let body = body.map(filter_none);

        let mut headers: HashMap<String, String> =
            extra_headers.cloned().unwrap_or_default();
        if let Some(signer) = &self.signer {
            if !signer.is_lst_url(&url) {
                let sign_params = query.as_ref().map(|q| {
                    q.iter()
                        .cloned()
                        .collect::<BTreeMap<String, String>>()
                });
                let signed = signer
                    .generate_oauth_headers(method.as_str(), &url, sign_params.as_ref())
                    .await?;
                headers.extend(signed);
            }
        }

        let snapshot = RequestSnapshot {
            method: method.to_string(),
            url: full_url.clone(),
            body: body.clone(),
        };

        for attempt in 0..=self.max_retries {
            tracing::debug!(
                method = %method,
                url = %full_url,
                attempt,
                "Sending request"
            );

            let client = if self.use_session {
                self.client.load_full()
            } else {
                Arc::new(build_client(self.cacert.as_deref(), self.verify_ssl, self.timeout)?)
            };

            let mut request = client.request(method.clone(), full_url.as_str());
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
            if let Some(json) = &body {
                request = request.json(json);
            }

            match request.send().await {
                Ok(response) => return self.process_response(response, snapshot.clone()).await,
                Err(e) if e.is_timeout() => {
                    if attempt >= self.max_retries {
                        return Err(IbkrHttpError::MaxRetriesReached {
                            method: method.to_string(),
                            url: full_url.clone(),
                            retries: self.max_retries,
                        });
                    }
                    tracing::info!(
                        method = %method,
                        url = %full_url,
                        "Timeout, retrying attempt {}/{}",
                        attempt + 1,
                        self.max_retries,
                    );
                }
                Err(e) if is_connection_error(&e) => {
                    if attempt >= self.max_retries {
                        return Err(IbkrHttpError::MaxRetriesReached {
                            method: method.to_string(),
                            url: full_url.clone(),
                            retries: self.max_retries,
                        });
                    }
                    tracing::warn!(
                        error = %e,
                        "Connection error, rebuilding client and retrying attempt {}/{}",
                        attempt + 1,
                        self.max_retries,
                    );
                    if self.use_session {
                        self.rebuild_client()?;
                    }
                }
                Err(e) => return Err(IbkrHttpError::Transport(e.to_string())),
            }
        }

        Err(IbkrHttpError::MaxRetriesReached {
            method: method.to_string(),
            url: full_url,
            retries: self.max_retries,
        })
    }

    async fn process_response(
        &self,
        response: reqwest::Response,
        snapshot: RequestSnapshot,
    ) -> IbkrHttpResult<ApiResult> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| IbkrHttpError::Transport(format!("response body unreadable: {e}")))?;

        if !status.is_success() {
            if status.as_u16() == 400 && text.contains(NO_BRIDGE_MARKER) {
                return Err(IbkrHttpError::external(
                    400,
                    "IBKR returned 400 Bad Request: no bridge. \
                     Try calling initialize_brokerage_session() first.",
                ));
            }
            return Err(IbkrHttpError::external(
                status.as_u16(),
                format!("{} {}: {}", snapshot.method, snapshot.url, excerpt(&text)),
            ));
        }

        if self.log_responses {
            tracing::debug!(url = %snapshot.url, body = %excerpt(&text), "Response");
        }

        if text.is_empty() {
            return Ok(ApiResult::new(Value::Null, snapshot));
        }

        let data: Value = serde_json::from_str(&text).map_err(|e| IbkrHttpError::ExternalBroker {
            status_code: Some(status.as_u16()),
            message: format!("API returned invalid JSON: {e}"),
        })?;

        Ok(ApiResult::new(data, snapshot))
    }

    fn rebuild_client(&self) -> IbkrHttpResult<()> {
        let client = build_client(self.cacert.as_deref(), self.verify_ssl, self.timeout)?;
        self.client.store(Arc::new(client));
        Ok(())
    }

    /// Releases the reusable client. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("HTTP client closed");
        }
    }

    /// Returns whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn build_client(
    cacert: Option<&std::path::Path>,
    verify_ssl: bool,
    timeout: Duration,
) -> IbkrHttpResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(IBKR_USER_AGENT)
        .pool_max_idle_per_host(10);

    if !verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(path) = cacert {
        let pem = std::fs::read(path).map_err(|e| {
            IbkrHttpError::Config(format!("cannot read cacert {}: {e}", path.display()))
        })?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
            IbkrHttpError::Config(format!("cannot parse cacert {}: {e}", path.display()))
        })?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    builder
        .build()
        .map_err(|e| IbkrHttpError::Config(format!("cannot build HTTP client: {e}")))
}

fn is_connection_error(err: &reqwest::Error) -> bool {
    if err.is_connect() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Flattens a JSON object into query pairs. Arrays become repeated keys.
fn flatten_query(params: &Value) -> IbkrHttpResult<Vec<(String, String)>> {
    let map = params.as_object().ok_or_else(|| {
        IbkrHttpError::Config("query parameters must be a JSON object".into())
    })?;

    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                for item in items {
                    pairs.push((key.clone(), scalar_to_string(item)));
                }
            }
            other => pairs.push((key.clone(), scalar_to_string(other))),
        }
    }
    Ok(pairs)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_query(pairs: &[(String, String)]) -> String {
    use crate::oauth::signer::percent_encode_plus;

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode_plus(k), percent_encode_plus(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn excerpt(text: &str) -> &str {
    if text.len() <= BODY_EXCERPT_LEN {
        return text;
    }
    let mut end = BODY_EXCERPT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn create_test_client() -> IbkrRawHttpClient {
        IbkrRawHttpClient::new(
            "https://localhost:5000/v1/api".to_string(),
            None,
            false,
            10,
            3,
            true,
            false,
            None,
        )
        .expect("Failed to create test client")
    }

    #[rstest]
    fn test_base_url_gains_trailing_slash() {
        let client = create_test_client();

        assert_eq!(client.base_url(), "https://localhost:5000/v1/api/");
    }

    #[rstest]
    fn test_empty_base_url_rejected() {
        let result = IbkrRawHttpClient::new(
            String::new(),
            None,
            false,
            10,
            3,
            true,
            false,
            None,
        );

        assert!(matches!(result, Err(IbkrHttpError::Config(_))));
    }

    #[rstest]
    fn test_missing_cacert_rejected() {
        let result = IbkrRawHttpClient::new(
            "https://localhost:5000/v1/api/".to_string(),
            Some(PathBuf::from("/nonexistent/ca.pem")),
            true,
            10,
            3,
            true,
            false,
            None,
        );

        assert!(matches!(result, Err(IbkrHttpError::Config(_))));
    }

    #[rstest]
    fn test_flatten_query_repeats_arrays() {
        let params = json!({"filters": ["Filled", "Submitted"], "force": true});

        let pairs = flatten_query(&params).unwrap();

        assert!(pairs.contains(&("filters".to_string(), "Filled".to_string())));
        assert!(pairs.contains(&("filters".to_string(), "Submitted".to_string())));
        assert!(pairs.contains(&("force".to_string(), "true".to_string())));
    }

    #[rstest]
    fn test_encode_query_percent_encodes() {
        let pairs = vec![("symbol".to_string(), "BRK B".to_string())];

        assert_eq!(encode_query(&pairs), "symbol=BRK+B");
    }

    #[rstest]
    fn test_excerpt_bounds_long_bodies() {
        let long = "x".repeat(2048);

        assert_eq!(excerpt(&long).len(), BODY_EXCERPT_LEN);
        assert_eq!(excerpt("short"), "short");
    }

    #[rstest]
    fn test_close_is_idempotent() {
        let client = create_test_client();

        client.close();
        client.close();

        assert!(client.is_closed());
    }
}
