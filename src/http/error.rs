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

//! HTTP-boundary error types.

use thiserror::Error;

/// Error types for the IBKR HTTP client.
#[derive(Debug, Clone, Error)]
pub enum IbkrHttpError {
    /// Missing or malformed configuration. Raised at construction, never retried.
    #[error("Configuration error: {0}")]
    Config(String),
    /// OAuth handshake failure or live-session-token validation mismatch.
    #[error("Authentication error: {0}")]
    Authentication(String),
    /// Transient I/O exhausted its retry budget.
    #[error("{method} {url}: reached max retries ({retries})")]
    MaxRetriesReached {
        /// HTTP method of the failed request.
        method: String,
        /// Absolute URL of the failed request.
        url: String,
        /// Configured retry budget.
        retries: u32,
    },
    /// Non-2xx response, invalid JSON, or another gateway-side failure.
    #[error("External broker error: {message}")]
    ExternalBroker {
        /// HTTP status code when one was received.
        status_code: Option<u16>,
        /// Message with a body excerpt.
        message: String,
    },
    /// Unexpected structure in the order question/answer flow.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Transport-level failure outside the retryable set.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl IbkrHttpError {
    /// Returns the HTTP status code carried by the error, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ExternalBroker { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Creates an external-broker error from a status code and body excerpt.
    #[must_use]
    pub fn external(status_code: u16, message: impl Into<String>) -> Self {
        Self::ExternalBroker {
            status_code: Some(status_code),
            message: message.into(),
        }
    }
}

/// Result type alias for IBKR HTTP operations.
pub type IbkrHttpResult<T> = Result<T, IbkrHttpError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_max_retries_message_names_method_and_url() {
        let err = IbkrHttpError::MaxRetriesReached {
            method: "GET".to_string(),
            url: "https://localhost:5000/v1/api/tickle".to_string(),
            retries: 3,
        };

        let msg = err.to_string();
        assert!(msg.contains("GET"));
        assert!(msg.contains("https://localhost:5000/v1/api/tickle"));
        assert!(msg.contains("reached max retries (3)"));
    }

    #[rstest]
    fn test_status_code_accessor() {
        let err = IbkrHttpError::external(503, "Service Unavailable");

        assert_eq!(err.status_code(), Some(503));
        assert_eq!(IbkrHttpError::Config("x".into()).status_code(), None);
    }
}
