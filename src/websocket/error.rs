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

//! IBKR WebSocket client error types.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error types for the IBKR WebSocket client.
#[derive(Debug, Clone, Error)]
pub enum IbkrWsError {
    /// Client is not connected.
    #[error("Not connected")]
    NotConnected,
    /// Transport-level error during WebSocket communication.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Failed to send a payload over the WebSocket.
    #[error("Send error: {0}")]
    Send(String),
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
    /// Gateway reported the session as unauthenticated.
    #[error("Authentication error: {0}")]
    Authentication(String),
    /// Connection attempts exhausted.
    #[error("Connection failed after {attempts} attempts")]
    ConnectionExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<tungstenite::Error> for IbkrWsError {
    fn from(error: tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<serde_json::Error> for IbkrWsError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

/// Result type alias for IBKR WebSocket operations.
pub type IbkrWsResult<T> = Result<T, IbkrWsError>;
