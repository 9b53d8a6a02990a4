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

//! Periodic keep-alive worker.
//!
//! The gateway times out idle sessions after a few minutes; the tickler calls
//! the keep-alive endpoint on an interval to prevent that. It drives a narrow
//! [`SessionKeepAlive`] interface rather than a full client so the WebSocket
//! engine and REST client stay decoupled from it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::http::{IbkrHttpError, IbkrHttpResult, models::ApiResult};

/// The keep-alive operation the tickler drives.
#[async_trait]
pub trait SessionKeepAlive: Send + Sync {
    /// Pings the gateway to keep the session alive.
    async fn tickle(&self) -> IbkrHttpResult<ApiResult>;
}

/// Periodic worker invoking the keep-alive operation.
///
/// Timeouts are swallowed with a warning (gateway restarts are common);
/// other errors are logged but do not stop the worker. Start and stop are
/// idempotent; stop waits for the worker to exit.
pub struct Tickler {
    target: Arc<dyn SessionKeepAlive>,
    interval: Duration,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Tickler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tickler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Tickler {
    /// Creates a new [`Tickler`] instance.
    #[must_use]
    pub fn new(target: Arc<dyn SessionKeepAlive>, interval: Duration) -> Self {
        Self {
            target,
            interval,
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Returns whether the worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("tickler lock poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Starts the worker. A second call while running is a no-op.
    pub fn start(&self) {
        let mut guard = self.task.lock().expect("tickler lock poisoned");
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::info!("Tickler already running");
            return;
        }

        tracing::info!(interval_secs = self.interval.as_secs(), "Tickler starting");

        let target = self.target.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();

        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                match target.tickle().await {
                    Ok(_) => {}
                    Err(IbkrHttpError::MaxRetriesReached { .. }) => {
                        tracing::warn!("Tickle timed out; the gateway may be restarting");
                    }
                    Err(e) => tracing::error!(error = %e, "Tickler error"),
                }
            }
            tracing::info!("Tickler gracefully stopped");
        }));
    }

    /// Stops the worker and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().expect("tickler lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
