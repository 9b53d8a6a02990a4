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

//! Tracing initialization from environment variables.
//!
//! Reads `IBKR_LOG_LEVEL`, `IBKR_LOG_FORMAT` (`compact`, `pretty`, `json`),
//! `IBKR_LOG_TO_CONSOLE`, `IBKR_LOG_TO_FILE`, `IBKR_LOGS_DIR`, and
//! `IBKR_PRINT_FILE_LOGS`, installing a console layer and/or a daily-rolling
//! file layer. Initialization is a library courtesy: applications that
//! install their own subscriber first are left untouched.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::common::env::{env_var, parse_bool};

static FILE_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "nautilus-ibkr.log";

/// Initializes tracing from the environment. Idempotent; a second call (or a
/// call after the application installed its own subscriber) is a no-op.
///
/// # Errors
///
/// Returns an error if a boolean variable carries an invalid value.
pub fn init_tracing() -> anyhow::Result<()> {
    let level = env_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
    let format = env_var("LOG_FORMAT").unwrap_or_else(|| "compact".to_string());
    let to_console = match env_var("LOG_TO_CONSOLE") {
        Some(raw) => parse_bool(&raw)?,
        None => true,
    };
    let to_file = match env_var("LOG_TO_FILE") {
        Some(raw) => parse_bool(&raw)?,
        None => false,
    };
    let print_file_logs = match env_var("PRINT_FILE_LOGS") {
        Some(raw) => parse_bool(&raw)?,
        None => false,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if to_console {
        let layer = match format.as_str() {
            "pretty" => tracing_subscriber::fmt::layer().pretty().boxed(),
            "json" => tracing_subscriber::fmt::layer().json().boxed(),
            _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
        };
        layers.push(layer);
    }

    let mut file_dir = None;
    if to_file {
        let dir =
            env_var("LOGS_DIR").unwrap_or_else(|| std::env::temp_dir().display().to_string());
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(Some(guard));
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        file_dir = Some(dir);
    } else {
        let _ = FILE_GUARD.set(None);
    }

    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let initialized = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_ok();

    if initialized && print_file_logs {
        if let Some(dir) = file_dir {
            tracing::info!("File logs: {dir}/{LOG_FILE_PREFIX}.<date>");
        }
    }

    Ok(())
}
