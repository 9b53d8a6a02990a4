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

//! Environment variable resolution.
//!
//! Every recognized key resolves in order: explicit argument, `IBKR_`-prefixed
//! environment variable, built-in default. Malformed booleans and integers are
//! hard errors so misconfiguration fails at construction rather than mid-session.

use crate::common::consts::IBKR_ENV_PREFIX;

/// Reads an `IBKR_`-prefixed environment variable.
#[must_use]
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{IBKR_ENV_PREFIX}{name}")).ok()
}

/// Resolves an optional string: explicit value wins over the environment.
#[must_use]
pub fn resolve_opt(explicit: Option<String>, name: &str) -> Option<String> {
    explicit.or_else(|| env_var(name))
}

/// Resolves a string with a default.
#[must_use]
pub fn resolve_string(explicit: Option<String>, name: &str, default: &str) -> String {
    resolve_opt(explicit, name).unwrap_or_else(|| default.to_string())
}

/// Parses a boolean from the accepted token set (case-insensitive).
///
/// # Errors
///
/// Returns an error for any value outside {y, yes, t, true, on, 1, n, no, f, false, off, 0}.
pub fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Ok(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Ok(false),
        other => anyhow::bail!("'{other}' is not a valid boolean value"),
    }
}

/// Resolves a boolean with a default.
///
/// # Errors
///
/// Returns an error if the environment carries a value outside the accepted set.
pub fn resolve_bool(explicit: Option<bool>, name: &str, default: bool) -> anyhow::Result<bool> {
    if let Some(value) = explicit {
        return Ok(value);
    }
    match env_var(name) {
        Some(raw) => {
            parse_bool(&raw).map_err(|e| anyhow::anyhow!("{IBKR_ENV_PREFIX}{name}: {e}"))
        }
        None => Ok(default),
    }
}

/// Resolves an unsigned integer with a default.
///
/// # Errors
///
/// Returns an error if the environment carries a non-decimal value.
pub fn resolve_u64(explicit: Option<u64>, name: &str, default: u64) -> anyhow::Result<u64> {
    if let Some(value) = explicit {
        return Ok(value);
    }
    match env_var(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| anyhow::anyhow!("{IBKR_ENV_PREFIX}{name}: '{raw}' is not a valid integer")),
        None => Ok(default),
    }
}

/// Resolves a `u32` with a default.
///
/// # Errors
///
/// Returns an error if the environment carries a non-decimal value.
pub fn resolve_u32(explicit: Option<u32>, name: &str, default: u32) -> anyhow::Result<u32> {
    if let Some(value) = explicit {
        return Ok(value);
    }
    match env_var(name) {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("{IBKR_ENV_PREFIX}{name}: '{raw}' is not a valid integer")),
        None => Ok(default),
    }
}

/// Resolves a float with a default (used for sub-second timeouts).
///
/// # Errors
///
/// Returns an error if the environment carries a non-numeric value.
pub fn resolve_f64(explicit: Option<f64>, name: &str, default: f64) -> anyhow::Result<f64> {
    if let Some(value) = explicit {
        return Ok(value);
    }
    match env_var(name) {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("{IBKR_ENV_PREFIX}{name}: '{raw}' is not a valid number")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("y", true)]
    #[case("YES", true)]
    #[case("t", true)]
    #[case("True", true)]
    #[case("on", true)]
    #[case("1", true)]
    #[case("n", false)]
    #[case("no", false)]
    #[case("f", false)]
    #[case("FALSE", false)]
    #[case("off", false)]
    #[case("0", false)]
    fn test_parse_bool_accepted(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(parse_bool(input).unwrap(), expected);
    }

    #[rstest]
    #[case("maybe")]
    #[case("2")]
    #[case("")]
    #[case("tru")]
    fn test_parse_bool_rejected(#[case] input: &str) {
        assert!(parse_bool(input).is_err());
    }

    #[rstest]
    fn test_explicit_wins_over_default() {
        assert!(resolve_bool(Some(true), "NEVER_SET_TEST_KEY", false).unwrap());
        assert_eq!(
            resolve_u64(Some(7), "NEVER_SET_TEST_KEY", 10).unwrap(),
            7
        );
    }

    #[rstest]
    fn test_default_when_unset() {
        assert_eq!(
            resolve_u64(None, "NEVER_SET_TEST_KEY", 42).unwrap(),
            42
        );
        assert_eq!(
            resolve_string(None, "NEVER_SET_TEST_KEY", "fallback"),
            "fallback"
        );
    }
}
