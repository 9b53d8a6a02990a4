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

//! Topic keys and inbound frame pre-parsing.
//!
//! Upstream frames are UTF-8 JSON. The only routing-relevant fields are
//! `topic` (whose first character marks subscribe/unsubscribe and whose
//! remainder names the channel), `args`, and the confirmation markers carried
//! in topic-specific payloads.

use serde_json::Value;
use strum::{Display, EnumIter, EnumString};

/// Topic identifiers for IBKR WebSocket data queues.
///
/// Solicited channels (those with a [`Self::channel`] prefix) are always
/// queued; unsolicited channels are queued only when opted in.
#[derive(
    Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IbkrWsKey {
    /// Account summary updates (channel `sd`).
    AccountSummary,
    /// Account ledger updates (channel `ld`).
    AccountLedger,
    /// Market data snapshots (channel `md`).
    MarketData,
    /// Market history bars (channel `mh`).
    MarketHistory,
    /// Price ladder rows (channel `bd`).
    PriceLadder,
    /// Live order updates (channel `or`).
    Orders,
    /// Profit-and-loss updates (channel `pl`).
    Pnl,
    /// Trade executions (channel `tr`).
    Trades,
    /// Unsolicited account updates.
    AccountUpdates,
    /// Unsolicited authentication status frames.
    AuthenticationStatus,
    /// Unsolicited bulletins.
    Bulletins,
    /// Unsolicited error frames.
    Error,
    /// Unsolicited system frames.
    System,
    /// Unsolicited notifications.
    Notifications,
}

impl IbkrWsKey {
    /// Maps a solicited channel prefix to its key.
    #[must_use]
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            "sd" => Some(Self::AccountSummary),
            "ld" => Some(Self::AccountLedger),
            "md" => Some(Self::MarketData),
            "mh" => Some(Self::MarketHistory),
            "bd" => Some(Self::PriceLadder),
            "or" => Some(Self::Orders),
            "pl" => Some(Self::Pnl),
            "tr" => Some(Self::Trades),
            _ => None,
        }
    }

    /// Returns the solicited channel prefix, or `None` for unsolicited keys.
    #[must_use]
    pub fn channel(&self) -> Option<&'static str> {
        match self {
            Self::AccountSummary => Some("sd"),
            Self::AccountLedger => Some("ld"),
            Self::MarketData => Some("md"),
            Self::MarketHistory => Some("mh"),
            Self::PriceLadder => Some("bd"),
            Self::Orders => Some("or"),
            Self::Pnl => Some("pl"),
            Self::Trades => Some("tr"),
            _ => None,
        }
    }

    /// Whether the gateway confirms subscriptions on this channel.
    #[must_use]
    pub fn confirms_subscribing(&self) -> bool {
        matches!(
            self,
            Self::AccountSummary
                | Self::AccountLedger
                | Self::MarketData
                | Self::MarketHistory
                | Self::Pnl
                | Self::Trades
        )
    }

    /// Whether the gateway confirms unsubscriptions on this channel.
    #[must_use]
    pub fn confirms_unsubscribing(&self) -> bool {
        matches!(
            self,
            Self::AccountSummary | Self::AccountLedger | Self::MarketHistory
        )
    }
}

/// A pre-parsed inbound frame.
#[derive(Clone, Debug)]
pub struct ParsedFrame {
    /// The full decoded message.
    pub message: Value,
    /// The `topic` field, when present.
    pub topic: Option<String>,
    /// The `args` payload (empty object when absent).
    pub args: Value,
}

impl ParsedFrame {
    /// Splits a non-reserved topic into its subscribe/unsubscribe marker and
    /// channel (`"smd+265598"` becomes `('s', "md+265598")`).
    #[must_use]
    pub fn split_topic(&self) -> Option<(char, &str)> {
        let topic = self.topic.as_deref()?;
        let mut chars = topic.chars();
        let marker = chars.next()?;
        Some((marker, chars.as_str()))
    }
}

/// Decodes a raw text frame.
///
/// # Errors
///
/// Returns a JSON error if the frame is not valid JSON.
pub fn parse_raw_frame(raw: &str) -> Result<ParsedFrame, serde_json::Error> {
    let message: Value = serde_json::from_str(raw)?;
    let topic = message
        .get("topic")
        .and_then(|t| t.as_str())
        .map(str::to_string);
    let args = message
        .get("args")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

    Ok(ParsedFrame {
        message,
        topic,
        args,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[rstest]
    fn test_channel_bijection() {
        for key in IbkrWsKey::iter() {
            if let Some(channel) = key.channel() {
                assert_eq!(IbkrWsKey::from_channel(channel), Some(key));
            }
        }
    }

    #[rstest]
    fn test_unsolicited_have_no_channel() {
        assert!(IbkrWsKey::Bulletins.channel().is_none());
        assert!(IbkrWsKey::System.channel().is_none());
        assert!(IbkrWsKey::from_channel("xx").is_none());
    }

    #[rstest]
    #[case(IbkrWsKey::MarketData, true, false)]
    #[case(IbkrWsKey::MarketHistory, true, true)]
    #[case(IbkrWsKey::PriceLadder, false, false)]
    #[case(IbkrWsKey::Orders, false, false)]
    #[case(IbkrWsKey::Pnl, true, false)]
    #[case(IbkrWsKey::AccountSummary, true, true)]
    fn test_confirmation_defaults(
        #[case] key: IbkrWsKey,
        #[case] subscribes: bool,
        #[case] unsubscribes: bool,
    ) {
        assert_eq!(key.confirms_subscribing(), subscribes);
        assert_eq!(key.confirms_unsubscribing(), unsubscribes);
    }

    #[rstest]
    fn test_parse_and_split_topic() {
        let frame = parse_raw_frame(r#"{"topic":"smd+265598","args":{"31":"150.0"}}"#).unwrap();

        let (marker, channel) = frame.split_topic().unwrap();
        assert_eq!(marker, 's');
        assert_eq!(channel, "md+265598");
        assert_eq!(frame.args["31"], "150.0");
    }

    #[rstest]
    fn test_parse_frame_without_topic() {
        let frame = parse_raw_frame(r#"{"message":"waiting for session"}"#).unwrap();

        assert!(frame.topic.is_none());
        assert!(frame.split_topic().is_none());
    }
}
