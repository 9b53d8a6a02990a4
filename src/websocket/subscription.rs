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

//! Subscription registry and payload processing.
//!
//! The registry is the single source of truth for what must be active after
//! any reconnect: one record per channel, protected by a single lock, with
//! snapshot reads so replay never holds the lock across I/O.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use ustr::Ustr;

/// Formats subscribe/unsubscribe payloads for a channel.
///
/// The default processor follows the gateway's plain-text convention;
/// replacing it lets callers target different wire formats.
pub trait SubscriptionProcessor: Send + Sync {
    /// Builds the payload subscribing to `channel`.
    fn make_subscribe_payload(&self, channel: &str, data: Option<&Value>) -> String;

    /// Builds the payload unsubscribing from `channel`.
    fn make_unsubscribe_payload(&self, channel: &str, data: Option<&Value>) -> String;
}

/// Default processor: `s<channel>` (plus `+<json>` when data is present) and
/// `u<channel>+<json|{}>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct IbkrSubscriptionProcessor;

impl SubscriptionProcessor for IbkrSubscriptionProcessor {
    fn make_subscribe_payload(&self, channel: &str, data: Option<&Value>) -> String {
        match data {
            Some(data) => format!("s{channel}+{}", compact_json(data)),
            None => format!("s{channel}"),
        }
    }

    fn make_unsubscribe_payload(&self, channel: &str, data: Option<&Value>) -> String {
        let args = data.map_or_else(|| "{}".to_string(), compact_json);
        format!("u{channel}+{args}")
    }
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// One record per channel string.
#[derive(Clone)]
pub struct Subscription {
    /// Channel identifier, e.g. `md+265598`.
    pub channel: Ustr,
    /// Opaque payload data sent with subscribe/unsubscribe.
    pub data: Option<Value>,
    /// Whether the channel should be active after any reconnect.
    pub desired: bool,
    /// Whether the gateway has confirmed the subscription.
    pub confirmed: bool,
    /// Whether subscribe waits for a confirmation frame.
    pub needs_confirmation: bool,
    /// Processor formatting this record's payloads (the registry default
    /// applies when `None`).
    pub processor: Option<Arc<dyn SubscriptionProcessor>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("data", &self.data)
            .field("desired", &self.desired)
            .field("confirmed", &self.confirmed)
            .field("needs_confirmation", &self.needs_confirmation)
            .finish_non_exhaustive()
    }
}

/// Field updates for [`SubscriptionRegistry::modify`]; `None` leaves the
/// field unchanged.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionUpdate {
    /// New confirmed state.
    pub confirmed: Option<bool>,
    /// Replacement payload data.
    pub data: Option<Value>,
    /// New confirmation requirement.
    pub needs_confirmation: Option<bool>,
}

/// Tracks desired-vs-actual subscription state per channel.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: std::sync::Mutex<HashMap<Ustr, Subscription>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("registry lock poisoned");
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Creates a new [`SubscriptionRegistry`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for a channel.
    pub fn upsert(&self, subscription: Subscription) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .insert(subscription.channel, subscription);
    }

    /// Removes the record for a channel.
    pub fn remove(&self, channel: &str) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .remove(&Ustr::from(channel));
    }

    /// Returns whether a record exists for a channel.
    #[must_use]
    pub fn has(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .contains_key(&Ustr::from(channel))
    }

    /// Returns whether the channel's subscription is confirmed; `None` when
    /// the channel is not registered.
    #[must_use]
    pub fn is_active(&self, channel: &str) -> Option<bool> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(&Ustr::from(channel))
            .map(|s| s.confirmed)
    }

    /// Sets the confirmed flag for a channel, ignoring unknown channels.
    pub fn set_confirmed(&self, channel: &str, confirmed: bool) {
        if let Some(subscription) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .get_mut(&Ustr::from(channel))
        {
            subscription.confirmed = confirmed;
        }
    }

    /// Updates a subscription's fields in place.
    ///
    /// # Errors
    ///
    /// Returns an error naming the registered channels if `channel` is
    /// unknown.
    pub fn modify(&self, channel: &str, update: SubscriptionUpdate) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(subscription) = inner.get_mut(&Ustr::from(channel)) else {
            let known = inner.keys().map(Ustr::as_str).collect::<Vec<_>>().join(", ");
            anyhow::bail!("subscription '{channel}' does not exist; registered: [{known}]");
        };

        if let Some(confirmed) = update.confirmed {
            subscription.confirmed = confirmed;
        }
        if let Some(data) = update.data {
            subscription.data = Some(data);
        }
        if let Some(needs_confirmation) = update.needs_confirmation {
            subscription.needs_confirmation = needs_confirmation;
        }

        Ok(())
    }

    /// Marks every confirmed subscription as unconfirmed (connection lost).
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for subscription in inner.values_mut() {
            if subscription.confirmed {
                subscription.confirmed = false;
                tracing::info!(channel = %subscription.channel, "Invalidated subscription");
            }
        }
    }

    /// Snapshots records that must be re-established (desired but not
    /// confirmed). Taken as a copy so replay I/O never holds the lock.
    #[must_use]
    pub fn snapshot_pending(&self) -> Vec<Subscription> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|s| s.desired && !s.confirmed)
            .cloned()
            .collect()
    }

    /// Returns whether any subscription is confirmed.
    #[must_use]
    pub fn has_active_subscriptions(&self) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .any(|s| s.confirmed)
    }

    /// Returns the number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
