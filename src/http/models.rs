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

//! Request/response envelopes for the REST engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Echo of the request that produced an [`ApiResult`], kept so callers can log
/// context without extra bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// HTTP method.
    pub method: String,
    /// Absolute URL including any query string.
    pub url: String,
    /// JSON body after null elision, when one was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// The paired outcome of a REST request: decoded JSON plus the originating
/// request. Values are cheap to clone so endpoint wrappers can enrich `data`
/// without mutating the original.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResult {
    /// Deserialized response body; `Value::Null` for an empty body.
    pub data: Value,
    /// Echo of the request envelope.
    pub request: RequestSnapshot,
}

impl ApiResult {
    /// Creates a new [`ApiResult`] instance.
    #[must_use]
    pub fn new(data: Value, request: RequestSnapshot) -> Self {
        Self { data, request }
    }

    /// Returns a copy carrying `data` in place of the original payload.
    #[must_use]
    pub fn with_data(&self, data: Value) -> Self {
        Self {
            data,
            request: self.request.clone(),
        }
    }
}

/// Removes null-valued entries from JSON objects, recursively.
///
/// The gateway applies its own defaults for absent parameters, so nulls are
/// elided rather than sent. Arrays pass through unchanged.
#[must_use]
pub fn filter_none(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), filter_none(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn test_filter_none_removes_nested_nulls() {
        let value = json!({
            "a": 1,
            "b": null,
            "c": {"d": null, "e": "kept", "f": {"g": null}},
        });

        let filtered = filter_none(&value);

        assert_eq!(
            filtered,
            json!({"a": 1, "c": {"e": "kept", "f": {}}})
        );
    }

    #[rstest]
    fn test_filter_none_is_idempotent() {
        let value = json!({"a": null, "b": {"c": null, "d": 2}, "e": [1, 2]});

        let once = filter_none(&value);
        let twice = filter_none(&once);

        assert_eq!(once, twice);
    }

    #[rstest]
    fn test_filter_none_passes_scalars_and_arrays() {
        assert_eq!(filter_none(&json!([1, null, 3])), json!([1, null, 3]));
        assert_eq!(filter_none(&json!("text")), json!("text"));
    }

    #[rstest]
    fn test_with_data_preserves_request() {
        let result = ApiResult::new(
            json!({"orders": []}),
            RequestSnapshot {
                method: "GET".to_string(),
                url: "https://localhost/v1/api/iserver/account/orders".to_string(),
                body: None,
            },
        );

        let enriched = result.with_data(json!({"orders": [{"id": 1}]}));

        assert_eq!(enriched.request, result.request);
        assert_ne!(enriched.data, result.data);
    }
}
