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

//! Market data endpoints.

use serde_json::json;

use super::IbkrHttpClient;
use crate::http::{IbkrHttpResult, models::ApiResult};

impl IbkrHttpClient {
    /// Returns a market data snapshot for the given contracts.
    ///
    /// The gateway requires the brokerage accounts to have been queried in
    /// the session before the first snapshot, so that pre-flight runs here.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn marketdata_snapshot(
        &self,
        conids: &[i64],
        fields: &[&str],
    ) -> IbkrHttpResult<ApiResult> {
        self.brokerage_accounts().await?;

        let params = json!({
            "conids": join(conids),
            "fields": fields.join(","),
        });
        self.get("iserver/marketdata/snapshot", Some(&params)).await
    }

    /// Returns historical bars for a contract.
    ///
    /// `outside_rth` is left to the gateway default when `None`.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn marketdata_history(
        &self,
        conid: i64,
        bar: &str,
        period: &str,
        exchange: Option<&str>,
        outside_rth: Option<bool>,
    ) -> IbkrHttpResult<ApiResult> {
        let params = json!({
            "conid": conid.to_string(),
            "bar": bar,
            "period": period,
            "exchange": exchange,
            "outsideRth": outside_rth,
        });
        self.get("iserver/marketdata/history", Some(&params)).await
    }

    /// Cancels the market data feed for a contract.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn marketdata_unsubscribe(&self, conid: i64) -> IbkrHttpResult<ApiResult> {
        self.post(&format!("iserver/marketdata/{conid}/unsubscribe"), None)
            .await
    }

    /// Cancels all market data feeds.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn marketdata_unsubscribe_all(&self) -> IbkrHttpResult<ApiResult> {
        self.post("iserver/marketdata/unsubscribeall", None).await
    }
}

fn join(conids: &[i64]) -> String {
    conids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
