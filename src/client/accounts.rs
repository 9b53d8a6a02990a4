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

//! Account endpoints.

use serde_json::json;

use super::IbkrHttpClient;
use crate::http::{IbkrHttpResult, models::ApiResult};

impl IbkrHttpClient {
    /// Returns the brokerage accounts for the current session.
    ///
    /// Pre-flight for several endpoints, including market-data snapshots.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn brokerage_accounts(&self) -> IbkrHttpResult<ApiResult> {
        self.get("iserver/accounts", None).await
    }

    /// Returns the portfolio accounts.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn portfolio_accounts(&self) -> IbkrHttpResult<ApiResult> {
        self.get("portfolio/accounts", None).await
    }

    /// Switches the active account for linked-account setups.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn switch_account(&self, account_id: &str) -> IbkrHttpResult<ApiResult> {
        self.post("iserver/account", Some(&json!({ "acctId": account_id })))
            .await
    }

    /// Returns the account summary.
    ///
    /// # Errors
    ///
    /// Returns a config error when no account is available.
    pub async fn account_summary(&self, account_id: Option<&str>) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;
        self.get(&format!("portfolio/{account}/summary"), None).await
    }
}
