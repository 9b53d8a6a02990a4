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

//! Portfolio endpoints.

use super::IbkrHttpClient;
use crate::http::{IbkrHttpResult, models::ApiResult};

impl IbkrHttpClient {
    /// Returns positions for an account, paged.
    ///
    /// # Errors
    ///
    /// Returns a config error when no account is available.
    pub async fn positions(
        &self,
        account_id: Option<&str>,
        page: u32,
    ) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;
        self.get(&format!("portfolio/{account}/positions/{page}"), None)
            .await
    }

    /// Returns the account ledger.
    ///
    /// # Errors
    ///
    /// Returns a config error when no account is available.
    pub async fn portfolio_ledger(&self, account_id: Option<&str>) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;
        self.get(&format!("portfolio/{account}/ledger"), None).await
    }

    /// Returns the portfolio allocation by asset class, sector, and group.
    ///
    /// # Errors
    ///
    /// Returns a config error when no account is available.
    pub async fn portfolio_allocation(
        &self,
        account_id: Option<&str>,
    ) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;
        self.get(&format!("portfolio/{account}/allocation"), None)
            .await
    }
}
