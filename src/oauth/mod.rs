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

//! OAuth 1.0a authentication for the IBKR Client Portal Web API.
//!
//! The flow derives a short-lived live session token (LST) from a
//! Diffie-Hellman exchange with the gateway, then signs every protected
//! request with HMAC-SHA256 keyed by that token.

pub mod config;
pub mod lst;
pub mod signer;

pub use config::{OAuth1aConfig, Secret};
pub use signer::{LiveSessionToken, OAuth1aSigner};
