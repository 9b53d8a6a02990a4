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

//! Order endpoints and the interactive question/answer flow.
//!
//! Order submission can return precautionary questions that must be confirmed
//! through the reply endpoint before the order is accepted. Placement and
//! modification are serialized per client instance to avoid duplicate order
//! ids.

use serde_json::{Value, json};

use super::IbkrHttpClient;
use crate::http::{IbkrHttpError, IbkrHttpResult, models::ApiResult};

const MAX_QUESTION_ROUNDS: usize = 20;

/// Common precautionary messages returned during order submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuestionType {
    /// Price deviates from the percentage constraint.
    PricePercentageConstraint,
    /// Order value exceeds the configured limit.
    OrderValueLimit,
    /// Order submitted without market data.
    MissingMarketData,
    /// Stop-order risk acknowledgement.
    StopOrderRisks,
}

impl QuestionType {
    /// Returns the message fragment identifying the question.
    #[must_use]
    pub fn text(&self) -> &'static str {
        match self {
            Self::PricePercentageConstraint => "price exceeds the Percentage constraint of 3%",
            Self::OrderValueLimit => "exceeds the Total Value Limit of",
            Self::MissingMarketData => "You are submitting an order without market data",
            Self::StopOrderRisks => "You are about to submit a stop order",
        }
    }
}

/// Question fragments paired with the caller's accept/reject decision.
///
/// Fragments are matched by substring against the question text; use
/// [`QuestionType::text`] for the common ones.
pub type Answers = Vec<(String, bool)>;

fn find_answer(question: &str, answers: &Answers) -> IbkrHttpResult<bool> {
    answers
        .iter()
        .find(|(fragment, _)| question.contains(fragment.as_str()))
        .map(|(_, accept)| *accept)
        .ok_or_else(|| {
            IbkrHttpError::Protocol(format!("no answer found for question: \"{question}\""))
        })
}

impl IbkrHttpClient {
    /// Retrieves live orders, optionally filtered by status.
    ///
    /// `force` clears cached order information; query all orders once with
    /// `force` before subscribing to the live order stream.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn live_orders(
        &self,
        filters: Option<&[&str]>,
        force: Option<bool>,
        account_id: Option<&str>,
    ) -> IbkrHttpResult<ApiResult> {
        let params = json!({
            "filters": filters.map(|f| f.join(",")),
            "force": force,
            "accountId": account_id,
        });
        self.get("iserver/account/orders", Some(&params)).await
    }

    /// Returns the status of an individual order.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn order_status(&self, order_id: &str) -> IbkrHttpResult<ApiResult> {
        self.get(&format!("iserver/account/order/status/{order_id}"), None)
            .await
    }

    /// Returns trades for the current day and up to six previous days.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn trades(
        &self,
        days: Option<u8>,
        account_id: Option<&str>,
    ) -> IbkrHttpResult<ApiResult> {
        let params = json!({
            "days": days,
            "accountId": account_id.map(str::to_string).or_else(|| self.config().account_id.clone()),
        });
        self.get("iserver/account/trades", Some(&params)).await
    }

    /// Submits one or more orders, answering any precautionary questions from
    /// `answers`.
    ///
    /// # Errors
    ///
    /// - Config error when no account is available.
    /// - Protocol error on an unanswered or rejected question, or when the
    ///   question rounds exceed the bound.
    pub async fn place_order(
        &self,
        order_request: Value,
        answers: &Answers,
        account_id: Option<&str>,
    ) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;
        let orders = normalize_orders(order_request);

        let _guard = self.order_lock.lock().await;
        let result = self
            .post(
                &format!("iserver/account/{account}/orders"),
                Some(&json!({ "orders": orders })),
            )
            .await?;

        self.handle_questions(result, answers).await
    }

    /// Modifies an existing order, answering any precautionary questions.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::place_order`].
    pub async fn modify_order(
        &self,
        order_id: &str,
        order_request: Value,
        answers: &Answers,
        account_id: Option<&str>,
    ) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;

        let _guard = self.order_lock.lock().await;
        let result = self
            .post(
                &format!("iserver/account/{account}/order/{order_id}"),
                Some(&order_request),
            )
            .await?;

        self.handle_questions(result, answers).await
    }

    /// Cancels an open order.
    ///
    /// # Errors
    ///
    /// Returns a config error when no account is available.
    pub async fn cancel_order(
        &self,
        order_id: &str,
        account_id: Option<&str>,
    ) -> IbkrHttpResult<ApiResult> {
        let account = self.target_account(account_id)?;
        self.delete(&format!("iserver/account/{account}/order/{order_id}"), None)
            .await
    }

    /// Confirms or rejects an order question.
    ///
    /// # Errors
    ///
    /// Propagates REST engine errors.
    pub async fn reply(&self, reply_id: &str, confirmed: bool) -> IbkrHttpResult<ApiResult> {
        self.post(
            &format!("iserver/reply/{reply_id}"),
            Some(&json!({ "confirmed": confirmed })),
        )
        .await
    }

    /// Walks the question/answer flow until the gateway returns order data.
    ///
    /// Each round expects at most one question; an unanswered question, a
    /// rejected question, or more than [`MAX_QUESTION_ROUNDS`] rounds is a
    /// protocol error.
    async fn handle_questions(
        &self,
        original: ApiResult,
        answers: &Answers,
    ) -> IbkrHttpResult<ApiResult> {
        let mut result = original.clone();

        for _ in 0..MAX_QUESTION_ROUNDS {
            let data = result.data.clone();

            if let Some(error) = data.get("error") {
                let message = error.as_str().unwrap_or_default();
                if let Some(order_tag) =
                    duplicate_order_tag(original.request.body.as_ref(), message)
                {
                    return Err(IbkrHttpError::ExternalBroker {
                        status_code: None,
                        message: format!(
                            "order could not be submitted: order with cOID '{order_tag}' is \
                             already registered"
                        ),
                    });
                }
                return Err(IbkrHttpError::ExternalBroker {
                    status_code: None,
                    message: format!("while handling questions an error was returned: {error}"),
                });
            }

            let Some(items) = data.as_array() else {
                return Err(IbkrHttpError::Protocol(format!(
                    "while handling questions unknown data was returned: {data}"
                )));
            };
            let Some(first) = items.first() else {
                return Err(IbkrHttpError::Protocol(
                    "while handling questions an empty response was returned".into(),
                ));
            };

            // Messages are interpreted as questions; their absence ends the flow.
            let Some(messages) = first.get("message").and_then(Value::as_array) else {
                let data = if items.len() == 1 {
                    first.clone()
                } else {
                    Value::Array(items.clone())
                };
                return Ok(original.with_data(data));
            };

            if items.len() != 1 {
                tracing::warn!(count = items.len(), "Multiple orders returned while handling questions");
            }
            if messages.len() != 1 {
                tracing::warn!(count = messages.len(), "Multiple messages returned while handling questions");
            }

            let question = messages
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if !find_answer(&question, answers)? {
                return Err(IbkrHttpError::Protocol(format!(
                    "question was rejected: \"{question}\""
                )));
            }

            let reply_id = first
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| IbkrHttpError::Protocol("question is missing a reply id".into()))?;

            tracing::info!(question = %question, "Answering order question");
            result = self.reply(reply_id, true).await?;
        }

        Err(IbkrHttpError::Protocol(format!(
            "too many questions: {MAX_QUESTION_ROUNDS} rounds exhausted"
        )))
    }
}

fn normalize_orders(order_request: Value) -> Value {
    match order_request {
        Value::Array(orders) => Value::Array(orders),
        single => Value::Array(vec![single]),
    }
}

/// Detects the gateway's duplicate-order rejection for the submitted order's
/// `cOID`, returning the tag. The match is scoped to the exact phrasing the
/// gateway emits for that order tag so unrelated "already registered" errors
/// surface unchanged.
fn duplicate_order_tag(request_body: Option<&Value>, error: &str) -> Option<String> {
    let order_tag = request_body?.pointer("/orders/0/cOID")?.as_str()?;
    let needle =
        format!("Order couldn't be submitted: Local order ID={order_tag} is already registered.");
    error.contains(&needle).then(|| order_tag.to_string())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn test_find_answer_matches_fragment() {
        let answers: Answers = vec![
            (QuestionType::PricePercentageConstraint.text().to_string(), true),
            ("custom warning".to_string(), false),
        ];

        let question = "The price exceeds the Percentage constraint of 3%. Are you sure?";
        assert!(find_answer(question, &answers).unwrap());
        assert!(!find_answer("some custom warning text", &answers).unwrap());
    }

    #[rstest]
    fn test_find_answer_unknown_question_errors() {
        let answers: Answers = vec![("known".to_string(), true)];

        let err = find_answer("completely novel question", &answers).unwrap_err();

        assert!(matches!(err, IbkrHttpError::Protocol(_)));
    }

    #[rstest]
    fn test_duplicate_order_tag_matches_exact_phrasing() {
        let body = json!({"orders": [{"conid": 265598, "cOID": "my-tag-1"}]});
        let error =
            "Order couldn't be submitted: Local order ID=my-tag-1 is already registered.";

        assert_eq!(
            duplicate_order_tag(Some(&body), error),
            Some("my-tag-1".to_string())
        );
    }

    #[rstest]
    #[case("contact is already registered")]
    #[case("Order couldn't be submitted: Local order ID=other-tag is already registered.")]
    fn test_duplicate_order_tag_ignores_unrelated_errors(#[case] error: &str) {
        let body = json!({"orders": [{"conid": 265598, "cOID": "my-tag-1"}]});

        assert_eq!(duplicate_order_tag(Some(&body), error), None);
    }

    #[rstest]
    fn test_duplicate_order_tag_requires_coid() {
        let body = json!({"orders": [{"conid": 265598}]});
        let error = "Order couldn't be submitted: Local order ID=x is already registered.";

        assert_eq!(duplicate_order_tag(Some(&body), error), None);
        assert_eq!(duplicate_order_tag(None, error), None);
    }

    #[rstest]
    fn test_normalize_orders_wraps_single() {
        let single = json!({"conid": 265598, "side": "BUY"});

        let normalized = normalize_orders(single.clone());

        assert_eq!(normalized, json!([single]));
        assert_eq!(
            normalize_orders(json!([1, 2])),
            json!([1, 2])
        );
    }
}
