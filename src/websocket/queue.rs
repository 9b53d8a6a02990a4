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

//! Per-topic message queues.
//!
//! The dispatcher appends without blocking; in practice each queue serves one
//! consumer at a time. Queues are unbounded FIFOs created lazily on first
//! reference.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;

use super::messages::IbkrWsKey;

/// One unbounded FIFO.
#[derive(Debug, Default)]
struct TopicQueue {
    items: std::sync::Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl TopicQueue {
    fn push(&self, item: Value) {
        self.items
            .lock()
            .expect("topic queue lock poisoned")
            .push_back(item);
        // notify_one stores a permit when no consumer is parked, so a push
        // racing a consumer's registration cannot be lost.
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Value> {
        self.items
            .lock()
            .expect("topic queue lock poisoned")
            .pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items
            .lock()
            .expect("topic queue lock poisoned")
            .is_empty()
    }

    async fn pop_blocking(&self) -> Value {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }
}

/// Routes inbound messages to per-topic FIFO queues and exposes non-blocking
/// and blocking reads.
#[derive(Clone, Debug, Default)]
pub struct QueueHub {
    queues: Arc<DashMap<IbkrWsKey, Arc<TopicQueue>>>,
}

impl QueueHub {
    /// Creates a new [`QueueHub`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, key: IbkrWsKey) -> Arc<TopicQueue> {
        self.queues
            .entry(key)
            .or_insert_with(|| Arc::new(TopicQueue::default()))
            .clone()
    }

    /// Appends a message to the topic's queue without blocking.
    pub fn push(&self, key: IbkrWsKey, item: Value) {
        self.queue(key).push(item);
    }

    /// Returns whether the topic's queue is empty.
    #[must_use]
    pub fn empty(&self, key: IbkrWsKey) -> bool {
        self.queue(key).is_empty()
    }

    /// Retrieves the next message from the topic's queue.
    ///
    /// With `block = false`, returns `None` immediately when the queue is
    /// empty. With `block = true`, waits up to `timeout` (`None` waits
    /// indefinitely).
    pub async fn get(
        &self,
        key: IbkrWsKey,
        block: bool,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let queue = self.queue(key);

        if let Some(item) = queue.try_pop() {
            return Some(item);
        }
        if !block {
            return None;
        }

        match timeout {
            Some(limit) => tokio::time::timeout(limit, queue.pop_blocking()).await.ok(),
            None => Some(queue.pop_blocking().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn test_nonblocking_get_on_empty_returns_none() {
        let hub = QueueHub::new();

        assert!(hub.get(IbkrWsKey::MarketData, false, None).await.is_none());
        assert!(hub.empty(IbkrWsKey::MarketData));
    }

    #[rstest]
    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let hub = QueueHub::new();
        for i in 0..5 {
            hub.push(IbkrWsKey::Trades, json!({"seq": i}));
        }

        for i in 0..5 {
            let item = hub.get(IbkrWsKey::Trades, false, None).await.unwrap();
            assert_eq!(item["seq"], i);
        }
        assert!(hub.empty(IbkrWsKey::Trades));
    }

    #[rstest]
    #[tokio::test]
    async fn test_queues_are_isolated_per_topic() {
        let hub = QueueHub::new();
        hub.push(IbkrWsKey::Orders, json!({"id": 1}));

        assert!(hub.empty(IbkrWsKey::Trades));
        assert!(!hub.empty(IbkrWsKey::Orders));
    }

    #[rstest]
    #[tokio::test]
    async fn test_blocking_get_wakes_on_push() {
        let hub = QueueHub::new();
        let reader = hub.clone();

        let handle = tokio::spawn(async move {
            reader
                .get(IbkrWsKey::Pnl, true, Some(Duration::from_secs(2)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.push(IbkrWsKey::Pnl, json!({"dpl": 12.5}));

        let item = handle.await.unwrap().unwrap();
        assert_eq!(item["dpl"], 12.5);
    }

    #[rstest]
    #[tokio::test]
    async fn test_blocking_get_times_out() {
        let hub = QueueHub::new();

        let item = hub
            .get(IbkrWsKey::Bulletins, true, Some(Duration::from_millis(50)))
            .await;

        assert!(item.is_none());
    }
}
