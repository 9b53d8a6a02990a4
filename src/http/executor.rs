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

//! Parallel request execution with rate limiting.
//!
//! Runs jobs through a bounded worker pool while enforcing a per-second start
//! ceiling. Job failures are captured in place, never propagated, so a single
//! bad request cannot poison a batch.

use std::{collections::HashMap, future::Future, hash::Hash, num::NonZeroU32};

use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;

use super::error::IbkrHttpResult;

/// Default per-second start ceiling.
pub const DEFAULT_MAX_PER_SECOND: u32 = 20;

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8)
        .min(32)
}

/// Executes jobs concurrently, returning results in input order.
///
/// `max_workers` bounds in-flight jobs (a runtime-derived default when
/// `None`); `max_per_second` bounds job starts per wall-clock second. Each
/// slot in the returned vector holds the corresponding job's outcome.
pub async fn execute_in_parallel<T, F, Fut>(
    jobs: Vec<F>,
    max_workers: Option<usize>,
    max_per_second: u32,
) -> Vec<IbkrHttpResult<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = IbkrHttpResult<T>>,
{
    let workers = max_workers.unwrap_or_else(default_workers).max(1);
    let quota = Quota::per_second(
        NonZeroU32::new(max_per_second.max(1)).expect("max_per_second clamped to non-zero"),
    );
    let limiter = RateLimiter::direct(quota);
    let semaphore = Semaphore::new(workers);

    let futures = jobs.into_iter().map(|job| {
        let limiter = &limiter;
        let semaphore = &semaphore;
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("executor semaphore closed");
            limiter.until_ready().await;
            job().await
        }
    });

    futures_util::future::join_all(futures).await
}

/// Executes keyed jobs concurrently, returning results keyed like the input.
pub async fn execute_in_parallel_keyed<K, T, F, Fut>(
    jobs: Vec<(K, F)>,
    max_workers: Option<usize>,
    max_per_second: u32,
) -> HashMap<K, IbkrHttpResult<T>>
where
    K: Eq + Hash,
    F: FnOnce() -> Fut,
    Fut: Future<Output = IbkrHttpResult<T>>,
{
    let (keys, funcs): (Vec<K>, Vec<F>) = jobs.into_iter().unzip();
    let results = execute_in_parallel(funcs, max_workers, max_per_second).await;

    keys.into_iter().zip(results).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use rstest::rstest;

    use super::*;
    use crate::http::error::IbkrHttpError;

    #[rstest]
    #[tokio::test]
    async fn test_results_keep_input_order() {
        let jobs: Vec<_> = (0..10u64)
            .map(|i| {
                move || async move {
                    // Later jobs finish first to exercise ordering.
                    tokio::time::sleep(std::time::Duration::from_millis(20 - i)).await;
                    Ok(i)
                }
            })
            .collect();

        let results = execute_in_parallel(jobs, Some(10), 1000).await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..10u64).collect::<Vec<_>>());
    }

    #[rstest]
    #[tokio::test]
    async fn test_errors_captured_in_place() {
        let jobs: Vec<_> = (0..4)
            .map(|i| {
                move || async move {
                    if i % 2 == 0 {
                        Ok(i)
                    } else {
                        Err(IbkrHttpError::Transport(format!("job {i} failed")))
                    }
                }
            })
            .collect();

        let results = execute_in_parallel(jobs, None, 1000).await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert!(results[3].is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn test_worker_ceiling_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..12)
            .map(|_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();

        execute_in_parallel(jobs, Some(3), 1000).await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[rstest]
    #[tokio::test]
    async fn test_keyed_results_keyed_like_input() {
        let jobs: Vec<_> = [("aapl", 1), ("msft", 2)]
            .into_iter()
            .map(|(key, value)| (key, move || async move { Ok(value) }))
            .collect();

        let results = execute_in_parallel_keyed(jobs, None, 1000).await;

        assert_eq!(*results["aapl"].as_ref().unwrap(), 1);
        assert_eq!(*results["msft"].as_ref().unwrap(), 2);
    }
}
