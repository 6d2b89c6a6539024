//! The shared renewal loop behind token and certificate refresh.
//!
//! Both renewals have the same shape: an initial TTL, a periodic
//! operation that yields a new TTL plus an optional payload, and
//! success/failure hooks. The loop schedules the next attempt at half
//! the returned TTL, retries each attempt under exponential backoff
//! bounded by the remaining window, and falls back to a one-minute
//! retry when an attempt is exhausted. Renewal failures are never fatal.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use prometheus::IntCounter;
use tokio_util::sync::CancellationToken;

use crate::{Result, VaultError};

/// Fallback delay after a renewal attempt exhausts its backoff budget.
const RETRY_FLOOR: Duration = Duration::from_secs(60);

/// Result of one successful renewal operation.
pub(crate) struct Renewal<T> {
    /// The fresh TTL; the next renewal fires at half of it.
    pub ttl: u64,
    pub payload: T,
}

pub(crate) struct RenewalCounters {
    pub attempts: IntCounter,
    pub failures: IntCounter,
}

/// Bound the per-attempt backoff by the remaining renewal window.
///
/// Leaves ten seconds of slack before the credential expires; for very
/// short windows, half of it.
pub(crate) fn calculate_max_elapsed(window: Duration) -> Duration {
    if window >= Duration::from_secs(10) {
        window - Duration::from_secs(10)
    } else {
        window / 2
    }
}

/// Spawn a renewal loop that runs until the shutdown token fires.
pub(crate) fn spawn<T, Op, Fut, Success, Failure>(
    initial_ttl: u64,
    counters: RenewalCounters,
    shutdown: CancellationToken,
    mut operation: Op,
    mut on_success: Success,
    mut on_failure: Failure,
) where
    T: Send + 'static,
    Op: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Renewal<T>>> + Send,
    Success: FnMut(T) + Send + 'static,
    Failure: FnMut(VaultError) + Send + 'static,
{
    tokio::spawn(async move {
        let mut next_renewal = Duration::from_secs(initial_ttl / 2);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(next_renewal) => {}
            }

            let policy = ExponentialBackoffBuilder::new()
                .with_max_elapsed_time(Some(calculate_max_elapsed(next_renewal)))
                .build();

            let result = backoff::future::retry(policy, || {
                let attempt = operation();
                async move { attempt.await.map_err(backoff::Error::transient) }
            })
            .await;

            counters.attempts.inc();

            match result {
                Ok(renewal) => {
                    on_success(renewal.payload);
                    next_renewal = Duration::from_secs(renewal.ttl / 2);
                }
                Err(error) => {
                    counters.failures.inc();
                    on_failure(error);
                    next_renewal = RETRY_FLOOR;
                }
            }
        }
    });
}
