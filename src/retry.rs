//! Retry with bounded backoff.
//!
//! Network calls and flaky external commands share one retry shape: run the
//! operation, test the result, sleep with a multiplicative backoff, try
//! again up to a fixed count. The final attempt's result is returned
//! whatever it is; nothing here catches errors.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// A bounded retry policy: number of tries, initial sleep between tries and
/// the factor the sleep grows by after each try.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub tries: u32,
    pub initial_sleep: Duration,
    pub backoff: f64,
}

impl Policy {
    pub const fn new(tries: u32, initial_sleep: Duration, backoff: f64) -> Self {
        Self {
            tries,
            initial_sleep,
            backoff,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 1.5)
    }
}

/// Run `f` until `done` accepts its result or the policy's tries are
/// exhausted, sleeping between attempts. Returns the last result either way.
pub async fn run<T, F, Fut, P>(policy: Policy, mut f: F, mut done: P) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: FnMut(&T) -> bool,
{
    let tries = policy.tries.max(1);
    let mut sleep_for = policy.initial_sleep;

    for attempt in 1..=tries {
        let ret = f().await;

        if done(&ret) || attempt == tries {
            return ret;
        }

        tracing::debug!(
            "RETRY : attempt={}/{} : sleep={:?}",
            attempt,
            tries,
            sleep_for
        );
        sleep(sleep_for).await;
        sleep_for = Duration::from_secs_f64(sleep_for.as_secs_f64() * policy.backoff);
    }

    unreachable!("retry loop returns on final attempt")
}
