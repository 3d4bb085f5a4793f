use std::time::{Duration, SystemTime};

use rand::RngExt;

use crate::response::HttpResponse;
use crate::util::parse_retry_after;

pub trait Backoff: Send + Sync {
    fn backoff(
        &self,
        attempt: u32,
        min_wait: Duration,
        max_wait: Duration,
        last_response: Option<&HttpResponse>,
    ) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32, Duration, Duration, Option<&HttpResponse>) -> Duration + Send + Sync,
{
    fn backoff(
        &self,
        attempt: u32,
        min_wait: Duration,
        max_wait: Duration,
        last_response: Option<&HttpResponse>,
    ) -> Duration {
        self(attempt, min_wait, max_wait, last_response)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExponentialBackoff;

impl Backoff for ExponentialBackoff {
    fn backoff(
        &self,
        attempt: u32,
        min_wait: Duration,
        max_wait: Duration,
        last_response: Option<&HttpResponse>,
    ) -> Duration {
        let max_wait = max_wait.max(min_wait);
        if let Some(delay) = retry_after(last_response) {
            return delay.min(max_wait);
        }
        exponential(attempt, min_wait, max_wait)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LinearJitterBackoff;

impl Backoff for LinearJitterBackoff {
    fn backoff(
        &self,
        attempt: u32,
        min_wait: Duration,
        max_wait: Duration,
        last_response: Option<&HttpResponse>,
    ) -> Duration {
        let max_wait = max_wait.max(min_wait);
        if let Some(delay) = retry_after(last_response) {
            return delay.min(max_wait);
        }
        let attempt = attempt.max(1);
        let low = min_wait.saturating_mul(attempt).min(max_wait);
        let high = max_wait.saturating_mul(attempt).min(max_wait);
        sample_between(low, high)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FullJitterBackoff;

impl Backoff for FullJitterBackoff {
    fn backoff(
        &self,
        attempt: u32,
        min_wait: Duration,
        max_wait: Duration,
        last_response: Option<&HttpResponse>,
    ) -> Duration {
        let max_wait = max_wait.max(min_wait);
        if let Some(delay) = retry_after(last_response) {
            return delay.min(max_wait);
        }
        let ceiling = exponential(attempt.saturating_add(1), min_wait, max_wait);
        sample_between(min_wait, ceiling)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExponentialJitterBackoff;

impl Backoff for ExponentialJitterBackoff {
    fn backoff(
        &self,
        attempt: u32,
        min_wait: Duration,
        max_wait: Duration,
        last_response: Option<&HttpResponse>,
    ) -> Duration {
        let max_wait = max_wait.max(min_wait);
        if let Some(delay) = retry_after(last_response) {
            return delay.min(max_wait);
        }
        let base = exponential(attempt, min_wait, max_wait);
        let spread = base / 2;
        sample_between(base.saturating_sub(spread), base.saturating_add(spread)).min(max_wait)
    }
}

fn exponential(attempt: u32, min_wait: Duration, max_wait: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    min_wait
        .checked_mul(1_u32 << exponent)
        .unwrap_or(max_wait)
        .min(max_wait)
}

fn retry_after(last_response: Option<&HttpResponse>) -> Option<Duration> {
    parse_retry_after(last_response?.headers(), SystemTime::now())
}

fn sample_between(low: Duration, high: Duration) -> Duration {
    let low_ms = low.as_millis().min(u64::MAX as u128) as u64;
    let high_ms = high.as_millis().min(u64::MAX as u128) as u64;
    if high_ms <= low_ms {
        return low;
    }
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(low_ms..=high_ms))
}
