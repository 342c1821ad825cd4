//! Polling with backoff.
//!
//! Uses `backon` for exponential backoff with jitter. A blocking receive
//! watches several independent queues at once, so it polls them from the
//! calling thread instead of holding a broker-side consumer.

use std::future::Future;
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::layer::Result;

/// Shortest pause between two polls.
pub const MIN_POLL_DELAY: Duration = Duration::from_millis(10);
/// Longest pause between two polls.
pub const MAX_POLL_DELAY: Duration = Duration::from_millis(250);

/// Backoff between receive polls.
///
/// - Min delay: 10ms
/// - Max delay: 250ms
/// - Jitter enabled
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(MIN_POLL_DELAY)
        .with_max_delay(MAX_POLL_DELAY)
        .with_max_times(64)
        .with_jitter()
}

fn next_delay(delays: &mut impl Iterator<Item = Duration>, deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    Some(delays.next().unwrap_or(MAX_POLL_DELAY).min(deadline - now))
}

/// Call `attempt` until it yields a value or `timeout` elapses.
///
/// Sleeps the calling thread between attempts. Errors end the loop.
pub fn poll_blocking<T, F>(timeout: Duration, mut attempt: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut delays = receive_backoff().build();
    loop {
        if let Some(value) = attempt()? {
            return Ok(Some(value));
        }
        match next_delay(&mut delays, deadline) {
            Some(delay) => std::thread::sleep(delay),
            None => return Ok(None),
        }
    }
}

/// Async counterpart of [`poll_blocking`]; sleeps on the tokio timer.
pub async fn poll_async<T, F, Fut>(timeout: Duration, mut attempt: F) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut delays = receive_backoff().build();
    loop {
        if let Some(value) = attempt().await? {
            return Ok(Some(value));
        }
        match next_delay(&mut delays, deadline) {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return Ok(None),
        }
    }
}
