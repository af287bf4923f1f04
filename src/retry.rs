//! Bounded retry executor with a fixed delay between attempts.
//!
//! Every request the engine sends through a connection is wrapped in
//! [`with_retries_notify`], as is the initial block subscription. The delay
//! is constant: pacing against the node is the only goal, so there is no
//! backoff or jitter.
//!
//! # Example
//!
//! ```
//! use bloxer::retry::with_retries;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut calls = 0;
//! let result: Result<u32, &str> = with_retries(
//!     || {
//!         calls += 1;
//!         let attempt = calls;
//!         async move { if attempt < 3 { Err("busy") } else { Ok(attempt) } }
//!     },
//!     5,
//!     Duration::from_millis(1),
//! )
//! .await;
//! assert_eq!(result, Ok(3));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

/// Runs `operation` until it succeeds or `max_retries` retries have failed.
///
/// The operation is invoked at most `max_retries + 1` times. The error of
/// the last attempt is returned once the budget is spent.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn with_retries<T, E, F, Fut>(
    operation: F,
    max_retries: u32,
    delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retries_notify(operation, max_retries, delay, |_| {}).await
}

/// Same as [`with_retries`], calling `on_retry` with each error that is
/// going to be retried.
///
/// `on_retry` is not called for the final error, which is returned instead.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn with_retries_notify<T, E, F, Fut, N>(
    mut operation: F,
    max_retries: u32,
    delay: Duration,
    mut on_retry: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(&E),
{
    let mut retries = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if retries < max_retries => {
                retries += 1;
                on_retry(&err);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
