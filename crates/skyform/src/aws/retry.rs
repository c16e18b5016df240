//! Retry helpers.
//!
//! Some AWS APIs reject calls that are perfectly valid but arrive too
//! early (an entity that is still propagating) or race with another
//! writer (a stale lock token). These helpers wrap such calls.
use std::{future::Future, time::Duration};

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use snafu::prelude::*;

use super::{
    error::{ConflictSnafu, TimeoutSnafu},
    Error, Result,
};

/// Bounds for a retry or polling loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Give up after this long, including time spent sleeping.
    pub timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(timeout: Duration) -> Self {
        RetryPolicy {
            timeout,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    pub const fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        // The timeout bounds the loop, not the number of attempts.
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(usize::MAX)
    }
}

/// Runs `op`, retrying with exponential backoff while its error satisfies
/// `is_retryable`.
///
/// ## Errors
/// Errs with the first non-retryable error, or with [`Error::Timeout`] once
/// `policy.timeout` has elapsed.
pub async fn retry_when<T, F, Fut>(
    what: &str,
    policy: RetryPolicy,
    is_retryable: impl Fn(&Error) -> bool,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = op
        .retry(policy.backoff())
        .sleep(tokio::time::sleep)
        .when(|e: &Error| is_retryable(e))
        .notify(|e: &Error, delay: Duration| {
            log::debug!("{what}: retrying in {delay:?} after: {e}");
        });
    match tokio::time::timeout(policy.timeout, attempts).await {
        Ok(result) => result,
        Err(_) => TimeoutSnafu {
            what,
            timeout: policy.timeout,
        }
        .fail(),
    }
}

/// Runs `op` with `stored_token`, retrying once with a fresh token if the
/// lock token went stale.
///
/// On a lock failure `refresh` fetches the current token. If it differs
/// from `stored_token`, `op` runs once more with it. A second lock failure,
/// or a token that did not change, is reported as [`Error::Conflict`].
pub async fn with_optimistic_lock<T, Op, OpFut, Refresh, RefreshFut>(
    what: &str,
    stored_token: &str,
    is_lock_failure: impl Fn(&Error) -> bool,
    mut op: Op,
    refresh: Refresh,
) -> Result<T>
where
    Op: FnMut(String) -> OpFut,
    OpFut: Future<Output = Result<T>>,
    Refresh: FnOnce() -> RefreshFut,
    RefreshFut: Future<Output = Result<String>>,
{
    let error = match op(stored_token.to_owned()).await {
        Err(e) if is_lock_failure(&e) => e,
        other => return other,
    };

    let fresh_token = refresh().await?;
    ensure!(
        fresh_token != stored_token,
        ConflictSnafu {
            what,
            message: error.to_string(),
        }
    );

    log::info!("{what}: lock token is stale, retrying with the refreshed token");
    match op(fresh_token).await {
        Err(e) if is_lock_failure(&e) => ConflictSnafu {
            what,
            message: e.to_string(),
        }
        .fail(),
        other => other,
    }
}

/// The result of one poll in [`wait_until`].
#[derive(Clone, Debug, PartialEq)]
pub enum Status<T> {
    Ready(T),
    /// Not settled yet, with the current state for logging.
    Pending(String),
}

/// Polls until `poll` reports [`Status::Ready`].
pub async fn wait_until<T, F, Fut>(what: &str, policy: RetryPolicy, mut poll: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Status<T>>>,
{
    let mut delays = policy.backoff().build();
    let waiting = async {
        loop {
            match poll().await? {
                Status::Ready(value) => return Ok::<_, Error>(value),
                Status::Pending(state) => {
                    let delay = delays.next().unwrap_or(policy.max_delay);
                    log::debug!("{what} is {state}, checking again in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    };
    match tokio::time::timeout(policy.timeout, waiting).await {
        Ok(result) => result,
        Err(_) => TimeoutSnafu {
            what,
            timeout: policy.timeout,
        }
        .fail(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::aws::error::test::api_error;

    const FAST: RetryPolicy = RetryPolicy::new(Duration::from_secs(5))
        .with_delays(Duration::from_millis(1), Duration::from_millis(2));

    fn is_lock(e: &Error) -> bool {
        e.has_code(&["WAFOptimisticLockException"])
    }

    #[tokio::test]
    async fn retry_when_retries_until_success() {
        let calls = &AtomicUsize::new(0);
        let value = retry_when(
            "create",
            FAST,
            |e| e.has_code(&["WAFUnavailableEntityException"]),
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(api_error("CreateWebACL", "WAFUnavailableEntityException"))
                } else {
                    Ok("acl")
                }
            },
        )
        .await
        .unwrap();
        assert_eq!("acl", value);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retry_when_surfaces_other_errors_immediately() {
        let calls = &AtomicUsize::new(0);
        let error = retry_when(
            "create",
            FAST,
            |e| e.has_code(&["WAFUnavailableEntityException"]),
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(api_error("CreateWebACL", "WAFInvalidParameterException"))
            },
        )
        .await
        .unwrap_err();
        assert_eq!(Some("WAFInvalidParameterException"), error.code());
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retry_when_times_out() {
        let policy = FAST.with_delays(Duration::from_millis(5), Duration::from_millis(5));
        let policy = RetryPolicy {
            timeout: Duration::from_millis(30),
            ..policy
        };
        let error = retry_when(
            "delete",
            policy,
            |_| true,
            || async { Err::<(), _>(api_error("DeleteWebACL", "WAFAssociatedItemException")) },
        )
        .await
        .unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }), "{error}");
    }

    #[tokio::test]
    async fn lock_retry_uses_the_refreshed_token() {
        let tokens = Mutex::new(vec![]);
        let value = with_optimistic_lock(
            "web acl",
            "stale",
            is_lock,
            |token| {
                tokens.lock().unwrap().push(token.clone());
                async move {
                    if token == "stale" {
                        Err(api_error("UpdateWebACL", "WAFOptimisticLockException"))
                    } else {
                        Ok(token)
                    }
                }
            },
            || async { Ok("fresh".to_owned()) },
        )
        .await
        .unwrap();
        assert_eq!("fresh", value);
        assert_eq!(vec!["stale", "fresh"], *tokens.lock().unwrap());
    }

    #[tokio::test]
    async fn lock_failure_with_unchanged_token_is_a_conflict() {
        let calls = &AtomicUsize::new(0);
        let error = with_optimistic_lock(
            "web acl",
            "same",
            is_lock,
            |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(api_error("UpdateWebACL", "WAFOptimisticLockException"))
            },
            || async { Ok("same".to_owned()) },
        )
        .await
        .unwrap_err();
        assert!(error.is_conflict(), "{error}");
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn second_lock_failure_is_a_conflict() {
        let calls = &AtomicUsize::new(0);
        let error = with_optimistic_lock(
            "web acl",
            "a",
            is_lock,
            |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(api_error("DeleteWebACL", "WAFOptimisticLockException"))
            },
            || async { Ok("b".to_owned()) },
        )
        .await
        .unwrap_err();
        assert!(error.is_conflict(), "{error}");
        assert!(error.to_string().contains("has changed since last refresh"));
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn non_lock_errors_are_not_retried() {
        let refreshed = &AtomicUsize::new(0);
        let error = with_optimistic_lock(
            "web acl",
            "a",
            is_lock,
            |_| async { Err::<(), _>(api_error("DeleteWebACL", "AccessDeniedException")) },
            || async move {
                refreshed.fetch_add(1, Ordering::SeqCst);
                Ok("b".to_owned())
            },
        )
        .await
        .unwrap_err();
        assert_eq!(Some("AccessDeniedException"), error.code());
        assert_eq!(0, refreshed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_until_polls_until_ready() {
        let polls = &AtomicUsize::new(0);
        let value = wait_until("vpc link", FAST, || async move {
            match polls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Ok(Status::Pending("PENDING".to_owned())),
                _ => Ok(Status::Ready("AVAILABLE")),
            }
        })
        .await
        .unwrap();
        assert_eq!("AVAILABLE", value);
        assert_eq!(3, polls.load(Ordering::SeqCst));
    }
}
