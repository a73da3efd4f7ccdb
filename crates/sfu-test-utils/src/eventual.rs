//! Eventual-condition helpers for timing-dependent tests.
//!
//! Disconnect cleanup and push fan-out complete on other tasks after the
//! triggering call returns. These helpers poll with exponential backoff
//! instead of sleeping a fixed amount.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Categories of asynchronous work with their maximum wait.
#[derive(Debug, Clone, Copy)]
pub enum ConsistencyCategory {
    /// Registry cleanup after a socket closes (5s)
    RegistryCleanup,

    /// Push delivery to other connections (5s)
    PushDelivery,

    /// Client-side state settling after a push or capture (5s)
    ClientState,
}

impl ConsistencyCategory {
    /// Maximum time to wait for this category.
    pub fn timeout(&self) -> Duration {
        match self {
            ConsistencyCategory::RegistryCleanup
            | ConsistencyCategory::PushDelivery
            | ConsistencyCategory::ClientState => Duration::from_secs(5),
        }
    }

    /// Initial retry delay for exponential backoff.
    fn initial_delay(&self) -> Duration {
        Duration::from_millis(10)
    }
}

/// Assert that a condition becomes true within the category's timeout.
///
/// Backoff starts at 10ms and doubles, capped at the remaining time.
///
/// # Example
///
/// ```no_run
/// use sfu_test_utils::eventual::{assert_eventually, ConsistencyCategory};
///
/// # async fn room_count() -> usize { 0 }
/// # async fn example() {
/// assert_eventually(ConsistencyCategory::RegistryCleanup, || async {
///     room_count().await == 0
/// })
/// .await
/// .expect("room should be removed");
/// # }
/// ```
pub async fn assert_eventually<F, Fut>(
    category: ConsistencyCategory,
    mut condition: F,
) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let timeout = category.timeout();
    let mut delay = category.initial_delay();
    let start = Instant::now();

    loop {
        if condition().await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Condition not met within {:?} (category: {:?})",
                timeout, category
            ));
        }

        sleep(delay).await;

        delay *= 2;
        let remaining = timeout.saturating_sub(elapsed);
        if delay > remaining {
            delay = remaining;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_category_timeouts() {
        assert_eq!(
            ConsistencyCategory::RegistryCleanup.timeout(),
            Duration::from_secs(5)
        );
        assert_eq!(
            ConsistencyCategory::ClientState.initial_delay(),
            Duration::from_millis(10)
        );
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result = assert_eventually(ConsistencyCategory::PushDelivery, || async { true }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_succeeds_after_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = assert_eventually(ConsistencyCategory::ClientState, move || {
            let attempts = counter.clone();
            async move { attempts.fetch_add(1, Ordering::SeqCst) + 1 >= 3 }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_on_timeout() {
        let result =
            assert_eventually(ConsistencyCategory::RegistryCleanup, || async { false }).await;
        let err = result.expect_err("should time out");
        assert!(err.contains("not met within"));
    }
}
