//! Releasing a lease after execution.
//!
//! Translates an execution outcome into the next item state using the
//! [`RetryPolicy`], then applies it with a lease-conditional update.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::{RetryDecision, RetryPolicy};

use crate::execution::ExecutionError;
use crate::lease_store::{
    ClaimedItem, FailureTransition, FailureUpdate, LeaseStore, LeaseStoreError,
};

/// What a release did to the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Succeeded,
    /// `failed_retryable`; eligible again after `retry_after`.
    RetryScheduled {
        failure_count: u32,
        retry_after: Duration,
    },
    /// `failed_terminal`.
    Terminal { failure_count: u32 },
    /// The lease no longer held (swept, possibly re-claimed); nothing changed.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct RetryHandler<S> {
    store: S,
    policy: RetryPolicy,
    release_attempts: u32,
    release_backoff: Duration,
}

impl<S: LeaseStore> RetryHandler<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            release_attempts: 3,
            release_backoff: Duration::from_millis(200),
        }
    }

    /// How often a release is attempted while the store is unavailable.
    pub fn with_release_attempts(mut self, attempts: u32, backoff: Duration) -> Self {
        self.release_attempts = attempts.max(1);
        self.release_backoff = backoff;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn on_success(
        &self,
        claimed: &ClaimedItem,
        result: Option<serde_json::Value>,
    ) -> Result<ReleaseOutcome, LeaseStoreError> {
        let released = self
            .with_retries("mark_succeeded", || {
                self.store.mark_succeeded(&claimed.lease, result.clone())
            })
            .await?;

        if !released {
            warn!(item_id = %claimed.id(), "lease lost before success could be recorded");
            return Ok(ReleaseOutcome::LeaseLost);
        }
        debug!(item_id = %claimed.id(), attempt = claimed.attempt(), "work item succeeded");
        Ok(ReleaseOutcome::Succeeded)
    }

    pub async fn on_failure(
        &self,
        claimed: &ClaimedItem,
        error: &ExecutionError,
    ) -> Result<ReleaseOutcome, LeaseStoreError> {
        let failure_count = claimed.lease.failure_count + 1;
        let decision = if error.is_terminal() {
            RetryDecision::Terminal
        } else {
            self.policy.decide(failure_count)
        };

        let transition = match decision {
            RetryDecision::RetryAfter(after) => FailureTransition::Retry { after },
            RetryDecision::Terminal => FailureTransition::Terminal,
        };
        let update = FailureUpdate {
            failure_count,
            last_error: error.message().to_string(),
            transition,
        };

        let released = self
            .with_retries("mark_failed", || self.store.mark_failed(&claimed.lease, &update))
            .await?;

        if !released {
            warn!(
                item_id = %claimed.id(),
                error = %error,
                "lease lost before failure could be recorded"
            );
            return Ok(ReleaseOutcome::LeaseLost);
        }

        match transition {
            FailureTransition::Retry { after } => {
                info!(
                    item_id = %claimed.id(),
                    failure_count,
                    retry_after_secs = after.as_secs(),
                    error = %error,
                    "work item failed; retry scheduled"
                );
                Ok(ReleaseOutcome::RetryScheduled {
                    failure_count,
                    retry_after: after,
                })
            }
            FailureTransition::Terminal => {
                warn!(
                    item_id = %claimed.id(),
                    failure_count,
                    error = %error,
                    "work item failed terminally"
                );
                Ok(ReleaseOutcome::Terminal { failure_count })
            }
        }
    }

    /// Retry a release while the store reports itself unavailable.
    ///
    /// Releases are lease-conditional, so repeating one that already landed
    /// just reports the lease as gone.
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, LeaseStoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LeaseStoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_unavailable() && attempt < self.release_attempts => {
                    warn!(operation, attempt, error = %e, "release failed; retrying");
                    tokio::time::sleep(self.release_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_store::flaky::FlakyStore;
    use crate::lease_store::{InMemoryLeaseStore, NewWorkItem};
    use parley_core::{BackoffSchedule, EligibilityFilter, WorkState, WorkerId};
    use serde_json::json;
    use std::sync::Arc;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, BackoffSchedule::from_secs(&[30, 120]).unwrap()).unwrap()
    }

    async fn claimed(store: &Arc<InMemoryLeaseStore>) -> ClaimedItem {
        store
            .try_claim(&EligibilityFilter::any(), &WorkerId::generate("retry-test"))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn success_releases_with_result() {
        let store = InMemoryLeaseStore::arc();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let handler = RetryHandler::new(store.clone(), policy(3));

        let item = claimed(&store).await;
        let outcome = handler.on_success(&item, Some(json!({"transcript": "hi"}))).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Succeeded);

        let stored = store.get(item.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Succeeded);
        assert_eq!(stored.result, Some(json!({"transcript": "hi"})));
    }

    #[tokio::test]
    async fn transient_failures_follow_the_schedule() {
        let store = InMemoryLeaseStore::arc();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let handler = RetryHandler::new(store.clone(), policy(3));

        let item = claimed(&store).await;
        let outcome = handler
            .on_failure(&item, &ExecutionError::transient("timeout"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReleaseOutcome::RetryScheduled {
                failure_count: 1,
                retry_after: Duration::from_secs(30)
            }
        );

        let stored = store.get(item.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkState::FailedRetryable);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn terminal_errors_skip_backoff() {
        let store = InMemoryLeaseStore::arc();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let handler = RetryHandler::new(store.clone(), policy(3));

        let item = claimed(&store).await;
        let outcome = handler
            .on_failure(&item, &ExecutionError::terminal("payload missing room_name"))
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::Terminal { failure_count: 1 });
        assert_eq!(
            store.get(item.id()).await.unwrap().unwrap().state,
            WorkState::FailedTerminal
        );
    }

    #[tokio::test]
    async fn ceiling_makes_failure_terminal() {
        let store = InMemoryLeaseStore::arc();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let handler = RetryHandler::new(store.clone(), policy(1));

        let item = claimed(&store).await;
        let outcome = handler
            .on_failure(&item, &ExecutionError::transient("boom"))
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::Terminal { failure_count: 1 });
    }

    #[tokio::test]
    async fn lost_lease_is_reported_not_applied() {
        let store = InMemoryLeaseStore::arc();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let handler = RetryHandler::new(store.clone(), policy(3));

        let item = claimed(&store).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.reclaim_expired(Duration::ZERO, 3).await.unwrap();

        let outcome = handler.on_success(&item, None).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::LeaseLost);
        let stored = store.get(item.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Pending);
        assert_eq!(stored.failure_count, 1);
    }

    #[tokio::test]
    async fn release_is_retried_through_a_brief_outage() {
        let inner = InMemoryLeaseStore::arc();
        inner.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let store = FlakyStore::new(inner.clone()).fail_successes(2);
        let handler =
            RetryHandler::new(store, policy(3)).with_release_attempts(3, Duration::from_millis(1));

        let item = claimed(&inner).await;
        let outcome = handler.on_success(&item, None).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Succeeded);

        let stored = inner.get(item.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Succeeded);
        assert_eq!(stored.failure_count, 0);
    }

    #[tokio::test]
    async fn release_gives_up_after_its_attempts() {
        let inner = InMemoryLeaseStore::arc();
        inner.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let store = FlakyStore::new(inner.clone()).fail_failures(5);
        let handler =
            RetryHandler::new(store, policy(3)).with_release_attempts(2, Duration::from_millis(1));

        let item = claimed(&inner).await;
        let err = handler
            .on_failure(&item, &ExecutionError::transient("timeout"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        // Left for the lease sweep; nothing was charged.
        let stored = inner.get(item.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Claimed);
        assert_eq!(stored.failure_count, 0);
    }
}
