//! Test wrapper that makes selected operations report the store as
//! unavailable a fixed number of times before delegating.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley_core::{EligibilityFilter, WorkItem, WorkItemId, WorkState, WorkerId};

use super::{
    ClaimedItem, FailureUpdate, InMemoryLeaseStore, Lease, LeaseStore, LeaseStoreError,
    NewWorkItem, WorkStats,
};

#[derive(Debug, Default)]
struct Outages {
    claim: AtomicU32,
    succeed: AtomicU32,
    fail: AtomicU32,
}

#[derive(Debug, Clone)]
pub(crate) struct FlakyStore {
    inner: Arc<InMemoryLeaseStore>,
    outages: Arc<Outages>,
}

fn take(counter: &AtomicU32, operation: &str) -> Result<(), LeaseStoreError> {
    let remaining = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    match remaining {
        Ok(_) => Err(LeaseStoreError::Unavailable(format!("{operation}: connection refused"))),
        Err(_) => Ok(()),
    }
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<InMemoryLeaseStore>) -> Self {
        Self {
            inner,
            outages: Arc::new(Outages::default()),
        }
    }

    pub(crate) fn fail_claims(self, times: u32) -> Self {
        self.outages.claim.store(times, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_successes(self, times: u32) -> Self {
        self.outages.succeed.store(times, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_failures(self, times: u32) -> Self {
        self.outages.fail.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait::async_trait]
impl LeaseStore for FlakyStore {
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, LeaseStoreError> {
        self.inner.enqueue(item).await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, LeaseStoreError> {
        self.inner.get(id).await
    }

    async fn list_by_state(
        &self,
        state: Option<WorkState>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        self.inner.list_by_state(state, limit).await
    }

    async fn stats(&self) -> Result<WorkStats, LeaseStoreError> {
        self.inner.stats().await
    }

    async fn try_claim(
        &self,
        filter: &EligibilityFilter,
        worker: &WorkerId,
    ) -> Result<Option<ClaimedItem>, LeaseStoreError> {
        take(&self.outages.claim, "try_claim")?;
        self.inner.try_claim(filter, worker).await
    }

    async fn mark_succeeded(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
    ) -> Result<bool, LeaseStoreError> {
        take(&self.outages.succeed, "mark_succeeded")?;
        self.inner.mark_succeeded(lease, result).await
    }

    async fn mark_failed(
        &self,
        lease: &Lease,
        update: &FailureUpdate,
    ) -> Result<bool, LeaseStoreError> {
        take(&self.outages.fail, "mark_failed")?;
        self.inner.mark_failed(lease, update).await
    }

    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_failures: u32,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        self.inner.reclaim_expired(lease_timeout, max_failures).await
    }

    async fn reset_terminal(&self, id: WorkItemId) -> Result<bool, LeaseStoreError> {
        self.inner.reset_terminal(id).await
    }

    async fn purge_succeeded(&self, older_than: Duration) -> Result<u64, LeaseStoreError> {
        self.inner.purge_succeeded(older_than).await
    }
}
