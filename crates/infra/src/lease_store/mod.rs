//! Durable storage of claimable work items and their lease metadata.
//!
//! The store exposes CRUD plus a handful of *conditional* single-row updates.
//! It holds no opinion on retry policy or scheduling; the claim manager, the
//! retry handler and the supervisor drive it.
//!
//! Every mutation of claim/state fields is a compare-and-swap:
//! - claiming re-checks eligibility under a row lock that concurrent
//!   claimers skip rather than wait on,
//! - releasing matches the full [`Lease`] (`claimed_by`, `claimed_at`,
//!   `failure_count`), so a stale worker cannot touch a newer claim.

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
pub(crate) mod flaky;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use parley_core::{
    EligibilityFilter, JobType, WorkItem, WorkItemId, WorkKind, WorkState, WorkerId,
};

pub use in_memory::InMemoryLeaseStore;
pub use postgres::PostgresLeaseStore;

/// Longest `last_error` we persist; it is diagnostic only.
pub const MAX_ERROR_LEN: usize = 4096;

/// Lease store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseStoreError {
    /// The store could not be reached or the statement failed to run.
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
    #[error("work item not found: {0}")]
    NotFound(WorkItemId),
    /// A row could not be mapped back into a `WorkItem`.
    #[error("failed to decode work item: {0}")]
    Decode(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl LeaseStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LeaseStoreError::Unavailable(_))
    }
}

/// Request to create a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkItem {
    pub kind: WorkKind,
    pub payload: serde_json::Value,
    /// `None` means "ready now" (store clock).
    pub ready_at: Option<DateTime<Utc>>,
}

impl NewWorkItem {
    pub fn interview(payload: serde_json::Value) -> Self {
        Self {
            kind: WorkKind::Interview,
            payload,
            ready_at: None,
        }
    }

    pub fn job(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            kind: WorkKind::job(job_type),
            payload,
            ready_at: None,
        }
    }

    /// Schedule for a fixed instant.
    pub fn ready_at(mut self, at: DateTime<Utc>) -> Self {
        self.ready_at = Some(at);
        self
    }

    /// Schedule with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.ready_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }
}

/// Proof of ownership returned by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub item_id: WorkItemId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    /// Failure count observed at claim time.
    pub failure_count: u32,
}

/// A work item together with the lease under which it is being executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedItem {
    pub item: WorkItem,
    pub lease: Lease,
}

impl ClaimedItem {
    /// Build from a freshly claimed row.
    pub fn from_claimed(item: WorkItem) -> Result<Self, LeaseStoreError> {
        match (&item.state, &item.claimed_by, item.claimed_at) {
            (WorkState::Claimed, Some(worker_id), Some(claimed_at)) => {
                let lease = Lease {
                    item_id: item.id,
                    worker_id: worker_id.clone(),
                    claimed_at,
                    failure_count: item.failure_count,
                };
                Ok(Self { item, lease })
            }
            _ => Err(LeaseStoreError::Decode(format!(
                "item {} returned from claim is not leased (state {})",
                item.id, item.state
            ))),
        }
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> u32 {
        self.lease.failure_count + 1
    }

    pub fn id(&self) -> WorkItemId {
        self.item.id
    }
}

/// Where a failed item goes next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureTransition {
    /// `failed_retryable`, eligible again after the delay.
    Retry { after: Duration },
    /// `failed_terminal`.
    Terminal,
}

/// Conditional update applied when an attempt fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    /// New (incremented) failure count.
    pub failure_count: u32,
    pub last_error: String,
    pub transition: FailureTransition,
}

/// Item counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkStats {
    pub pending: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed_retryable: u64,
    pub failed_terminal: u64,
}

impl WorkStats {
    pub fn record(&mut self, state: WorkState, count: u64) {
        match state {
            WorkState::Pending => self.pending += count,
            WorkState::Claimed => self.claimed += count,
            WorkState::Succeeded => self.succeeded += count,
            WorkState::FailedRetryable => self.failed_retryable += count,
            WorkState::FailedTerminal => self.failed_terminal += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.succeeded + self.failed_retryable + self.failed_terminal
    }
}

/// Lease store abstraction.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a new `pending` item.
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, LeaseStoreError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, LeaseStoreError>;

    /// Items in a state (or all), oldest first.
    async fn list_by_state(
        &self,
        state: Option<WorkState>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, LeaseStoreError>;

    async fn stats(&self) -> Result<WorkStats, LeaseStoreError>;

    /// Atomically lease the oldest eligible item to `worker`.
    ///
    /// `None` means nothing eligible (or every candidate is being claimed by
    /// someone else right now); it is not an error.
    async fn try_claim(
        &self,
        filter: &EligibilityFilter,
        worker: &WorkerId,
    ) -> Result<Option<ClaimedItem>, LeaseStoreError>;

    /// `claimed` → `succeeded`. Returns `false` if the lease no longer holds.
    async fn mark_succeeded(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
    ) -> Result<bool, LeaseStoreError>;

    /// `claimed` → `failed_retryable` / `failed_terminal`. Returns `false` if
    /// the lease no longer holds.
    async fn mark_failed(
        &self,
        lease: &Lease,
        update: &FailureUpdate,
    ) -> Result<bool, LeaseStoreError>;

    /// Break leases older than `lease_timeout`: count a failure and return
    /// the item to `pending`, or to `failed_terminal` once `max_failures` is
    /// reached. Returns the rows as updated.
    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_failures: u32,
    ) -> Result<Vec<WorkItem>, LeaseStoreError>;

    /// Manual intervention: `failed_terminal` → `pending` with a zeroed
    /// failure count. Returns `false` if the item is not terminally failed.
    async fn reset_terminal(&self, id: WorkItemId) -> Result<bool, LeaseStoreError>;

    /// Delete `succeeded` items completed more than `older_than` ago.
    async fn purge_succeeded(&self, older_than: Duration) -> Result<u64, LeaseStoreError>;
}

#[async_trait::async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, LeaseStoreError> {
        (**self).enqueue(item).await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, LeaseStoreError> {
        (**self).get(id).await
    }

    async fn list_by_state(
        &self,
        state: Option<WorkState>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        (**self).list_by_state(state, limit).await
    }

    async fn stats(&self) -> Result<WorkStats, LeaseStoreError> {
        (**self).stats().await
    }

    async fn try_claim(
        &self,
        filter: &EligibilityFilter,
        worker: &WorkerId,
    ) -> Result<Option<ClaimedItem>, LeaseStoreError> {
        (**self).try_claim(filter, worker).await
    }

    async fn mark_succeeded(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
    ) -> Result<bool, LeaseStoreError> {
        (**self).mark_succeeded(lease, result).await
    }

    async fn mark_failed(
        &self,
        lease: &Lease,
        update: &FailureUpdate,
    ) -> Result<bool, LeaseStoreError> {
        (**self).mark_failed(lease, update).await
    }

    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_failures: u32,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        (**self).reclaim_expired(lease_timeout, max_failures).await
    }

    async fn reset_terminal(&self, id: WorkItemId) -> Result<bool, LeaseStoreError> {
        (**self).reset_terminal(id).await
    }

    async fn purge_succeeded(&self, older_than: Duration) -> Result<u64, LeaseStoreError> {
        (**self).purge_succeeded(older_than).await
    }
}

/// Clamp an error message to [`MAX_ERROR_LEN`] bytes on a char boundary.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// `last_error` recorded when a lease is broken by the sweep.
pub(crate) fn lease_expired_message(worker: &WorkerId, claimed_at: DateTime<Utc>) -> String {
    format!(
        "lease expired: claimed by {} at {}",
        worker,
        claimed_at.to_rfc3339()
    )
}
