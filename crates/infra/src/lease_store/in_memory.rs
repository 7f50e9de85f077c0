//! In-memory lease store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use parley_core::{EligibilityFilter, WorkItem, WorkItemId, WorkState, WorkerId};

use super::{
    lease_expired_message, truncate_error, ClaimedItem, FailureTransition, FailureUpdate, Lease,
    LeaseStore, LeaseStoreError, NewWorkItem, WorkStats,
};

/// Single-process lease store.
///
/// One mutex guards the whole map, so every conditional update is trivially
/// atomic. Ordering and eligibility mirror the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    items: Mutex<HashMap<WorkItemId, WorkItem>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn items(&self) -> Result<MutexGuard<'_, HashMap<WorkItemId, WorkItem>>, LeaseStoreError> {
        self.items
            .lock()
            .map_err(|_| LeaseStoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Claim order: `ready_at`, then `created_at`, then id.
    fn claim_order(item: &WorkItem) -> (DateTime<Utc>, DateTime<Utc>, WorkItemId) {
        (item.ready_at, item.created_at, item.id)
    }

    fn to_chrono(d: Duration) -> Result<chrono::Duration, LeaseStoreError> {
        chrono::Duration::from_std(d)
            .map_err(|e| LeaseStoreError::InvalidInput(format!("duration out of range: {e}")))
    }

    fn holds(item: &WorkItem, lease: &Lease) -> bool {
        item.state == WorkState::Claimed
            && item.claimed_by.as_ref() == Some(&lease.worker_id)
            && item.claimed_at == Some(lease.claimed_at)
            && item.failure_count == lease.failure_count
    }
}

#[async_trait::async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItemId, LeaseStoreError> {
        let now = Utc::now();
        let item = WorkItem::new(new.kind, new.payload, new.ready_at.unwrap_or(now), now);
        let id = item.id;
        self.items()?.insert(id, item);
        Ok(id)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, LeaseStoreError> {
        Ok(self.items()?.get(&id).cloned())
    }

    async fn list_by_state(
        &self,
        state: Option<WorkState>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let items = self.items()?;
        let mut result: Vec<_> = items
            .values()
            .filter(|i| state.is_none_or(|s| i.state == s))
            .cloned()
            .collect();
        result.sort_by_key(|i| (i.created_at, i.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<WorkStats, LeaseStoreError> {
        let items = self.items()?;
        let mut stats = WorkStats::default();
        for item in items.values() {
            stats.record(item.state, 1);
        }
        Ok(stats)
    }

    async fn try_claim(
        &self,
        filter: &EligibilityFilter,
        worker: &WorkerId,
    ) -> Result<Option<ClaimedItem>, LeaseStoreError> {
        let mut items = self.items()?;
        let now = Utc::now();

        let next = items
            .values()
            .filter(|i| filter.is_eligible(i, now))
            .min_by_key(|i| Self::claim_order(i))
            .map(|i| i.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(item) = items.get_mut(&id) else {
            return Ok(None);
        };

        item.state = WorkState::Claimed;
        item.claimed_by = Some(worker.clone());
        item.claimed_at = Some(now);
        item.updated_at = now;

        ClaimedItem::from_claimed(item.clone()).map(Some)
    }

    async fn mark_succeeded(
        &self,
        lease: &Lease,
        result: Option<serde_json::Value>,
    ) -> Result<bool, LeaseStoreError> {
        let mut items = self.items()?;
        let Some(item) = items.get_mut(&lease.item_id) else {
            return Ok(false);
        };
        if !Self::holds(item, lease) {
            return Ok(false);
        }

        let now = Utc::now();
        item.state = WorkState::Succeeded;
        item.claimed_by = None;
        item.claimed_at = None;
        item.next_retry_at = None;
        item.result = result;
        item.updated_at = now;
        item.completed_at = Some(now);
        Ok(true)
    }

    async fn mark_failed(
        &self,
        lease: &Lease,
        update: &FailureUpdate,
    ) -> Result<bool, LeaseStoreError> {
        let retry_delay = match update.transition {
            FailureTransition::Retry { after } => Some(Self::to_chrono(after)?),
            FailureTransition::Terminal => None,
        };

        let mut items = self.items()?;
        let Some(item) = items.get_mut(&lease.item_id) else {
            return Ok(false);
        };
        if !Self::holds(item, lease) {
            return Ok(false);
        }

        let now = Utc::now();
        item.claimed_by = None;
        item.claimed_at = None;
        item.failure_count = update.failure_count;
        item.last_error = Some(truncate_error(&update.last_error));
        item.updated_at = now;
        match retry_delay {
            Some(delay) => {
                item.state = WorkState::FailedRetryable;
                item.next_retry_at = Some(now + delay);
            }
            None => {
                item.state = WorkState::FailedTerminal;
                item.next_retry_at = None;
                item.completed_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
        max_failures: u32,
    ) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let timeout = Self::to_chrono(lease_timeout)?;
        let mut items = self.items()?;
        let now = Utc::now();
        let cutoff = now - timeout;

        let mut reclaimed = Vec::new();
        for item in items.values_mut() {
            let expired_lease = match (&item.state, &item.claimed_by, item.claimed_at) {
                (WorkState::Claimed, Some(worker), Some(at)) if at < cutoff => {
                    lease_expired_message(worker, at)
                }
                _ => continue,
            };

            item.failure_count += 1;
            item.last_error = Some(expired_lease);
            item.claimed_by = None;
            item.claimed_at = None;
            item.next_retry_at = None;
            item.updated_at = now;
            if item.failure_count >= max_failures {
                item.state = WorkState::FailedTerminal;
                item.completed_at = Some(now);
            } else {
                item.state = WorkState::Pending;
            }
            reclaimed.push(item.clone());
        }

        reclaimed.sort_by_key(|i| Self::claim_order(i));
        Ok(reclaimed)
    }

    async fn reset_terminal(&self, id: WorkItemId) -> Result<bool, LeaseStoreError> {
        let mut items = self.items()?;
        let item = items.get_mut(&id).ok_or(LeaseStoreError::NotFound(id))?;
        if item.state != WorkState::FailedTerminal {
            return Ok(false);
        }

        item.state = WorkState::Pending;
        item.failure_count = 0;
        item.last_error = None;
        item.next_retry_at = None;
        item.completed_at = None;
        item.updated_at = Utc::now();
        Ok(true)
    }

    async fn purge_succeeded(&self, older_than: Duration) -> Result<u64, LeaseStoreError> {
        let cutoff = Utc::now() - Self::to_chrono(older_than)?;
        let mut items = self.items()?;
        let before = items.len();
        items.retain(|_, i| {
            !(i.state == WorkState::Succeeded && i.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - items.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{JobType, WorkKind};
    use serde_json::json;

    fn worker() -> WorkerId {
        WorkerId::generate("test-host")
    }

    fn email() -> JobType {
        JobType::new("email.send").unwrap()
    }

    fn retry_in(secs: u64, count: u32) -> FailureUpdate {
        FailureUpdate {
            failure_count: count,
            last_error: "boom".into(),
            transition: FailureTransition::Retry {
                after: Duration::from_secs(secs),
            },
        }
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryLeaseStore::new();
        let id = store
            .enqueue(NewWorkItem::job(email(), json!({"to": "a@example.com"})))
            .await
            .unwrap();

        let w = worker();
        let claimed = store
            .try_claim(&EligibilityFilter::any(), &w)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id(), id);
        assert_eq!(claimed.item.state, WorkState::Claimed);
        assert_eq!(claimed.lease.worker_id, w);
        assert_eq!(claimed.attempt(), 1);

        // Nothing else to claim
        assert!(store
            .try_claim(&EligibilityFilter::any(), &w)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn claims_in_ready_order() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        let later = store
            .enqueue(NewWorkItem::interview(json!({})).ready_at(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let earlier = store
            .enqueue(NewWorkItem::interview(json!({})).ready_at(now - chrono::Duration::seconds(10)))
            .await
            .unwrap();

        let w = worker();
        let first = store.try_claim(&EligibilityFilter::any(), &w).await.unwrap().unwrap();
        let second = store.try_claim(&EligibilityFilter::any(), &w).await.unwrap().unwrap();
        assert_eq!(first.id(), earlier);
        assert_eq!(second.id(), later);
    }

    #[tokio::test]
    async fn future_items_are_not_claimable() {
        let store = InMemoryLeaseStore::new();
        store
            .enqueue(NewWorkItem::interview(json!({})).delayed(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn filter_restricts_kind() {
        let store = InMemoryLeaseStore::new();
        store.enqueue(NewWorkItem::job(email(), json!({}))).await.unwrap();
        let interview = store
            .enqueue(NewWorkItem::interview(json!({"room_name": "r-1"})))
            .await
            .unwrap();

        let filter = EligibilityFilter::interviews().require_payload_key("room_name");
        let claimed = store.try_claim(&filter, &worker()).await.unwrap().unwrap();
        assert_eq!(claimed.id(), interview);
        assert!(store.try_claim(&filter, &worker()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_cannot_release() {
        let store = InMemoryLeaseStore::new();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let claimed = store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .unwrap();

        let mut stale = claimed.lease.clone();
        stale.worker_id = worker();
        assert!(!store.mark_succeeded(&stale, None).await.unwrap());

        let mut stale = claimed.lease.clone();
        stale.failure_count += 1;
        assert!(!store.mark_failed(&stale, &retry_in(30, 2)).await.unwrap());

        assert!(store.mark_succeeded(&claimed.lease, Some(json!({"ok": true}))).await.unwrap());
        // Second release of the same lease is a no-op
        assert!(!store.mark_succeeded(&claimed.lease, None).await.unwrap());

        let item = store.get(claimed.id()).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::Succeeded);
        assert!(item.completed_at.is_some());
        assert!(item.lease_fields_consistent());
        assert_eq!(item.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn retryable_failure_waits_for_backoff() {
        let store = InMemoryLeaseStore::new();
        let id = store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let claimed = store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .unwrap();

        assert!(store.mark_failed(&claimed.lease, &retry_in(30, 1)).await.unwrap());
        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::FailedRetryable);
        assert_eq!(item.failure_count, 1);
        assert!(item.next_retry_at.unwrap() > Utc::now());
        assert!(item.lease_fields_consistent());

        assert!(store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn terminal_failure_is_final() {
        let store = InMemoryLeaseStore::new();
        let id = store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let claimed = store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .unwrap();

        let update = FailureUpdate {
            failure_count: 1,
            last_error: "fatal".into(),
            transition: FailureTransition::Terminal,
        };
        assert!(store.mark_failed(&claimed.lease, &update).await.unwrap());

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::FailedTerminal);
        assert!(item.completed_at.is_some());
        assert!(item.next_retry_at.is_none());

        // Sweeps and claims leave it alone
        assert!(store.reclaim_expired(Duration::ZERO, 4).await.unwrap().is_empty());
        assert!(store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .is_none());

        // Manual reset brings it back
        assert!(store.reset_terminal(id).await.unwrap());
        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::Pending);
        assert_eq!(item.failure_count, 0);
        assert!(item.last_error.is_none());
        assert!(!store.reset_terminal(id).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_counts_a_failure_and_requeues() {
        let store = InMemoryLeaseStore::new();
        let id = store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let w = worker();
        let claimed = store.try_claim(&EligibilityFilter::any(), &w).await.unwrap().unwrap();

        // Lease still fresh under a long timeout
        assert!(store
            .reclaim_expired(Duration::from_secs(3600), 2)
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.reclaim_expired(Duration::ZERO, 2).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        let item = &reclaimed[0];
        assert_eq!(item.id, id);
        assert_eq!(item.state, WorkState::Pending);
        assert_eq!(item.failure_count, 1);
        assert!(item.lease_fields_consistent());
        assert!(item.last_error.as_deref().unwrap().contains(w.as_str()));

        // The original holder has lost its lease
        assert!(!store.mark_succeeded(&claimed.lease, None).await.unwrap());

        // Eligible again right away, and the second expiry is terminal
        let again = store.try_claim(&EligibilityFilter::any(), &w).await.unwrap().unwrap();
        assert_eq!(again.attempt(), 2);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = store.reclaim_expired(Duration::ZERO, 2).await.unwrap();
        assert_eq!(reclaimed[0].state, WorkState::FailedTerminal);
        assert_eq!(reclaimed[0].failure_count, 2);
    }

    #[tokio::test]
    async fn purge_removes_only_old_successes() {
        let store = InMemoryLeaseStore::new();
        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let pending = store.enqueue(NewWorkItem::interview(json!({})).delayed(Duration::from_secs(60))).await.unwrap();

        let claimed = store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .unwrap();
        store.mark_succeeded(&claimed.lease, None).await.unwrap();

        assert_eq!(store.purge_succeeded(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.purge_succeeded(Duration::ZERO).await.unwrap(), 1);
        assert!(store.get(claimed.id()).await.unwrap().is_none());
        assert!(store.get(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_count_each_state() {
        let store = InMemoryLeaseStore::new();
        for _ in 0..3 {
            store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        }
        store
            .try_claim(&EligibilityFilter::any(), &worker())
            .await
            .unwrap()
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.total(), 3);

        let listed = store.list_by_state(Some(WorkState::Pending), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|i| i.kind == WorkKind::Interview));
    }
}
