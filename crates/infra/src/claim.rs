//! Claim manager: one worker's view of the lease store.
//!
//! Claims are exclusive (at most one live lease per item) and ordered oldest
//! first. The sweep breaks leases that outlived `lease_timeout`, which is how
//! work held by a crashed worker gets back into circulation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::{EligibilityFilter, WorkItem, WorkState, WorkerId};

use crate::lease_store::{ClaimedItem, LeaseStore, LeaseStoreError};

#[derive(Debug, Clone)]
pub struct ClaimManager<S> {
    store: S,
    worker_id: WorkerId,
    lease_timeout: Duration,
    max_failures: u32,
}

impl<S: LeaseStore> ClaimManager<S> {
    pub fn new(store: S, worker_id: WorkerId, lease_timeout: Duration, max_failures: u32) -> Self {
        Self {
            store,
            worker_id,
            lease_timeout,
            max_failures,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lease the oldest eligible item, if any.
    pub async fn claim_next(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Option<ClaimedItem>, LeaseStoreError> {
        let claimed = self.store.try_claim(filter, &self.worker_id).await?;
        if let Some(item) = &claimed {
            debug!(
                worker_id = %self.worker_id,
                item_id = %item.id(),
                kind = %item.item.kind,
                failure_count = item.lease.failure_count,
                "claimed work item"
            );
        }
        Ok(claimed)
    }

    /// Reclaim every lease older than the lease timeout.
    ///
    /// Each reclaimed item is charged one failure. Below the failure ceiling
    /// it is `pending` again (same `ready_at`, so it keeps its place in
    /// line); at the ceiling it is `failed_terminal`.
    pub async fn sweep_expired(&self) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let reclaimed = self
            .store
            .reclaim_expired(self.lease_timeout, self.max_failures)
            .await?;

        for item in &reclaimed {
            let reason = item.last_error.as_deref().unwrap_or("lease expired");
            if item.state == WorkState::FailedTerminal {
                warn!(
                    sweeper = %self.worker_id,
                    item_id = %item.id,
                    kind = %item.kind,
                    failure_count = item.failure_count,
                    error = reason,
                    "expired lease exhausted retries; item is terminal"
                );
            } else {
                warn!(
                    sweeper = %self.worker_id,
                    item_id = %item.id,
                    kind = %item.kind,
                    failure_count = item.failure_count,
                    error = reason,
                    "reclaimed expired lease"
                );
            }
        }
        Ok(reclaimed)
    }
}

/// Sweep-only loop for a dedicated sweeper process.
///
/// Runs a sweep immediately and then every `interval` until cancelled.
/// Store errors are logged and the loop carries on.
pub async fn run_sweeper<S: LeaseStore>(
    claims: &ClaimManager<S>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(sweeper = %claims.worker_id(), interval_secs = interval.as_secs_f64(), "lease sweeper started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match claims.sweep_expired().await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(reclaimed = reclaimed.len(), "lease sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "lease sweep failed"),
                }
            }
        }
    }

    info!(sweeper = %claims.worker_id(), "lease sweeper stopped");
}
