//! Worker pool supervisor.
//!
//! Keeps up to `max_concurrent` items executing. Each loop iteration:
//! 1. reaps finished executions,
//! 2. runs a lease sweep when one is due,
//! 3. claims until the pool is full or nothing is eligible,
//! 4. waits for a completion, the poll interval, or shutdown.
//!
//! Every claimed item is executed in its own task and released exactly once
//! through the [`RetryHandler`]. A panicking executor is caught at the task
//! boundary and counted as a transient failure.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use parley_core::{EligibilityFilter, WorkItemId};

use crate::claim::ClaimManager;
use crate::config::WorkerConfig;
use crate::execution::{ExecutionError, Executor};
use crate::lease_store::{ClaimedItem, LeaseStore, LeaseStoreError};
use crate::retry::{ReleaseOutcome, RetryHandler};

/// Supervisor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub terminal: u64,
    pub lease_lost: u64,
    /// Releases abandoned after the store stayed unavailable.
    pub release_errors: u64,
    pub poll_errors: u64,
    pub swept: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

type SharedStats = Arc<Mutex<SupervisorStats>>;

fn lock(stats: &SharedStats) -> MutexGuard<'_, SupervisorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: SharedStats,
}

impl SupervisorHandle {
    /// Stop claiming and start draining. Returns immediately.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> SupervisorStats {
        lock(&self.stats).clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the supervisor loop to finish (after shutdown and drain).
    pub async fn join(self) -> Result<SupervisorStats, JoinError> {
        self.join.await?;
        Ok(lock(&self.stats).clone())
    }
}

/// Result of one execution task.
struct TaskReport {
    item_id: WorkItemId,
    outcome: Result<ReleaseOutcome, LeaseStoreError>,
}

/// Bounded pool of executions fed by the claim manager.
pub struct WorkerPoolSupervisor<S, E> {
    claims: ClaimManager<S>,
    retry: RetryHandler<S>,
    executor: Arc<E>,
    filter: EligibilityFilter,
    config: WorkerConfig,
    stats: SharedStats,
}

impl<S, E> WorkerPoolSupervisor<S, E>
where
    S: LeaseStore + Clone + 'static,
    E: Executor,
{
    pub fn new(store: S, executor: Arc<E>, filter: EligibilityFilter, config: WorkerConfig) -> Self {
        let claims = ClaimManager::new(
            store.clone(),
            config.worker_id.clone(),
            config.lease_timeout,
            config.retry_policy.max_failures(),
        );
        let retry = RetryHandler::new(store, config.retry_policy.clone());
        Self {
            claims,
            retry,
            executor,
            filter,
            config,
            stats: Arc::new(Mutex::new(SupervisorStats::default())),
        }
    }

    /// Spawn the supervisor loop on the current runtime.
    pub fn spawn(self) -> SupervisorHandle {
        self.spawn_with_token(CancellationToken::new())
    }

    /// Spawn with an externally owned token (e.g. tied to ctrl-c).
    pub fn spawn_with_token(self, cancel: CancellationToken) -> SupervisorHandle {
        let stats = self.stats.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            self.run(token).await;
        });
        SupervisorHandle {
            cancel,
            join,
            stats,
        }
    }

    /// Run until `cancel` fires, then drain in-flight work.
    pub async fn run(self, cancel: CancellationToken) {
        let worker_id = self.claims.worker_id().clone();
        let max_concurrent = self.config.max_concurrent.max(1);
        info!(
            worker_id = %worker_id,
            max_concurrent,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_timeout_secs = self.config.lease_timeout.as_secs(),
            "worker pool supervisor started"
        );

        let mut tasks: JoinSet<TaskReport> = JoinSet::new();
        let mut poll_failures: u32 = 0;
        let mut next_sweep = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                self.record(joined);
            }

            if let Some(interval) = self.config.sweep_interval {
                if Instant::now() >= next_sweep {
                    self.sweep().await;
                    next_sweep = Instant::now() + interval;
                }
            }

            let mut store_error = false;
            while tasks.len() < max_concurrent && !cancel.is_cancelled() {
                match self.claims.claim_next(&self.filter).await {
                    Ok(Some(claimed)) => {
                        poll_failures = 0;
                        self.start(&mut tasks, claimed);
                    }
                    Ok(None) => {
                        poll_failures = 0;
                        break;
                    }
                    Err(e) => {
                        poll_failures = poll_failures.saturating_add(1);
                        lock(&self.stats).poll_errors += 1;
                        error!(
                            worker_id = %worker_id,
                            error = %e,
                            consecutive_failures = poll_failures,
                            "failed to claim work item"
                        );
                        store_error = true;
                        break;
                    }
                }
            }

            let wait = if store_error {
                poll_backoff(self.config.poll_interval, self.config.max_poll_backoff, poll_failures)
            } else {
                self.config.poll_interval
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() && !store_error => {
                    self.record(joined);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.drain(&mut tasks).await;
        info!(worker_id = %worker_id, stats = ?lock(&self.stats).clone(), "worker pool supervisor stopped");
    }

    fn start(&self, tasks: &mut JoinSet<TaskReport>, claimed: ClaimedItem) {
        let span = info_span!(
            "work_item",
            worker_id = %self.claims.worker_id(),
            item_id = %claimed.id(),
            kind = %claimed.item.kind,
            attempt = claimed.attempt(),
        );
        let executor = self.executor.clone();
        let retry = self.retry.clone();

        tasks.spawn(
            async move {
                let item_id = claimed.id();
                let result = execute_isolated(executor, claimed.clone()).await;
                let outcome = match result {
                    Ok(output) => retry.on_success(&claimed, output).await,
                    Err(e) => retry.on_failure(&claimed, &e).await,
                };
                TaskReport { item_id, outcome }
            }
            .instrument(span),
        );

        let mut stats = lock(&self.stats);
        stats.claimed += 1;
        stats.in_flight = tasks.len();
        stats.peak_in_flight = stats.peak_in_flight.max(tasks.len());
    }

    fn record(&self, joined: Result<TaskReport, JoinError>) {
        let mut stats = lock(&self.stats);
        match joined {
            Ok(TaskReport { item_id, outcome }) => match outcome {
                Ok(ReleaseOutcome::Succeeded) => stats.succeeded += 1,
                Ok(ReleaseOutcome::RetryScheduled { .. }) => stats.retried += 1,
                Ok(ReleaseOutcome::Terminal { .. }) => stats.terminal += 1,
                Ok(ReleaseOutcome::LeaseLost) => stats.lease_lost += 1,
                Err(e) => {
                    stats.release_errors += 1;
                    error!(
                        item_id = %item_id,
                        error = %e,
                        "failed to release work item; the lease sweep will recover it"
                    );
                }
            },
            Err(e) => {
                stats.release_errors += 1;
                error!(error = %e, "execution task aborted before release");
            }
        }
        stats.in_flight = stats.in_flight.saturating_sub(1);
    }

    async fn sweep(&self) {
        match self.claims.sweep_expired().await {
            Ok(reclaimed) => {
                if !reclaimed.is_empty() {
                    lock(&self.stats).swept += reclaimed.len() as u64;
                }
            }
            Err(e) => warn!(error = %e, "lease sweep failed"),
        }
    }

    async fn drain(&self, tasks: &mut JoinSet<TaskReport>) {
        if tasks.is_empty() {
            return;
        }
        info!(
            in_flight = tasks.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "shutdown requested; draining in-flight work"
        );

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                self.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "shutdown grace elapsed; leaving remaining leases to expire"
            );
            tasks.detach_all();
        }
    }
}

/// Run the executor in its own task so a panic surfaces as a `JoinError`
/// instead of unwinding through the supervisor.
async fn execute_isolated<E: Executor>(
    executor: Arc<E>,
    claimed: ClaimedItem,
) -> Result<Option<serde_json::Value>, ExecutionError> {
    let handle = tokio::spawn(async move { executor.execute(&claimed).await }.in_current_span());
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(panic = %message, "executor panicked");
            Err(ExecutionError::transient(format!("executor panicked: {message}")))
        }
        Err(e) => Err(ExecutionError::transient(format!("execution cancelled: {e}"))),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// `poll_interval * 2^(failures - 1)`, capped at `max`.
pub fn poll_backoff(poll_interval: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    poll_interval
        .checked_mul(1u32 << exponent)
        .unwrap_or(max)
        .min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_store::flaky::FlakyStore;
    use crate::lease_store::{InMemoryLeaseStore, NewWorkItem};
    use parley_core::{BackoffSchedule, RetryPolicy, WorkState, WorkerId};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_id(WorkerId::generate("supervisor-test"))
            .with_max_concurrent(2)
            .with_poll_interval(Duration::from_millis(10))
            .with_shutdown_grace(Duration::from_secs(5))
            .with_retry_policy(
                RetryPolicy::new(3, BackoffSchedule::from_secs(&[3600]).unwrap()).unwrap(),
            )
    }

    struct Echo;

    #[async_trait::async_trait]
    impl Executor for Echo {
        async fn execute(
            &self,
            item: &ClaimedItem,
        ) -> Result<Option<serde_json::Value>, ExecutionError> {
            Ok(Some(item.item.payload.clone()))
        }
    }

    struct Panics {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Executor for Panics {
        async fn execute(
            &self,
            _item: &ClaimedItem,
        ) -> Result<Option<serde_json::Value>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("voice pipeline exploded");
        }
    }

    async fn wait_until<F: Fn(&SupervisorStats) -> bool>(handle: &SupervisorHandle, done: F) {
        for _ in 0..500 {
            if done(&handle.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached; stats = {:?}", handle.stats());
    }

    #[test]
    fn poll_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(poll_backoff(base, max, 1), Duration::from_millis(100));
        assert_eq!(poll_backoff(base, max, 2), Duration::from_millis(200));
        assert_eq!(poll_backoff(base, max, 4), Duration::from_millis(800));
        assert_eq!(poll_backoff(base, max, 5), max);
        assert_eq!(poll_backoff(base, max, u32::MAX), max);
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "non-string panic payload");
    }

    #[tokio::test]
    async fn executes_and_releases_items() {
        let store = InMemoryLeaseStore::arc();
        for n in 0..4 {
            store.enqueue(NewWorkItem::interview(json!({ "n": n }))).await.unwrap();
        }

        let handle =
            WorkerPoolSupervisor::new(store.clone(), Arc::new(Echo), EligibilityFilter::any(), config())
                .spawn();
        wait_until(&handle, |s| s.succeeded == 4).await;
        handle.shutdown();
        let stats = handle.join().await.unwrap();

        assert_eq!(stats.claimed, 4);
        assert_eq!(stats.in_flight, 0);
        assert!(stats.peak_in_flight <= 2);

        let done = store.list_by_state(Some(WorkState::Succeeded), 10).await.unwrap();
        assert_eq!(done.len(), 4);
        assert!(done.iter().all(|i| i.result.as_ref() == Some(&i.payload)));
    }

    #[tokio::test]
    async fn panic_counts_as_transient_failure() {
        let store = InMemoryLeaseStore::arc();
        let id = store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let executor = Arc::new(Panics {
            calls: AtomicUsize::new(0),
        });

        let handle =
            WorkerPoolSupervisor::new(store.clone(), executor.clone(), EligibilityFilter::any(), config())
                .spawn();
        wait_until(&handle, |s| s.retried == 1).await;
        handle.shutdown();
        handle.join().await.unwrap();

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::FailedRetryable);
        assert_eq!(item.failure_count, 1);
        assert!(item.last_error.unwrap().contains("voice pipeline exploded"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_claiming() {
        let store = InMemoryLeaseStore::arc();
        let handle =
            WorkerPoolSupervisor::new(store.clone(), Arc::new(Echo), EligibilityFilter::any(), config())
                .spawn();
        handle.shutdown();
        handle.join().await.unwrap();

        store.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    struct Sleeps(Duration);

    #[async_trait::async_trait]
    impl Executor for Sleeps {
        async fn execute(
            &self,
            _item: &ClaimedItem,
        ) -> Result<Option<serde_json::Value>, ExecutionError> {
            tokio::time::sleep(self.0).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn store_outage_backs_off_without_charging_items() {
        let inner = InMemoryLeaseStore::arc();
        let id = inner.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let store = FlakyStore::new(inner.clone()).fail_claims(3).fail_successes(2);

        let handle = WorkerPoolSupervisor::new(store, Arc::new(Echo), EligibilityFilter::any(), config())
            .spawn();
        wait_until(&handle, |s| s.succeeded == 1).await;
        handle.shutdown();
        let stats = handle.join().await.unwrap();

        assert_eq!(stats.poll_errors, 3);
        assert_eq!(stats.release_errors, 0);
        let item = inner.get(id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::Succeeded);
        assert_eq!(item.failure_count, 0);
        assert!(item.last_error.is_none());
    }

    #[tokio::test]
    async fn abandoned_release_is_counted_and_left_claimed() {
        let inner = InMemoryLeaseStore::arc();
        let id = inner.enqueue(NewWorkItem::interview(json!({}))).await.unwrap();
        let store = FlakyStore::new(inner.clone()).fail_successes(u32::MAX);

        let handle = WorkerPoolSupervisor::new(store, Arc::new(Echo), EligibilityFilter::any(), config())
            .spawn();
        wait_until(&handle, |s| s.release_errors == 1).await;
        handle.shutdown();
        let stats = handle.join().await.unwrap();

        assert_eq!(stats.succeeded, 0);
        let item = inner.get(id).await.unwrap().unwrap();
        assert_eq!(item.state, WorkState::Claimed);
        assert_eq!(item.failure_count, 0);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_work_finish() {
        let store = InMemoryLeaseStore::arc();
        for n in 0..3 {
            store.enqueue(NewWorkItem::interview(json!({ "n": n }))).await.unwrap();
        }

        let handle = WorkerPoolSupervisor::new(
            store.clone(),
            Arc::new(Sleeps(Duration::from_millis(300))),
            EligibilityFilter::any(),
            config(),
        )
        .spawn();
        wait_until(&handle, |s| s.in_flight == 2).await;
        handle.shutdown();
        let stats = handle.join().await.unwrap();

        assert_eq!(stats.claimed, 2);
        assert_eq!(stats.succeeded, 2);
        let counts = store.stats().await.unwrap();
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.claimed, 0);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn work_outliving_the_grace_period_keeps_its_lease() {
        let store = InMemoryLeaseStore::arc();
        for n in 0..2 {
            store.enqueue(NewWorkItem::interview(json!({ "n": n }))).await.unwrap();
        }

        let handle = WorkerPoolSupervisor::new(
            store.clone(),
            Arc::new(Sleeps(Duration::from_secs(30))),
            EligibilityFilter::any(),
            config().with_shutdown_grace(Duration::from_millis(50)),
        )
        .spawn();
        wait_until(&handle, |s| s.in_flight == 2).await;
        handle.shutdown();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.succeeded, 0);
        let counts = store.stats().await.unwrap();
        assert_eq!(counts.claimed, 2);
        assert_eq!(counts.succeeded, 0);
    }
}
