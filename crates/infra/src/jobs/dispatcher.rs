//! Routes background jobs to their handlers by job type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use parley_core::{JobType, WorkItemId, WorkKind, WorkerId};

use crate::execution::{ExecutionError, Executor, FailureKind};
use crate::lease_store::{ClaimedItem, LeaseStore, LeaseStoreError, NewWorkItem};

/// Handler failure. Transient unless built with [`JobError::terminal`].
#[derive(Debug)]
pub struct JobError {
    kind: FailureKind,
    error: anyhow::Error,
}

impl JobError {
    pub fn transient(message: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::Transient,
            error: anyhow::anyhow!("{message}"),
        }
    }

    /// Retrying will not help; the item goes straight to `failed_terminal`.
    pub fn terminal(message: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::Terminal,
            error: anyhow::anyhow!("{message}"),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Transient,
            error,
        }
    }
}

impl From<LeaseStoreError> for JobError {
    fn from(error: LeaseStoreError) -> Self {
        Self {
            kind: FailureKind::Transient,
            error: error.into(),
        }
    }
}

impl From<JobError> for ExecutionError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err.kind {
            FailureKind::Transient => ExecutionError::transient(message),
            FailureKind::Terminal => ExecutionError::terminal(message),
        }
    }
}

/// Registration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("handler already registered for job type {0}")]
    DuplicateHandler(JobType),
}

/// Lets handlers enqueue follow-up work.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn LeaseStore>,
}

impl Enqueuer {
    pub fn new<S: LeaseStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub async fn enqueue(&self, item: NewWorkItem) -> Result<WorkItemId, LeaseStoreError> {
        self.store.enqueue(item).await
    }

    pub async fn enqueue_job(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<WorkItemId, LeaseStoreError> {
        self.store.enqueue(NewWorkItem::job(job_type, payload)).await
    }
}

impl fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enqueuer").finish_non_exhaustive()
    }
}

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub item_id: WorkItemId,
    pub job_type: JobType,
    /// 1-based attempt number.
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub enqueuer: Enqueuer,
}

/// Handler for one job type, operating on the raw JSON payload.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<(), JobError>;
}

/// Adapter for closures over the raw payload.
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<(), JobError> {
        (self.0)(ctx, payload).await
    }
}

/// Adapter that decodes the payload into `T` first.
struct TypedHandler<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait::async_trait]
impl<T, F, Fut> JobHandler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<(), JobError> {
        // The payload will not change between attempts.
        let decoded: T = serde_json::from_value(payload).map_err(|e| {
            JobError::terminal(format!("invalid payload for {}: {e}", ctx.job_type))
        })?;
        (self.handler)(ctx, decoded).await
    }
}

/// Job type → handler registry; runs claimed jobs as an [`Executor`].
pub struct JobDispatcher {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    enqueuer: Enqueuer,
}

impl JobDispatcher {
    pub fn new(enqueuer: Enqueuer) -> Self {
        Self {
            handlers: HashMap::new(),
            enqueuer,
        }
    }

    pub fn register(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&mut Self, DispatchError> {
        if self.handlers.contains_key(&job_type) {
            return Err(DispatchError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(self)
    }

    /// Register a closure over the raw JSON payload.
    pub fn register_fn<F, Fut>(&mut self, job_type: JobType, f: F) -> Result<&mut Self, DispatchError>
    where
        F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler(f)))
    }

    /// Register a closure over a typed payload. Payloads that fail to decode
    /// fail terminally.
    pub fn register_typed<T, F, Fut>(
        &mut self,
        job_type: JobType,
        f: F,
    ) -> Result<&mut Self, DispatchError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(
            job_type,
            Arc::new(TypedHandler {
                handler: f,
                _payload: PhantomData,
            }),
        )
    }

    pub fn is_registered(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn enqueuer(&self) -> &Enqueuer {
        &self.enqueuer
    }
}

impl fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[async_trait::async_trait]
impl Executor for JobDispatcher {
    async fn execute(&self, claimed: &ClaimedItem) -> Result<Option<serde_json::Value>, ExecutionError> {
        let job_type = match &claimed.item.kind {
            WorkKind::Job { job_type } => job_type,
            WorkKind::Interview => {
                return Err(ExecutionError::terminal(
                    "job dispatcher cannot run interview items",
                ));
            }
        };

        let Some(handler) = self.handlers.get(job_type) else {
            warn!(item_id = %claimed.id(), job_type = %job_type, "no handler registered for job type");
            return Err(ExecutionError::terminal(format!(
                "no handler registered for job type {job_type}"
            )));
        };

        let ctx = JobContext {
            item_id: claimed.id(),
            job_type: job_type.clone(),
            attempt: claimed.attempt(),
            worker_id: claimed.lease.worker_id.clone(),
            enqueuer: self.enqueuer.clone(),
        };

        debug!(item_id = %claimed.id(), job_type = %job_type, attempt = ctx.attempt, "dispatching job");
        handler.handle(ctx, claimed.item.payload.clone()).await?;
        Ok(None)
    }
}
