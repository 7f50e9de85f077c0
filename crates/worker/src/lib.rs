//! Process wiring for a parley worker: settings, store bootstrap and the
//! mode-specific run loops.
//!
//! A process runs in one of two modes. `jobs` claims background jobs of every
//! registered type and executes them through the [`JobDispatcher`]; `sweeper`
//! only reclaims expired leases, for deployments that keep sweeping out of the
//! execution processes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_core::EligibilityFilter;
use parley_infra::jobs::{register_maintenance_handlers, DispatchError, Enqueuer, JobDispatcher};
use parley_infra::{run_sweeper, ClaimManager, ConfigError, PostgresLeaseStore, WorkerConfig, WorkerPoolSupervisor};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_DB_MAX_CONNECTIONS: &str = "PARLEY_DB_MAX_CONNECTIONS";
pub const ENV_MODE: &str = "PARLEY_MODE";

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    #[default]
    Jobs,
    Sweeper,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Sweeper => "sweeper",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jobs" => Ok(Self::Jobs),
            "sweeper" => Ok(Self::Sweeper),
            other => Err(format!("expected \"jobs\" or \"sweeper\", got {other:?}")),
        }
    }
}

/// Process-level settings that sit outside [`WorkerConfig`].
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessSettings {
    pub database_url: String,
    pub db_max_connections: u32,
    pub mode: WorkerMode,
}

impl fmt::Debug for ProcessSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSettings")
            .field("database_url", &"<redacted>")
            .field("db_max_connections", &self.db_max_connections)
            .field("mode", &self.mode)
            .finish()
    }
}

impl ProcessSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get(ENV_DATABASE_URL).ok_or(ConfigError::Missing { key: ENV_DATABASE_URL })?;

        let db_max_connections = match get(ENV_DB_MAX_CONNECTIONS) {
            Some(v) => match v.trim().parse::<u32>() {
                Ok(0) => return Err(ConfigError::invalid(ENV_DB_MAX_CONNECTIONS, &v, "must be at least 1")),
                Ok(n) => n,
                Err(e) => return Err(ConfigError::invalid(ENV_DB_MAX_CONNECTIONS, &v, e.to_string())),
            },
            None => DEFAULT_DB_MAX_CONNECTIONS,
        };

        let mode = match get(ENV_MODE) {
            Some(v) => v.parse().map_err(|reason: String| ConfigError::invalid(ENV_MODE, &v, reason))?,
            None => WorkerMode::default(),
        };

        Ok(Self {
            database_url,
            db_max_connections,
            mode,
        })
    }
}

/// Connect to Postgres and make sure the schema exists.
pub async fn connect(settings: &ProcessSettings) -> anyhow::Result<PostgresLeaseStore> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to the work item database")?;

    let store = PostgresLeaseStore::new(pool);
    store.migrate().await.context("failed to apply work item schema")?;
    Ok(store)
}

/// Dispatcher with every built-in job handler registered.
pub fn job_dispatcher(store: PostgresLeaseStore) -> Result<JobDispatcher, DispatchError> {
    let mut dispatcher = JobDispatcher::new(Enqueuer::new(store.clone()));
    register_maintenance_handlers(&mut dispatcher, store)?;
    Ok(dispatcher)
}

/// Run the configured mode until `cancel` fires.
pub async fn run(settings: ProcessSettings, config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let store = connect(&settings).await?;

    match settings.mode {
        WorkerMode::Jobs => run_jobs(store, config, cancel).await,
        WorkerMode::Sweeper => run_sweeper_only(store, config, cancel).await,
    }
}

async fn run_jobs(store: PostgresLeaseStore, config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let dispatcher = job_dispatcher(store.clone()).context("failed to register job handlers")?;
    info!(
        job_types = ?dispatcher.job_types().iter().map(|t| t.as_str().to_string()).collect::<Vec<_>>(),
        "job handlers registered"
    );

    let handle = WorkerPoolSupervisor::new(store, Arc::new(dispatcher), EligibilityFilter::jobs(), config)
        .spawn_with_token(cancel);

    let stats = handle.join().await.context("worker pool supervisor panicked")?;
    info!(
        claimed = stats.claimed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        terminal = stats.terminal,
        lease_lost = stats.lease_lost,
        "job worker stopped"
    );
    Ok(())
}

async fn run_sweeper_only(store: PostgresLeaseStore, config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let interval = config
        .sweep_interval
        .context("sweeper mode needs PARLEY_SWEEP_INTERVAL_SECS greater than zero")?;

    let claims = ClaimManager::new(
        store,
        config.worker_id.clone(),
        config.lease_timeout,
        config.retry_policy.max_failures(),
    );
    run_sweeper(&claims, interval, cancel).await;
    Ok(())
}

/// Cancel `cancel` on ctrl-c, or on SIGTERM where available.
pub async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
