//! Infrastructure layer: lease storage, claiming, retries and the worker pool.

pub mod claim;
pub mod config;
pub mod execution;
pub mod interview;
pub mod jobs;
pub mod lease_store;
pub mod retry;
pub mod supervisor;


pub use claim::{run_sweeper, ClaimManager};
pub use config::{ConfigError, WorkerConfig};
pub use execution::{ExecutionError, Executor, FailureKind};
pub use lease_store::{
    ClaimedItem, InMemoryLeaseStore, Lease, LeaseStore, LeaseStoreError, NewWorkItem,
    PostgresLeaseStore, WorkStats,
};
pub use retry::{ReleaseOutcome, RetryHandler};
pub use supervisor::{SupervisorHandle, SupervisorStats, WorkerPoolSupervisor};
