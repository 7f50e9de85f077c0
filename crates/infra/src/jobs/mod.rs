//! Background jobs: a handler registry that plugs into the supervisor as an
//! [`Executor`](crate::execution::Executor), plus built-in maintenance jobs.

pub mod dispatcher;
pub mod maintenance;

pub use dispatcher::{DispatchError, Enqueuer, JobContext, JobDispatcher, JobError, JobHandler};
pub use maintenance::{register_maintenance_handlers, PurgeSucceeded, PURGE_SUCCEEDED};
