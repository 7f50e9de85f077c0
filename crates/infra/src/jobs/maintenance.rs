//! Built-in housekeeping jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use parley_core::JobType;

use super::dispatcher::{DispatchError, JobContext, JobDispatcher};
use crate::lease_store::LeaseStore;

/// Deletes `succeeded` items older than the given age.
pub const PURGE_SUCCEEDED: JobType = JobType::from_static("maintenance.purge_succeeded");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeSucceeded {
    pub older_than_secs: u64,
}

/// Register every built-in handler on `dispatcher`.
pub fn register_maintenance_handlers<S>(
    dispatcher: &mut JobDispatcher,
    store: S,
) -> Result<(), DispatchError>
where
    S: LeaseStore + Clone + 'static,
{
    dispatcher.register_typed(PURGE_SUCCEEDED, move |ctx: JobContext, job: PurgeSucceeded| {
        let store = store.clone();
        async move {
            let purged = store
                .purge_succeeded(Duration::from_secs(job.older_than_secs))
                .await?;
            info!(
                item_id = %ctx.item_id,
                purged,
                older_than_secs = job.older_than_secs,
                "purged succeeded work items"
            );
            Ok(())
        }
    })?;
    Ok(())
}
