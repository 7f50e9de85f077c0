//! `parley-core`: domain building blocks for claimable work.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! what a work item is, which states it moves through, which items a worker
//! may claim, and how long a failed item waits before its next attempt.

pub mod backoff;
pub mod eligibility;
pub mod error;
pub mod id;
pub mod work_item;

pub use backoff::{BackoffSchedule, RetryDecision, RetryPolicy};
pub use eligibility::{EligibilityFilter, KindFilter};
pub use error::{DomainError, DomainResult};
pub use id::{WorkItemId, WorkerId};
pub use work_item::{JobType, WorkItem, WorkKind, WorkState};
