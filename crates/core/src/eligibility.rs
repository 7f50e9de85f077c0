//! Which items a claimer is willing to take.
//!
//! The state/time predicate (`pending` and ready, or `failed_retryable` and
//! past its retry time) is always applied by the store; a filter can only
//! narrow it further.

use chrono::{DateTime, Utc};

use crate::work_item::{JobType, WorkItem, WorkKind};

/// Restriction on the work kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    Any,
    Interviews,
    /// Jobs only; an empty list means every job type.
    Jobs(Vec<JobType>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EligibilityFilter {
    pub kind: KindFilter,
    /// Payload key that must be present and non-null (e.g. `room_name` once a
    /// room has been assigned to an interview).
    pub require_payload_key: Option<String>,
}

impl EligibilityFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn interviews() -> Self {
        Self {
            kind: KindFilter::Interviews,
            require_payload_key: None,
        }
    }

    pub fn jobs() -> Self {
        Self {
            kind: KindFilter::Jobs(Vec::new()),
            require_payload_key: None,
        }
    }

    pub fn job_types(types: impl IntoIterator<Item = JobType>) -> Self {
        Self {
            kind: KindFilter::Jobs(types.into_iter().collect()),
            require_payload_key: None,
        }
    }

    pub fn require_payload_key(mut self, key: impl Into<String>) -> Self {
        self.require_payload_key = Some(key.into());
        self
    }

    /// `kind` column value to match, if restricted.
    pub fn kind_tag(&self) -> Option<&'static str> {
        match self.kind {
            KindFilter::Any => None,
            KindFilter::Interviews => Some(WorkKind::INTERVIEW_TAG),
            KindFilter::Jobs(_) => Some(WorkKind::JOB_TAG),
        }
    }

    /// Job types to match; empty means unrestricted.
    pub fn job_type_tags(&self) -> Vec<String> {
        match &self.kind {
            KindFilter::Jobs(types) => types.iter().map(|t| t.as_str().to_string()).collect(),
            _ => Vec::new(),
        }
    }

    /// The work-type half of eligibility (no state/time check).
    pub fn accepts(&self, item: &WorkItem) -> bool {
        let kind_ok = match (&self.kind, &item.kind) {
            (KindFilter::Any, _) => true,
            (KindFilter::Interviews, WorkKind::Interview) => true,
            (KindFilter::Jobs(types), WorkKind::Job { job_type }) => {
                types.is_empty() || types.contains(job_type)
            }
            _ => false,
        };
        if !kind_ok {
            return false;
        }

        match &self.require_payload_key {
            None => true,
            Some(key) => item.payload.get(key).is_some_and(|v| !v.is_null()),
        }
    }

    /// Full eligibility at `now`.
    pub fn is_eligible(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        item.is_due(now) && self.accepts(item)
    }
}
