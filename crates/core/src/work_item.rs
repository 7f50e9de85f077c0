//! Work items: the unit that workers lease, execute and release.
//!
//! Two variants share one lifecycle shape: live interview sessions and
//! generic background jobs (tagged by [`JobType`]).

use core::str::FromStr;
use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{WorkItemId, WorkerId};

/// Tag that routes a background job to its handler.
///
/// Lowercase ASCII letters, digits, `.`, `_` and `-`; at most 128 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobType(Cow<'static, str>);

impl JobType {
    const MAX_LEN: usize = 128;

    /// Tag known at compile time (built-in handlers).
    ///
    /// Panics on an invalid literal; only use with constants.
    pub const fn from_static(tag: &'static str) -> Self {
        assert!(
            Self::is_valid(tag.as_bytes()),
            "invalid static job type tag"
        );
        Self(Cow::Borrowed(tag))
    }

    pub fn new(tag: impl Into<String>) -> DomainResult<Self> {
        let tag = tag.into();
        if !Self::is_valid(tag.as_bytes()) {
            return Err(DomainError::validation(format!(
                "job type '{tag}' must be 1..={} chars of [a-z0-9._-]",
                Self::MAX_LEN
            )));
        }
        Ok(Self(Cow::Owned(tag)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    const fn is_valid(bytes: &[u8]) -> bool {
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            return false;
        }
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            let ok = b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-');
            if !ok {
                return false;
            }
            i += 1;
        }
        true
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.0.into_owned()
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// What kind of work an item represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkKind {
    /// A live interview session run by an interview worker.
    Interview,
    /// A background job dispatched by type.
    Job { job_type: JobType },
}

impl WorkKind {
    pub const INTERVIEW_TAG: &'static str = "interview";
    pub const JOB_TAG: &'static str = "job";

    pub fn job(job_type: JobType) -> Self {
        Self::Job { job_type }
    }

    /// Storage tag for the `kind` column.
    pub fn tag(&self) -> &'static str {
        match self {
            WorkKind::Interview => Self::INTERVIEW_TAG,
            WorkKind::Job { .. } => Self::JOB_TAG,
        }
    }

    pub fn job_type(&self) -> Option<&JobType> {
        match self {
            WorkKind::Interview => None,
            WorkKind::Job { job_type } => Some(job_type),
        }
    }

    /// Rebuild from the `kind` / `job_type` columns.
    pub fn from_parts(tag: &str, job_type: Option<&str>) -> DomainResult<Self> {
        match (tag, job_type) {
            (Self::INTERVIEW_TAG, None) => Ok(WorkKind::Interview),
            (Self::JOB_TAG, Some(t)) => Ok(WorkKind::Job {
                job_type: JobType::new(t)?,
            }),
            (other, jt) => Err(DomainError::unknown_encoding(format!(
                "work kind '{other}' with job_type {jt:?}"
            ))),
        }
    }
}

impl core::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WorkKind::Interview => f.write_str(Self::INTERVIEW_TAG),
            WorkKind::Job { job_type } => write!(f, "job:{job_type}"),
        }
    }
}

/// Lifecycle state of a work item.
///
/// `claimed` covers both "leased" and "running": a claimed item is being
/// executed by the worker named in `claimed_by`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    Claimed,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl WorkState {
    pub const ALL: [WorkState; 5] = [
        WorkState::Pending,
        WorkState::Claimed,
        WorkState::Succeeded,
        WorkState::FailedRetryable,
        WorkState::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::Pending => "pending",
            WorkState::Claimed => "claimed",
            WorkState::Succeeded => "succeeded",
            WorkState::FailedRetryable => "failed_retryable",
            WorkState::FailedTerminal => "failed_terminal",
        }
    }

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Succeeded | WorkState::FailedTerminal)
    }
}

impl core::fmt::Display for WorkState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::unknown_encoding(format!("work state '{s}'")))
    }
}

/// A claimable unit of work as persisted in the lease store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub kind: WorkKind,
    pub state: WorkState,
    /// Worker currently holding the lease; `None` unless `state == Claimed`.
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Not eligible before this instant (scheduled work, FIFO position).
    pub ready_at: DateTime<Utc>,
    /// Set while `failed_retryable`: not eligible before this instant.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
    /// Output recorded on success (e.g. interview transcript).
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Fresh `pending` item.
    pub fn new(
        kind: WorkKind,
        payload: serde_json::Value,
        ready_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WorkItemId::new(),
            kind,
            state: WorkState::Pending,
            claimed_by: None,
            claimed_at: None,
            ready_at,
            next_retry_at: None,
            failure_count: 0,
            last_error: None,
            payload,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether the state/time half of eligibility holds at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            WorkState::Pending => self.ready_at <= now,
            WorkState::FailedRetryable => self.next_retry_at.is_some_and(|at| at <= now),
            WorkState::Claimed | WorkState::Succeeded | WorkState::FailedTerminal => false,
        }
    }

    /// `claimed` iff both lease columns are set; never one without the other.
    pub fn lease_fields_consistent(&self) -> bool {
        match self.state {
            WorkState::Claimed => self.claimed_by.is_some() && self.claimed_at.is_some(),
            _ => self.claimed_by.is_none() && self.claimed_at.is_none(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(tag: &str) -> WorkKind {
        WorkKind::job(JobType::new(tag).unwrap())
    }

    #[test]
    fn job_type_validation() {
        assert!(JobType::new("email.send").is_ok());
        assert!(JobType::new("analysis_v2-run").is_ok());
        assert!(JobType::new("").is_err());
        assert!(JobType::new("Email").is_err());
        assert!(JobType::new("with space").is_err());
        assert!(JobType::new("x".repeat(129)).is_err());
    }

    #[test]
    fn job_type_deserialization_is_validated() {
        let ok: JobType = serde_json::from_str("\"email.send\"").unwrap();
        assert_eq!(ok.as_str(), "email.send");
        assert!(serde_json::from_str::<JobType>("\"NOPE\"").is_err());
    }

    #[test]
    fn work_state_encoding_is_stable() {
        for state in WorkState::ALL {
            assert_eq!(state.as_str().parse::<WorkState>().unwrap(), state);
        }
        assert!("running".parse::<WorkState>().is_err());
        assert!(WorkState::FailedTerminal.is_terminal());
        assert!(!WorkState::FailedRetryable.is_terminal());
    }

    #[test]
    fn work_kind_from_parts() {
        assert_eq!(WorkKind::from_parts("interview", None).unwrap(), WorkKind::Interview);
        assert_eq!(
            WorkKind::from_parts("job", Some("email.send")).unwrap(),
            job("email.send")
        );
        assert!(WorkKind::from_parts("job", None).is_err());
        assert!(WorkKind::from_parts("interview", Some("x")).is_err());
        assert!(WorkKind::from_parts("cron", None).is_err());
    }

    #[test]
    fn due_respects_ready_and_retry_times() {
        let now = Utc::now();
        let mut item = WorkItem::new(job("a"), serde_json::json!({}), now + Duration::seconds(5), now);
        assert!(!item.is_due(now));
        assert!(item.is_due(now + Duration::seconds(5)));

        item.state = WorkState::FailedRetryable;
        item.next_retry_at = Some(now + Duration::seconds(30));
        assert!(!item.is_due(now + Duration::seconds(10)));
        assert!(item.is_due(now + Duration::seconds(30)));

        item.state = WorkState::FailedTerminal;
        assert!(!item.is_due(now + Duration::days(365)));
    }

    #[test]
    fn lease_fields_move_together() {
        let now = Utc::now();
        let mut item = WorkItem::new(WorkKind::Interview, serde_json::json!({}), now, now);
        assert!(item.lease_fields_consistent());

        item.state = WorkState::Claimed;
        item.claimed_by = Some(WorkerId::generate("h"));
        assert!(!item.lease_fields_consistent());

        item.claimed_at = Some(now);
        assert!(item.lease_fields_consistent());
    }
}
