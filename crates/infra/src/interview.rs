//! Interview sessions as claimable work.
//!
//! The voice pipeline itself is opaque here: an [`InterviewRunner`] takes the
//! room credentials and prompt and eventually returns a transcript. Every
//! claim starts the session from the beginning; nothing is checkpointed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use parley_core::EligibilityFilter;

use crate::execution::{ExecutionError, Executor};
use crate::lease_store::ClaimedItem;

/// Payload key that is only set once a room has been provisioned.
pub const ROOM_NAME_KEY: &str = "room_name";

/// Input of one interview session, decoded from the work item payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewSession {
    pub interview_id: String,
    pub room_name: String,
    pub room_token: String,
    #[serde(default)]
    pub prompt: String,
}

impl fmt::Debug for InterviewSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterviewSession")
            .field("interview_id", &self.interview_id)
            .field("room_name", &self.room_name)
            .field("room_token", &"<redacted>")
            .field("prompt_len", &self.prompt.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Interviewer,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Speaker,
    pub content: String,
}

/// Output of a finished session; stored as the item's `result`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterviewOutcome {
    pub transcript: String,
    pub history: Vec<ConversationTurn>,
}

/// Runs a live interview to completion.
#[async_trait::async_trait]
pub trait InterviewRunner: Send + Sync + 'static {
    async fn run(&self, session: InterviewSession) -> anyhow::Result<InterviewOutcome>;
}

/// Adapts an [`InterviewRunner`] to the supervisor.
pub struct InterviewExecutor<R> {
    runner: Arc<R>,
}

impl<R: InterviewRunner> InterviewExecutor<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    /// Interviews whose room has been assigned.
    pub fn eligibility_filter() -> EligibilityFilter {
        EligibilityFilter::interviews().require_payload_key(ROOM_NAME_KEY)
    }
}

#[async_trait::async_trait]
impl<R: InterviewRunner> Executor for InterviewExecutor<R> {
    async fn execute(&self, claimed: &ClaimedItem) -> Result<Option<serde_json::Value>, ExecutionError> {
        let session: InterviewSession = serde_json::from_value(claimed.item.payload.clone())
            .map_err(|e| ExecutionError::terminal(format!("invalid interview payload: {e}")))?;

        info!(
            item_id = %claimed.id(),
            interview_id = %session.interview_id,
            room_name = %session.room_name,
            attempt = claimed.attempt(),
            "starting interview session"
        );

        let outcome = self.runner.run(session).await?;
        let turns = outcome.history.len();
        let result = serde_json::to_value(&outcome)
            .map_err(|e| ExecutionError::terminal(format!("failed to encode interview outcome: {e}")))?;

        info!(item_id = %claimed.id(), turns, "interview session finished");
        Ok(Some(result))
    }
}
