//! Identifiers for work items and the workers that lease them.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a claimable work item (interview session or job).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(Uuid);

impl WorkItemId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered), so ids of items enqueued later sort later.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for WorkItemId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<WorkItemId> for Uuid {
    fn from(value: WorkItemId) -> Self {
        value.0
    }
}

impl FromStr for WorkItemId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("WorkItemId: {}", e)))?;
        Ok(Self(uuid))
    }
}

/// Identity of one worker process, recorded in `claimed_by`.
///
/// Used for diagnostics and for deciding whose lease went stale; never for
/// authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    const MAX_LEN: usize = 255;

    /// Build `host:pid:suffix`.
    ///
    /// The random suffix keeps two incarnations apart when pids repeat (every
    /// container process is pid 1).
    pub fn generate(host: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}:{}:{}", host, std::process::id(), &suffix[..8]))
    }

    /// Identity derived from `HOSTNAME` (falls back to `localhost`).
    pub fn from_environment() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self::generate(host.trim())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DomainError::invalid_id("WorkerId: empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(DomainError::invalid_id(format!(
                "WorkerId: longer than {} bytes",
                Self::MAX_LEN
            )));
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_worker_ids_are_unique_per_call() {
        let a = WorkerId::generate("host-a");
        let b = WorkerId::generate("host-a");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("host-a:"));
        assert!(a.as_str().contains(&std::process::id().to_string()));
    }

    #[test]
    fn worker_id_rejects_blank() {
        assert!("  ".parse::<WorkerId>().is_err());
        assert_eq!("w-1".parse::<WorkerId>().unwrap().as_str(), "w-1");
    }

    #[test]
    fn work_item_id_parses_its_display_form() {
        let id = WorkItemId::new();
        assert_eq!(id.to_string().parse::<WorkItemId>().unwrap(), id);
        assert!("not-a-uuid".parse::<WorkItemId>().is_err());
    }
}
