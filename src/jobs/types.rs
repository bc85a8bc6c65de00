//! Job records and store result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::jobs::state::JobStatus;

/// One embedding job row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub status: JobStatus,
    /// Lower runs first
    pub priority: i32,
    /// Transient failures so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Model of the embedding written by the completing run
    pub model: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the lease ran out before `now`
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(expires) if expires < now)
    }
}

/// Result of an enqueue request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: i64,
    /// False when a live job already existed and its id was returned
    pub created: bool,
}

/// Result of the claim-scoped commit unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// Chunks written and job COMPLETED
    Committed,
    /// Job was cancelled while in flight; nothing written
    Cancelled,
    /// Lease was reclaimed or taken by another worker; nothing written
    LeaseLost,
}

/// Aggregate job counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    pub live: u64,
    pub failed: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_entity_type: BTreeMap<String, u64>,
    pub by_entity_type_and_status: BTreeMap<String, BTreeMap<JobStatus, u64>>,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub(crate) fn record(&mut self, entity_type: String, status: JobStatus, count: u64) {
        self.total += count;
        if status.is_live() {
            self.live += count;
        }
        if status == JobStatus::Failed {
            self.failed += count;
        }
        *self.by_status.entry(status).or_insert(0) += count;
        *self.by_entity_type.entry(entity_type.clone()).or_insert(0) += count;
        *self
            .by_entity_type_and_status
            .entry(entity_type)
            .or_default()
            .entry(status)
            .or_insert(0) += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record() {
        let mut stats = JobStats::default();
        stats.record("DOC".to_string(), JobStatus::Pending, 3);
        stats.record("DOC".to_string(), JobStatus::Failed, 1);
        stats.record("CODE".to_string(), JobStatus::Completed, 2);

        assert_eq!(stats.total, 6);
        assert_eq!(stats.live, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.count(JobStatus::Completed), 2);
        assert_eq!(stats.count(JobStatus::Cancelled), 0);
        assert_eq!(stats.by_entity_type["DOC"], 4);
        assert_eq!(stats.by_entity_type_and_status["DOC"][&JobStatus::Failed], 1);
    }

    #[test]
    fn test_stats_serialize_status_keys() {
        let mut stats = JobStats::default();
        stats.record("DOC".to_string(), JobStatus::RetryPending, 1);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"RETRY_PENDING\":1"));
    }
}
