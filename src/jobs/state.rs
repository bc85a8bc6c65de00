//! Embedding job state machine
//!
//! Every job row moves only along these edges; the store validates each
//! transition here before it touches SQL.
//!
//! Valid transitions (9 edges):
//! 1. Pending      → InProgress   (on: Claim)
//! 2. RetryPending → InProgress   (on: Claim, once `next_retry_at` is due)
//! 3. RetryPending → Pending      (on: RetryDue)
//! 4. InProgress   → Completed    (on: Complete)
//! 5. InProgress   → RetryPending (on: ScheduleRetry)
//! 6. InProgress   → Failed       (on: Fail)
//! 7. InProgress   → Pending      (on: LeaseExpired | Release)
//! 8. Pending | InProgress | RetryPending → Cancelled (on: Cancel)
//! 9. Completed, Failed, Cancelled are terminal: every event is rejected.

use serde::{Deserialize, Serialize};

use crate::errors::{EmbedError, Result};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,

    /// Checked out by a worker under a lease
    InProgress,

    /// Transient failure; eligible again once `next_retry_at` passes
    RetryPending,

    /// Embeddings stored (terminal)
    Completed,

    /// Permanent failure or attempts exhausted (terminal)
    Failed,

    /// Cancelled by an admin action (terminal)
    Cancelled,
}

/// Events that drive job transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Claim,
    Complete,
    ScheduleRetry,
    Fail,
    RetryDue,
    LeaseExpired,
    Release,
    Cancel,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::RetryPending,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Statuses covered by the one-live-job-per-entity rule
    pub const LIVE: [JobStatus; 3] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::RetryPending,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::RetryPending => "RETRY_PENDING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Attempt state transition with validation
    pub fn transition(&self, event: JobEvent) -> Result<JobStatus> {
        use JobEvent::*;
        use JobStatus::*;

        let next = match (self, event) {
            (Pending, Claim) | (RetryPending, Claim) => InProgress,
            (RetryPending, RetryDue) => Pending,
            (InProgress, Complete) => Completed,
            (InProgress, ScheduleRetry) => RetryPending,
            (InProgress, Fail) => Failed,
            (InProgress, LeaseExpired) | (InProgress, Release) => Pending,
            (Pending, Cancel) | (InProgress, Cancel) | (RetryPending, Cancel) => Cancelled,

            (from, event) => {
                return Err(EmbedError::InvalidTransition {
                    from: from.as_str().to_string(),
                    to: format!("(via {:?})", event),
                    reason: if from.is_terminal() {
                        format!("{} is terminal", from.as_str())
                    } else {
                        format!("No valid transition from {} on {:?}", from.as_str(), event)
                    },
                });
            }
        };

        Ok(next)
    }
}

impl JobEvent {
    /// Statuses from which this event is accepted; used to build bulk updates
    pub fn sources(&self) -> &'static [JobStatus] {
        use JobStatus::*;

        match self {
            JobEvent::Claim => &[Pending, RetryPending],
            JobEvent::RetryDue => &[RetryPending],
            JobEvent::Complete
            | JobEvent::ScheduleRetry
            | JobEvent::Fail
            | JobEvent::LeaseExpired
            | JobEvent::Release => &[InProgress],
            JobEvent::Cancel => &JobStatus::LIVE,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `'A', 'B'` list for an SQL `IN (...)` clause; values are static status names
pub(crate) fn sql_status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert_eq!(
            JobStatus::Pending.transition(JobEvent::Claim).unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(
            JobStatus::RetryPending.transition(JobEvent::Claim).unwrap(),
            JobStatus::InProgress
        );
        assert_eq!(
            JobStatus::RetryPending.transition(JobEvent::RetryDue).unwrap(),
            JobStatus::Pending
        );
        assert_eq!(
            JobStatus::InProgress.transition(JobEvent::Complete).unwrap(),
            JobStatus::Completed
        );
        assert_eq!(
            JobStatus::InProgress.transition(JobEvent::ScheduleRetry).unwrap(),
            JobStatus::RetryPending
        );
        assert_eq!(
            JobStatus::InProgress.transition(JobEvent::Fail).unwrap(),
            JobStatus::Failed
        );
        assert_eq!(
            JobStatus::InProgress.transition(JobEvent::LeaseExpired).unwrap(),
            JobStatus::Pending
        );
        assert_eq!(
            JobStatus::InProgress.transition(JobEvent::Release).unwrap(),
            JobStatus::Pending
        );
    }

    #[test]
    fn test_cancel_from_every_live_state() {
        for status in JobStatus::LIVE {
            assert_eq!(
                status.transition(JobEvent::Cancel).unwrap(),
                JobStatus::Cancelled
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let events = [
            JobEvent::Claim,
            JobEvent::Complete,
            JobEvent::ScheduleRetry,
            JobEvent::Fail,
            JobEvent::RetryDue,
            JobEvent::LeaseExpired,
            JobEvent::Release,
            JobEvent::Cancel,
        ];
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(status.is_terminal());
            for event in events {
                assert!(status.transition(event).is_err(), "{status} accepted {event:?}");
            }
        }
    }

    #[test]
    fn test_invalid_transitions() {
        // Cannot complete a job nobody claimed
        assert!(JobStatus::Pending.transition(JobEvent::Complete).is_err());
        // Cannot claim a job already in flight
        assert!(JobStatus::InProgress.transition(JobEvent::Claim).is_err());
    }

    #[test]
    fn test_sources_agree_with_transition() {
        for event in [JobEvent::Claim, JobEvent::Fail, JobEvent::Cancel, JobEvent::RetryDue] {
            for status in JobStatus::ALL {
                assert_eq!(
                    event.sources().contains(&status),
                    status.transition(event).is_ok(),
                    "{status} / {event:?}"
                );
            }
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("RUNNING"), None);
    }

    #[test]
    fn test_sql_status_list() {
        assert_eq!(
            sql_status_list(&JobStatus::LIVE),
            "'PENDING', 'IN_PROGRESS', 'RETRY_PENDING'"
        );
    }
}
