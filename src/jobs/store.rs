//! Durable embedding job store
//!
//! All mutations follow [`JobStatus::transition`]. Claims are optimistic: a
//! candidate is read, then updated only if its status and `updated_at` are
//! still what was read; on conflict the next candidate is tried. The partial
//! unique index on live statuses backs the one-live-job-per-entity rule even
//! when several processes share the database file.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;

use crate::embeddings::store::replace_entity_chunks;
use crate::embeddings::ChunkEmbedding;
use crate::errors::{EmbedError, Result};
use crate::jobs::state::{sql_status_list, JobEvent, JobStatus};
use crate::jobs::types::{CommitOutcome, EnqueueOutcome, Job, JobStats};
use crate::storage::db::is_unique_violation;
use crate::storage::{from_millis, to_millis, Database};

/// Candidates fetched per claim round
const CLAIM_CANDIDATES: i64 = 8;

/// Rounds of re-reading candidates before a claim gives up
const MAX_CLAIM_ROUNDS: usize = 4;

const MAX_ERROR_LEN: usize = 2_000;

const JOB_COLUMNS: &str = "id, entity_type, entity_id, status, priority, attempt, max_attempts, \
     next_retry_at, last_error, model, lease_owner, lease_expires_at, \
     created_at, updated_at, started_at, completed_at";

/// Repository for embedding job rows
pub struct JobStore {
    db: Arc<Database>,
    max_attempts: u32,
}

impl JobStore {
    /// `max_attempts` is stamped on every job created through this store
    pub fn new(db: Arc<Database>, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Create a job for the entity unless a live one exists
    pub fn enqueue(&self, entity_type: &str, entity_id: i64, priority: i32) -> Result<EnqueueOutcome> {
        self.enqueue_at(entity_type, entity_id, priority, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        entity_type: &str,
        entity_id: i64,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        if entity_type.trim().is_empty() {
            return Err(EmbedError::Generic("entity_type must not be empty".to_string()));
        }

        let now_ms = to_millis(now);
        let outcome = self.db.transaction(|tx| {
            if let Some(existing) = select_live(tx, entity_type, entity_id)? {
                return Ok(EnqueueOutcome {
                    job_id: existing.id,
                    created: false,
                });
            }

            let inserted = tx.execute(
                "INSERT INTO embedding_jobs \
                 (entity_type, entity_id, status, priority, attempt, max_attempts, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
                params![
                    entity_type,
                    entity_id,
                    JobStatus::Pending.as_str(),
                    priority,
                    self.max_attempts,
                    now_ms
                ],
            );

            match inserted {
                Ok(_) => Ok(EnqueueOutcome {
                    job_id: tx.last_insert_rowid(),
                    created: true,
                }),
                // Another process inserted the live row first
                Err(err) if is_unique_violation(&err) => {
                    let existing = select_live(tx, entity_type, entity_id)?
                        .ok_or(EmbedError::Storage(err))?;
                    Ok(EnqueueOutcome {
                        job_id: existing.id,
                        created: false,
                    })
                }
                Err(err) => Err(err.into()),
            }
        })?;

        tracing::debug!(
            target: "embedline.jobs",
            op = "jobs.enqueue",
            entity_type,
            entity_id,
            job_id = outcome.job_id,
            created = outcome.created,
            "embedding job enqueue completed"
        );

        Ok(outcome)
    }

    /// Claim the next eligible job for `worker_id`
    pub fn claim_next(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>> {
        self.claim_next_at(worker_id, lease, Utc::now())
    }

    pub fn claim_next_at(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        if worker_id.trim().is_empty() {
            return Err(EmbedError::Generic("worker_id must not be empty".to_string()));
        }

        let now_ms = to_millis(now);
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let lease_until = now_ms.saturating_add(lease_ms);

        let claimed = self.db.with_conn(|conn| {
            for _ in 0..MAX_CLAIM_ROUNDS {
                let candidates = select_claim_candidates(conn, now_ms)?;
                if candidates.is_empty() {
                    return Ok(None);
                }

                for (job_id, status, updated_at) in candidates {
                    status.transition(JobEvent::Claim)?;

                    let updated = conn.execute(
                        "UPDATE embedding_jobs \
                         SET status = ?1, lease_owner = ?2, lease_expires_at = ?3, \
                             started_at = ?4, updated_at = ?4, next_retry_at = NULL \
                         WHERE id = ?5 AND status = ?6 AND updated_at = ?7",
                        params![
                            JobStatus::InProgress.as_str(),
                            worker_id,
                            lease_until,
                            now_ms,
                            job_id,
                            status.as_str(),
                            updated_at
                        ],
                    )?;

                    if updated == 1 {
                        return select_job(conn, job_id);
                    }

                    tracing::debug!(
                        target: "embedline.jobs",
                        op = "jobs.claim",
                        job_id,
                        worker_id,
                        "claim conflict, trying next candidate"
                    );
                }
            }
            Ok(None)
        })?;

        if let Some(job) = &claimed {
            tracing::debug!(
                target: "embedline.jobs",
                op = "jobs.claim",
                job_id = job.id,
                entity_type = %job.entity_type,
                entity_id = job.entity_id,
                worker_id,
                attempt = job.attempt,
                "embedding job claimed"
            );
        }

        Ok(claimed)
    }

    /// Unit of work: write the entity's chunks and mark the job COMPLETED
    /// in one transaction, only if `worker_id` still holds the job.
    pub fn complete_with_chunks(
        &self,
        job_id: i64,
        worker_id: &str,
        chunks: &[ChunkEmbedding],
        model: Option<&str>,
    ) -> Result<CommitOutcome> {
        let now_ms = to_millis(Utc::now());

        let outcome = self.db.transaction(|tx| {
            let job = select_job(tx, job_id)?.ok_or(EmbedError::JobNotFound(job_id))?;

            if job.status == JobStatus::Cancelled {
                return Ok(CommitOutcome::Cancelled);
            }
            if job.status != JobStatus::InProgress || job.lease_owner.as_deref() != Some(worker_id) {
                return Ok(CommitOutcome::LeaseLost);
            }
            job.status.transition(JobEvent::Complete)?;

            let model_name = model.unwrap_or_default();
            replace_entity_chunks(tx, &job.entity_type, job.entity_id, chunks, model_name, now_ms)?;

            let updated = tx.execute(
                "UPDATE embedding_jobs \
                 SET status = ?1, completed_at = ?2, updated_at = ?2, model = ?3, last_error = NULL, \
                     lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?4 AND status = ?5 AND lease_owner = ?6",
                params![
                    JobStatus::Completed.as_str(),
                    now_ms,
                    model,
                    job_id,
                    JobStatus::InProgress.as_str(),
                    worker_id
                ],
            )?;
            if updated != 1 {
                return Err(EmbedError::Generic(format!(
                    "job {} changed during commit",
                    job_id
                )));
            }

            Ok(CommitOutcome::Committed)
        })?;

        tracing::debug!(
            target: "embedline.jobs",
            op = "jobs.commit",
            job_id,
            worker_id,
            chunks = chunks.len(),
            outcome = ?outcome,
            "embedding job commit finished"
        );

        Ok(outcome)
    }

    /// Record a transient failure; FAILED once attempts are exhausted
    pub fn retry_later(&self, job_id: i64, error: &str, backoff: Duration) -> Result<JobStatus> {
        self.record_transient_failure(job_id, None, error, backoff, Utc::now())
    }

    /// As [`retry_later`](Self::retry_later), only while `worker_id` holds the lease
    pub fn retry_later_as(
        &self,
        job_id: i64,
        worker_id: &str,
        error: &str,
        backoff: Duration,
    ) -> Result<JobStatus> {
        self.record_transient_failure(job_id, Some(worker_id), error, backoff, Utc::now())
    }

    fn record_transient_failure(
        &self,
        job_id: i64,
        worker_id: Option<&str>,
        error: &str,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let now_ms = to_millis(now);
        let backoff_ms = i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX);
        let error = truncate_error(error);

        let (job, status) = self.transition_held(
            job_id,
            worker_id,
            |job| {
                if job.attempt.saturating_add(1) >= job.max_attempts {
                    JobEvent::Fail
                } else {
                    JobEvent::ScheduleRetry
                }
            },
            |conn, job, next| {
                let next_retry_at = match next {
                    JobStatus::RetryPending => Some(now_ms.saturating_add(backoff_ms)),
                    _ => None,
                };
                conn.execute(
                    "UPDATE embedding_jobs \
                     SET status = ?1, attempt = ?2, last_error = ?3, next_retry_at = ?4, updated_at = ?5, \
                         lease_owner = NULL, lease_expires_at = NULL \
                     WHERE id = ?6 AND status = ?7 AND updated_at = ?8",
                    params![
                        next.as_str(),
                        job.attempt.saturating_add(1),
                        error,
                        next_retry_at,
                        now_ms,
                        job.id,
                        JobStatus::InProgress.as_str(),
                        to_millis(job.updated_at)
                    ],
                )
            },
        )?;

        let attempt = job.attempt.saturating_add(1);
        match status {
            JobStatus::RetryPending => tracing::info!(
                target: "embedline.jobs",
                job_id,
                attempt,
                backoff_ms,
                "embedding job scheduled for retry"
            ),
            JobStatus::Failed => tracing::warn!(
                target: "embedline.jobs",
                job_id,
                attempt,
                error = %error,
                "embedding job failed permanently after exhausting attempts"
            ),
            _ => {}
        }

        Ok(status)
    }

    /// Permanent failure: FAILED immediately, no retry
    pub fn fail(&self, job_id: i64, error: &str) -> Result<JobStatus> {
        self.fail_inner(job_id, None, error)
    }

    pub fn fail_as(&self, job_id: i64, worker_id: &str, error: &str) -> Result<JobStatus> {
        self.fail_inner(job_id, Some(worker_id), error)
    }

    fn fail_inner(&self, job_id: i64, worker_id: Option<&str>, error: &str) -> Result<JobStatus> {
        let now_ms = to_millis(Utc::now());
        let error = truncate_error(error);

        let (_, status) = self.transition_held(
            job_id,
            worker_id,
            |_| JobEvent::Fail,
            |conn, job, next| {
                conn.execute(
                    "UPDATE embedding_jobs \
                     SET status = ?1, last_error = ?2, updated_at = ?3, \
                         lease_owner = NULL, lease_expires_at = NULL \
                     WHERE id = ?4 AND status = ?5 AND updated_at = ?6",
                    params![
                        next.as_str(),
                        error,
                        now_ms,
                        job.id,
                        JobStatus::InProgress.as_str(),
                        to_millis(job.updated_at)
                    ],
                )
            },
        )?;

        if status == JobStatus::Failed {
            tracing::warn!(
                target: "embedline.jobs",
                job_id,
                error = %error,
                "embedding job failed permanently"
            );
        }
        Ok(status)
    }

    /// Hand a claimed job back to PENDING without consuming an attempt
    pub fn release(&self, job_id: i64, worker_id: &str) -> Result<JobStatus> {
        let now_ms = to_millis(Utc::now());
        let (_, status) = self.transition_held(
            job_id,
            Some(worker_id),
            |_| JobEvent::Release,
            |conn, job, next| {
                conn.execute(
                    "UPDATE embedding_jobs \
                     SET status = ?1, updated_at = ?2, lease_owner = NULL, lease_expires_at = NULL \
                     WHERE id = ?3 AND status = ?4 AND updated_at = ?5",
                    params![
                        next.as_str(),
                        now_ms,
                        job.id,
                        JobStatus::InProgress.as_str(),
                        to_millis(job.updated_at)
                    ],
                )
            },
        )?;
        Ok(status)
    }

    /// Mark an in-flight job COMPLETED without touching chunk rows
    pub fn complete(&self, job_id: i64) -> Result<JobStatus> {
        let now_ms = to_millis(Utc::now());
        let (_, status) = self.transition_held(
            job_id,
            None,
            |_| JobEvent::Complete,
            |conn, job, next| {
                conn.execute(
                    "UPDATE embedding_jobs \
                     SET status = ?1, completed_at = ?2, updated_at = ?2, last_error = NULL, \
                         lease_owner = NULL, lease_expires_at = NULL \
                     WHERE id = ?3 AND status = ?4 AND updated_at = ?5",
                    params![
                        next.as_str(),
                        now_ms,
                        job.id,
                        JobStatus::InProgress.as_str(),
                        to_millis(job.updated_at)
                    ],
                )
            },
        )?;
        Ok(status)
    }

    /// Shared path for single-row transitions out of IN_PROGRESS.
    ///
    /// Returns the row as read inside the transaction plus its new status.
    /// A job that was cancelled, or whose lease `worker_id` no longer holds,
    /// is left alone and its current status returned. Any other illegal edge
    /// is an error.
    fn transition_held<E, F>(
        &self,
        job_id: i64,
        worker_id: Option<&str>,
        event_for: E,
        update: F,
    ) -> Result<(Job, JobStatus)>
    where
        E: FnOnce(&Job) -> JobEvent,
        F: FnOnce(&Connection, &Job, JobStatus) -> rusqlite::Result<usize>,
    {
        self.db.transaction(|tx| {
            let job = select_job(tx, job_id)?.ok_or(EmbedError::JobNotFound(job_id))?;
            let event = event_for(&job);

            let lost = match worker_id {
                Some(worker) => {
                    job.status != JobStatus::InProgress
                        || job.lease_owner.as_deref() != Some(worker)
                }
                None => false,
            };
            if job.status == JobStatus::Cancelled || lost {
                tracing::debug!(
                    target: "embedline.jobs",
                    job_id,
                    status = %job.status,
                    event = ?event,
                    "job no longer held by caller, transition skipped"
                );
                let status = job.status;
                return Ok((job, status));
            }

            let next = job.status.transition(event)?;
            let updated = update(tx, &job, next)?;
            if updated != 1 {
                return Err(EmbedError::Generic(format!(
                    "job {} changed concurrently during {:?}",
                    job_id, event
                )));
            }
            Ok((job, next))
        })
    }

    /// Bulk-cancel every live job of an entity type
    pub fn cancel(&self, entity_type: &str) -> Result<usize> {
        let now_ms = to_millis(Utc::now());
        let sql = format!(
            "UPDATE embedding_jobs \
             SET status = ?1, updated_at = ?2, next_retry_at = NULL, \
                 lease_owner = NULL, lease_expires_at = NULL \
             WHERE entity_type = ?3 AND status IN ({})",
            sql_status_list(JobEvent::Cancel.sources())
        );

        let cancelled = self.db.with_conn(|conn| {
            Ok(conn.execute(&sql, params![JobStatus::Cancelled.as_str(), now_ms, entity_type])?)
        })?;

        tracing::info!(
            target: "embedline.jobs",
            op = "jobs.cancel",
            entity_type,
            cancelled,
            "cancelled live embedding jobs"
        );
        Ok(cancelled)
    }

    /// Cancel a single job; false when it was already terminal
    pub fn cancel_job(&self, job_id: i64) -> Result<bool> {
        let now_ms = to_millis(Utc::now());
        self.db.transaction(|tx| {
            let job = select_job(tx, job_id)?.ok_or(EmbedError::JobNotFound(job_id))?;
            if job.status.transition(JobEvent::Cancel).is_err() {
                return Ok(false);
            }
            tx.execute(
                "UPDATE embedding_jobs \
                 SET status = ?1, updated_at = ?2, next_retry_at = NULL, \
                     lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?3",
                params![JobStatus::Cancelled.as_str(), now_ms, job_id],
            )?;
            Ok(true)
        })
    }

    /// Reset IN_PROGRESS jobs whose lease ran out before `now` back to PENDING
    pub fn reclaim_orphans(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = to_millis(now);
        let sql = format!(
            "UPDATE embedding_jobs \
             SET status = ?1, updated_at = ?2, lease_owner = NULL, lease_expires_at = NULL \
             WHERE status IN ({}) AND lease_expires_at < ?2",
            sql_status_list(JobEvent::LeaseExpired.sources())
        );

        let reclaimed = self.db.with_conn(|conn| {
            Ok(conn.execute(&sql, params![JobStatus::Pending.as_str(), now_ms])?)
        })?;

        if reclaimed > 0 {
            tracing::info!(
                target: "embedline.jobs",
                op = "jobs.reclaim_orphans",
                reclaimed,
                "reclaimed orphaned embedding jobs"
            );
        }
        Ok(reclaimed)
    }

    /// Move RETRY_PENDING jobs whose retry time has come back to PENDING
    pub fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = to_millis(now);
        let sql = format!(
            "UPDATE embedding_jobs \
             SET status = ?1, updated_at = ?2, next_retry_at = NULL \
             WHERE status IN ({}) AND next_retry_at <= ?2",
            sql_status_list(JobEvent::RetryDue.sources())
        );

        self.db
            .with_conn(|conn| Ok(conn.execute(&sql, params![JobStatus::Pending.as_str(), now_ms])?))
    }

    pub fn get(&self, job_id: i64) -> Result<Job> {
        self.db
            .with_conn(|conn| select_job(conn, job_id))?
            .ok_or(EmbedError::JobNotFound(job_id))
    }

    pub fn live_job_for(&self, entity_type: &str, entity_id: i64) -> Result<Option<Job>> {
        self.db
            .with_conn(|conn| select_live(conn, entity_type, entity_id))
    }

    /// Every job row for an entity, newest first
    pub fn history_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM embedding_jobs WHERE entity_type = ?1 AND entity_id = ?2 \
             ORDER BY id DESC",
            JOB_COLUMNS
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![entity_type, entity_id], job_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn stats(&self) -> Result<JobStats> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, status, COUNT(*) FROM embedding_jobs \
                 GROUP BY entity_type, status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut stats = JobStats::default();
            for row in rows {
                let (entity_type, status, count) = row?;
                let status = JobStatus::parse(&status).ok_or_else(|| {
                    EmbedError::Generic(format!("unknown job status '{}' in store", status))
                })?;
                stats.record(entity_type, status, u64::try_from(count).unwrap_or(0));
            }
            Ok(stats)
        })
    }

    /// PENDING plus due RETRY_PENDING jobs
    pub fn count_eligible(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_ms = to_millis(now);
        let count: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM embedding_jobs \
                 WHERE status = ?1 OR (status = ?2 AND next_retry_at <= ?3)",
                params![
                    JobStatus::Pending.as_str(),
                    JobStatus::RetryPending.as_str(),
                    now_ms
                ],
                |row| row.get(0),
            )?)
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Delete terminal jobs last touched before `older_than`
    pub fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let cutoff = to_millis(older_than);
        let sql = format!(
            "DELETE FROM embedding_jobs WHERE status IN ({}) AND updated_at < ?1",
            sql_status_list(&[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled])
        );

        let purged = self
            .db
            .with_conn(|conn| Ok(conn.execute(&sql, params![cutoff])?))?;

        tracing::info!(
            target: "embedline.jobs",
            op = "jobs.purge",
            purged,
            "purged terminal embedding jobs"
        );
        Ok(purged)
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &error[..end])
}

fn select_job(conn: &Connection, job_id: i64) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM embedding_jobs WHERE id = ?1", JOB_COLUMNS);
    Ok(conn
        .query_row(&sql, params![job_id], job_from_row)
        .optional()?)
}

fn select_live(conn: &Connection, entity_type: &str, entity_id: i64) -> Result<Option<Job>> {
    let sql = format!(
        "SELECT {} FROM embedding_jobs \
         WHERE entity_type = ?1 AND entity_id = ?2 AND status IN ({}) \
         ORDER BY id ASC LIMIT 1",
        JOB_COLUMNS,
        sql_status_list(&JobStatus::LIVE)
    );
    Ok(conn
        .query_row(&sql, params![entity_type, entity_id], job_from_row)
        .optional()?)
}

fn select_claim_candidates(conn: &Connection, now_ms: i64) -> Result<Vec<(i64, JobStatus, i64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, status, updated_at FROM embedding_jobs \
         WHERE status = ?1 OR (status = ?2 AND next_retry_at <= ?3) \
         ORDER BY priority ASC, created_at ASC, id ASC \
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![
            JobStatus::Pending.as_str(),
            JobStatus::RetryPending.as_str(),
            now_ms,
            CLAIM_CANDIDATES
        ],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                parse_status(row, 1)?,
                row.get::<_, i64>(2)?,
            ))
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    JobStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(idx, "status".to_string(), rusqlite::types::Type::Text)
    })
}

fn optional_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        status: parse_status(row, 3)?,
        priority: row.get(4)?,
        attempt: row.get(5)?,
        max_attempts: row.get(6)?,
        next_retry_at: optional_ts(row, 7)?,
        last_error: row.get(8)?,
        model: row.get(9)?,
        lease_owner: row.get(10)?,
        lease_expires_at: optional_ts(row, 11)?,
        created_at: from_millis(row.get(12)?),
        updated_at: from_millis(row.get(13)?),
        started_at: optional_ts(row, 14)?,
        completed_at: optional_ts(row, 15)?,
    })
}
