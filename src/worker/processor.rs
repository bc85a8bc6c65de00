//! One worker step: claim a job, embed its chunks, commit or reschedule
//!
//! The breaker is consulted before claiming, so while it is OPEN eligible
//! jobs stay PENDING. No store lock is held while the provider is called;
//! the job is checked out through its lease instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::embeddings::ChunkEmbedding;
use crate::errors::{EmbedError, ProviderError, Result};
use crate::health::{Admission, ProviderHealthMonitor};
use crate::jobs::{CommitOutcome, Job, JobStatus, JobStore, RetryDecision, RetryPolicy};
use crate::provider::EmbeddingProvider;
use crate::source::ChunkSource;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};

/// What happened to a claimed job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Chunks written and job COMPLETED
    Completed { chunks: usize },
    /// Transient failure; RETRY_PENDING until the delay passes
    Retrying { attempt: u32, delay: Duration },
    /// Permanent failure or attempts exhausted
    Failed { error: String },
    /// Cancelled while claimed; nothing written
    Cancelled,
    /// Breaker refused the call; job handed back to PENDING
    Released,
    /// Lease expired and the job moved on without us; nothing written
    LeaseLost,
    /// Store write failed; the job stays claimed until its lease expires
    StoreError(String),
}

/// Result of one [`JobProcessor::work_once`] call
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    /// No eligible job
    Idle,
    /// Breaker open; nothing claimed
    Throttled,
    Processed { job_id: i64, outcome: JobOutcome },
}

pub struct JobProcessor {
    store: Arc<JobStore>,
    source: Arc<dyn ChunkSource>,
    provider: Arc<dyn EmbeddingProvider>,
    monitor: Arc<ProviderHealthMonitor>,
    policy: RetryPolicy,
    telemetry: TelemetryCollector,
}

impl JobProcessor {
    pub fn new(
        store: Arc<JobStore>,
        source: Arc<dyn ChunkSource>,
        provider: Arc<dyn EmbeddingProvider>,
        monitor: Arc<ProviderHealthMonitor>,
        policy: RetryPolicy,
        telemetry: TelemetryCollector,
    ) -> Self {
        Self {
            store,
            source,
            provider,
            monitor,
            policy,
            telemetry,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn monitor(&self) -> &Arc<ProviderHealthMonitor> {
        &self.monitor
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    /// Claim and process at most one job
    pub async fn work_once(&self, worker_id: &str, lease: Duration) -> Result<WorkOutcome> {
        if !self.monitor.allows_requests() {
            return Ok(WorkOutcome::Throttled);
        }

        let Some(job) = self.store.claim_next(worker_id, lease)? else {
            return Ok(WorkOutcome::Idle);
        };

        self.telemetry.record(TelemetryEvent::JobClaimed {
            job_id: job.id,
            worker_id: worker_id.to_string(),
            timestamp: Instant::now(),
        });

        let started = Instant::now();
        let outcome = self.process(&job, worker_id).await;
        self.record_outcome(job.id, &outcome, started.elapsed());

        Ok(WorkOutcome::Processed {
            job_id: job.id,
            outcome,
        })
    }

    /// Run a job `worker_id` has claimed through to a store transition
    pub async fn process(&self, job: &Job, worker_id: &str) -> JobOutcome {
        let started = Instant::now();

        let admission = self.monitor.try_acquire();
        if admission == Admission::Rejected {
            return self.release_job(job.id, worker_id);
        }

        // Cooperative cancellation: re-read before doing any work
        let current = match self.store.get(job.id) {
            Ok(current) => current,
            Err(e) => {
                self.release_admission(admission);
                return JobOutcome::StoreError(e.to_string());
            }
        };
        if current.status == JobStatus::Cancelled {
            self.release_admission(admission);
            return JobOutcome::Cancelled;
        }
        if current.status != JobStatus::InProgress
            || current.lease_owner.as_deref() != Some(worker_id)
        {
            self.release_admission(admission);
            return JobOutcome::LeaseLost;
        }

        let chunks = match self.source.chunks(&current.entity_type, current.entity_id).await {
            Ok(chunks) => chunks,
            Err(EmbedError::InvalidContent(reason)) => {
                self.release_admission(admission);
                return self.fail_job(&current, worker_id, &reason);
            }
            Err(e) => {
                self.release_admission(admission);
                // Content store hiccups are retried like provider outages
                return self.schedule_retry(&current, worker_id, &e.to_string());
            }
        };

        let texts: Vec<_> = chunks
            .into_iter()
            .filter(|chunk| !chunk.text.trim().is_empty())
            .collect();
        if texts.is_empty() {
            self.release_admission(admission);
            tracing::debug!(
                target: "embedline.worker",
                job_id = current.id,
                entity_type = %current.entity_type,
                entity_id = current.entity_id,
                "entity has no text; completing with zero chunks"
            );
            return self.commit(&current, worker_id, &[], None);
        }

        let mut embedded = Vec::with_capacity(texts.len());
        let mut model = None;
        for (index, chunk) in texts.into_iter().enumerate() {
            // The first call runs under the admission taken above
            if index > 0 && self.monitor.try_acquire() == Admission::Rejected {
                tracing::debug!(
                    target: "embedline.worker",
                    job_id = current.id,
                    worker_id,
                    embedded = index,
                    "breaker opened mid-job; handing the job back"
                );
                return self.release_job(current.id, worker_id);
            }
            match self.provider.embed(&chunk.text).await {
                Ok(embedding) => {
                    self.monitor.record_success();
                    model = Some(embedding.model);
                    embedded.push(ChunkEmbedding {
                        chunk_index: u32::try_from(index).unwrap_or(u32::MAX),
                        text: chunk.text,
                        vector: embedding.vector,
                        token_count: chunk.token_count,
                    });
                }
                Err(e) => {
                    self.monitor.record_failure(&e);
                    return self.provider_failure(&current, worker_id, &e);
                }
            }
        }

        let outcome = self.commit(&current, worker_id, &embedded, model.as_deref());
        if let JobOutcome::Completed { chunks } = &outcome {
            tracing::info!(
                target: "embedline.worker",
                job_id = current.id,
                entity_type = %current.entity_type,
                entity_id = current.entity_id,
                worker_id,
                chunks,
                duration_ms = started.elapsed().as_millis() as u64,
                "embedding job completed"
            );
        }
        outcome
    }

    fn commit(
        &self,
        job: &Job,
        worker_id: &str,
        chunks: &[ChunkEmbedding],
        model: Option<&str>,
    ) -> JobOutcome {
        match self.store.complete_with_chunks(job.id, worker_id, chunks, model) {
            Ok(CommitOutcome::Committed) => JobOutcome::Completed {
                chunks: chunks.len(),
            },
            Ok(CommitOutcome::Cancelled) => JobOutcome::Cancelled,
            Ok(CommitOutcome::LeaseLost) => JobOutcome::LeaseLost,
            Err(e) => {
                tracing::error!(
                    target: "embedline.worker",
                    job_id = job.id,
                    worker_id,
                    error = %e,
                    "failed to commit embeddings; job left to lease expiry"
                );
                JobOutcome::StoreError(e.to_string())
            }
        }
    }

    fn provider_failure(&self, job: &Job, worker_id: &str, error: &ProviderError) -> JobOutcome {
        if error.is_transient() {
            return self.schedule_retry(job, worker_id, error.message());
        }
        self.fail_job(job, worker_id, error.message())
    }

    /// FAILED now, without consuming an attempt
    fn fail_job(&self, job: &Job, worker_id: &str, error: &str) -> JobOutcome {
        match self.store.fail_as(job.id, worker_id, error) {
            Ok(JobStatus::Failed) => JobOutcome::Failed {
                error: error.to_string(),
            },
            Ok(status) => self.skipped_outcome(status),
            Err(e) => JobOutcome::StoreError(e.to_string()),
        }
    }

    fn release_job(&self, job_id: i64, worker_id: &str) -> JobOutcome {
        match self.store.release(job_id, worker_id) {
            Ok(JobStatus::Pending) => JobOutcome::Released,
            Ok(status) => self.skipped_outcome(status),
            Err(e) => JobOutcome::StoreError(e.to_string()),
        }
    }

    fn schedule_retry(&self, job: &Job, worker_id: &str, error: &str) -> JobOutcome {
        let (attempt, delay) = match self.policy.decide(job.attempt) {
            RetryDecision::Retry { attempt, delay } => (attempt, delay),
            RetryDecision::GiveUp { attempt } => (attempt, Duration::ZERO),
        };

        match self.store.retry_later_as(job.id, worker_id, error, delay) {
            Ok(JobStatus::RetryPending) => JobOutcome::Retrying { attempt, delay },
            Ok(JobStatus::Failed) => JobOutcome::Failed {
                error: error.to_string(),
            },
            Ok(status) => self.skipped_outcome(status),
            Err(e) => JobOutcome::StoreError(e.to_string()),
        }
    }

    /// Outcome when the store skipped our transition because the job moved on
    fn skipped_outcome(&self, status: JobStatus) -> JobOutcome {
        match status {
            JobStatus::Cancelled => JobOutcome::Cancelled,
            _ => JobOutcome::LeaseLost,
        }
    }

    fn release_admission(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.monitor.release_probe();
        }
    }

    fn record_outcome(&self, job_id: i64, outcome: &JobOutcome, elapsed: Duration) {
        let timestamp = Instant::now();
        let event = match outcome {
            JobOutcome::Completed { chunks } => TelemetryEvent::JobCompleted {
                job_id,
                chunks: *chunks,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                timestamp,
            },
            JobOutcome::Retrying { attempt, delay } => TelemetryEvent::RetryScheduled {
                job_id,
                attempt: *attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                timestamp,
            },
            JobOutcome::Failed { error } => TelemetryEvent::JobFailed {
                job_id,
                error: error.clone(),
                timestamp,
            },
            JobOutcome::Cancelled => TelemetryEvent::JobCancelled { job_id, timestamp },
            JobOutcome::Released => TelemetryEvent::JobReleased { job_id, timestamp },
            JobOutcome::LeaseLost | JobOutcome::StoreError(_) => return,
        };
        self.telemetry.record(event);
    }
}
