//! Human-readable rendering for CLI results
//!
//! Everything here returns a `String`; the binary decides where it goes.

use colored::{ColoredString, Colorize};
use std::fmt::Write;

use crate::health::{CircuitState, ProviderHealth};
use crate::jobs::{EnqueueOutcome, Job, JobStatus};
use crate::search::SearchHit;
use crate::service::PipelineStats;
use crate::telemetry::TelemetryStats;

pub fn status_label(status: JobStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        JobStatus::Completed => label.green(),
        JobStatus::Failed => label.red().bold(),
        JobStatus::Cancelled => label.dimmed(),
        JobStatus::InProgress => label.cyan(),
        JobStatus::RetryPending => label.yellow(),
        JobStatus::Pending => label.normal(),
    }
}

fn circuit_label(state: CircuitState) -> ColoredString {
    match state {
        CircuitState::Closed => state.as_str().green(),
        CircuitState::HalfOpen => state.as_str().yellow(),
        CircuitState::Open => state.as_str().red().bold(),
    }
}

pub fn render_enqueued(entity_type: &str, entity_id: i64, outcome: &EnqueueOutcome) -> String {
    if outcome.created {
        format!(
            "{} {}:{} queued as job {}",
            "+".green(),
            entity_type,
            entity_id,
            outcome.job_id
        )
    } else {
        format!(
            "{} {}:{} already queued as job {}",
            "=".yellow(),
            entity_type,
            entity_id,
            outcome.job_id
        )
    }
}

pub fn render_job(job: &Job) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}  {}:{}",
        format!("Job {}", job.id).bold(),
        status_label(job.status),
        job.entity_type,
        job.entity_id
    );
    let _ = writeln!(out, "  priority:  {}", job.priority);
    let _ = writeln!(out, "  attempts:  {}/{}", job.attempt, job.max_attempts);
    let _ = writeln!(out, "  created:   {}", job.created_at.to_rfc3339());
    let _ = writeln!(out, "  updated:   {}", job.updated_at.to_rfc3339());
    if let Some(at) = job.next_retry_at {
        let _ = writeln!(out, "  retry at:  {}", at.to_rfc3339());
    }
    if let Some(owner) = &job.lease_owner {
        let expires = job
            .lease_expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
        let _ = writeln!(out, "  lease:     {} until {}", owner, expires);
    }
    if let Some(model) = &job.model {
        let _ = writeln!(out, "  model:     {}", model);
    }
    if let Some(error) = &job.last_error {
        let _ = writeln!(out, "  error:     {}", error.red());
    }
    out
}

pub fn render_history(jobs: &[Job]) -> String {
    if jobs.is_empty() {
        return "No jobs for this entity".dimmed().to_string();
    }
    let mut out = String::new();
    for job in jobs {
        let _ = writeln!(
            out,
            "{:>8}  {:<14} attempts {}/{}  {}",
            job.id,
            status_label(job.status),
            job.attempt,
            job.max_attempts,
            job.updated_at.to_rfc3339()
        );
    }
    out
}

pub fn render_stats(stats: &PipelineStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Jobs".bold());
    for status in JobStatus::ALL {
        let _ = writeln!(out, "  {:<14} {}", status_label(status), stats.jobs.count(status));
    }
    let _ = writeln!(out, "  {:<14} {}", "total", stats.jobs.total);
    let _ = writeln!(out, "  {:<14} {}", "eligible now", stats.eligible);

    if !stats.jobs.by_entity_type.is_empty() {
        let _ = writeln!(out, "{}", "By entity type".bold());
        for (entity_type, count) in &stats.jobs.by_entity_type {
            let failed = stats
                .jobs
                .by_entity_type_and_status
                .get(entity_type)
                .and_then(|by_status| by_status.get(&JobStatus::Failed))
                .copied()
                .unwrap_or(0);
            let _ = writeln!(out, "  {:<14} {} ({} failed)", entity_type, count, failed);
        }
    }

    let _ = writeln!(out, "{} {}", "Stored chunks:".bold(), stats.chunks);
    out
}

pub fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results".dimmed().to_string();
    }
    let mut out = String::new();
    for (rank, hit) in hits.iter().enumerate() {
        let _ = writeln!(out, "{:>3}. entity {:<10} score {:.5}", rank + 1, hit.entity_id, hit.score);
    }
    out
}

pub fn render_health(health: &ProviderHealth) -> String {
    let mut out = String::new();
    let available = if health.is_available {
        "available".green()
    } else {
        "unavailable".red()
    };
    let _ = writeln!(out, "{} {}", health.provider.bold(), available);
    let _ = writeln!(out, "  circuit:   {}", circuit_label(health.circuit_state));
    let _ = writeln!(out, "  failures:  {}", health.consecutive_failures);
    if let Some(at) = health.last_checked_at {
        let _ = writeln!(out, "  checked:   {}", at.to_rfc3339());
    }
    if let Some(at) = health.last_success_at {
        let _ = writeln!(out, "  success:   {}", at.to_rfc3339());
    }
    if let Some(error) = &health.last_error {
        let _ = writeln!(out, "  error:     {}", error.red());
    }
    out
}

pub fn render_telemetry(stats: &TelemetryStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Session".bold());
    let rows = [
        ("claimed", stats.jobs_claimed),
        ("completed", stats.jobs_completed),
        ("retries", stats.retries_scheduled),
        ("failed", stats.jobs_failed),
        ("cancelled", stats.jobs_cancelled),
        ("released", stats.jobs_released),
        ("reclaimed", stats.orphans_reclaimed),
        ("breaker trips", stats.breaker_trips),
        ("chunks", stats.chunks_written),
    ];
    for (label, value) in rows {
        let _ = writeln!(out, "  {:<14} {}", label, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            entity_type: "DOC".to_string(),
            entity_id: 42,
            status,
            priority: 1,
            attempt: 3,
            max_attempts: 3,
            next_retry_at: None,
            last_error: Some("connection refused".to_string()),
            model: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_render_failed_job() {
        colored::control::set_override(false);
        let rendered = render_job(&job(JobStatus::Failed));
        assert!(rendered.contains("Job 7 FAILED  DOC:42"));
        assert!(rendered.contains("attempts:  3/3"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_render_hits() {
        colored::control::set_override(false);
        assert_eq!(render_hits(&[]), "No results");
        let rendered = render_hits(&[SearchHit {
            entity_id: 5,
            score: 0.5,
        }]);
        assert!(rendered.contains("1. entity 5"));
    }

    #[test]
    fn test_render_enqueued() {
        colored::control::set_override(false);
        let outcome = EnqueueOutcome {
            job_id: 3,
            created: false,
        };
        assert_eq!(render_enqueued("DOC", 1, &outcome), "= DOC:1 already queued as job 3");
    }
}
