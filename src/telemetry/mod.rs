//! Telemetry for the embedding pipeline
//!
//! Keeps a bounded buffer of recent pipeline events and running counters.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::health::CircuitState;

/// Events kept in memory before the oldest are dropped
const MAX_EVENTS: usize = 1_000;

/// Telemetry event types
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    JobClaimed {
        job_id: i64,
        worker_id: String,
        timestamp: Instant,
    },
    JobCompleted {
        job_id: i64,
        chunks: usize,
        duration_ms: u64,
        timestamp: Instant,
    },
    RetryScheduled {
        job_id: i64,
        attempt: u32,
        delay_ms: u64,
        timestamp: Instant,
    },
    JobFailed {
        job_id: i64,
        error: String,
        timestamp: Instant,
    },
    JobCancelled {
        job_id: i64,
        timestamp: Instant,
    },
    JobReleased {
        job_id: i64,
        timestamp: Instant,
    },
    OrphansReclaimed {
        count: usize,
        timestamp: Instant,
    },
    BreakerTransition {
        provider: String,
        from: CircuitState,
        to: CircuitState,
        timestamp: Instant,
    },
}

/// Telemetry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub jobs_claimed: usize,
    pub jobs_completed: usize,
    pub retries_scheduled: usize,
    pub jobs_failed: usize,
    pub jobs_cancelled: usize,
    pub jobs_released: usize,
    pub orphans_reclaimed: usize,
    pub breaker_trips: usize,
    pub chunks_written: usize,
}

/// Telemetry collector
#[derive(Clone)]
pub struct TelemetryCollector {
    events: Arc<Mutex<VecDeque<TelemetryEvent>>>,
    stats: Arc<Mutex<TelemetryStats>>,
    start_time: Instant,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(Mutex::new(TelemetryStats::default())),
            start_time: Instant::now(),
        }
    }

    /// Record an event
    pub fn record(&self, event: TelemetryEvent) {
        {
            let mut stats = lock(&self.stats);
            match &event {
                TelemetryEvent::JobClaimed { .. } => stats.jobs_claimed += 1,
                TelemetryEvent::JobCompleted { chunks, .. } => {
                    stats.jobs_completed += 1;
                    stats.chunks_written += chunks;
                }
                TelemetryEvent::RetryScheduled { .. } => stats.retries_scheduled += 1,
                TelemetryEvent::JobFailed { .. } => stats.jobs_failed += 1,
                TelemetryEvent::JobCancelled { .. } => stats.jobs_cancelled += 1,
                TelemetryEvent::JobReleased { .. } => stats.jobs_released += 1,
                TelemetryEvent::OrphansReclaimed { count, .. } => {
                    stats.orphans_reclaimed += count;
                }
                TelemetryEvent::BreakerTransition { to, .. } => {
                    if *to == CircuitState::Open {
                        stats.breaker_trips += 1;
                    }
                }
            }
        }

        let mut events = lock(&self.events);
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> TelemetryStats {
        lock(&self.stats).clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.events).len()
    }

    /// Get recent events (last n)
    pub fn recent_events(&self, n: usize) -> Vec<TelemetryEvent> {
        let events = lock(&self.events);
        let start = events.len().saturating_sub(n);
        events.iter().skip(start).cloned().collect()
    }

    /// Completed jobs over all jobs that reached an outcome
    pub fn success_rate(&self) -> f64 {
        let stats = lock(&self.stats);
        let total = stats.jobs_completed + stats.jobs_failed;
        if total == 0 {
            1.0
        } else {
            stats.jobs_completed as f64 / total as f64
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_creation() {
        let collector = TelemetryCollector::new();
        assert_eq!(collector.event_count(), 0);
        assert_eq!(collector.get_stats(), TelemetryStats::default());
    }

    #[test]
    fn test_record_job_events() {
        let collector = TelemetryCollector::new();
        collector.record(TelemetryEvent::JobClaimed {
            job_id: 1,
            worker_id: "w1".to_string(),
            timestamp: Instant::now(),
        });
        collector.record(TelemetryEvent::JobCompleted {
            job_id: 1,
            chunks: 4,
            duration_ms: 12,
            timestamp: Instant::now(),
        });
        collector.record(TelemetryEvent::OrphansReclaimed {
            count: 3,
            timestamp: Instant::now(),
        });

        let stats = collector.get_stats();
        assert_eq!(stats.jobs_claimed, 1);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.chunks_written, 4);
        assert_eq!(stats.orphans_reclaimed, 3);
    }

    #[test]
    fn test_breaker_trips_count_only_openings() {
        let collector = TelemetryCollector::new();
        for (from, to) in [
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Open),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ] {
            collector.record(TelemetryEvent::BreakerTransition {
                provider: "ollama".to_string(),
                from,
                to,
                timestamp: Instant::now(),
            });
        }
        assert_eq!(collector.get_stats().breaker_trips, 2);
    }

    #[test]
    fn test_success_rate() {
        let collector = TelemetryCollector::new();
        assert_eq!(collector.success_rate(), 1.0);

        for job_id in 0..2 {
            collector.record(TelemetryEvent::JobCompleted {
                job_id,
                chunks: 1,
                duration_ms: 1,
                timestamp: Instant::now(),
            });
        }
        collector.record(TelemetryEvent::JobFailed {
            job_id: 9,
            error: "bad input".to_string(),
            timestamp: Instant::now(),
        });

        assert!((collector.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_event_buffer_is_bounded() {
        let collector = TelemetryCollector::new();
        for job_id in 0..(MAX_EVENTS as i64 + 10) {
            collector.record(TelemetryEvent::JobCancelled {
                job_id,
                timestamp: Instant::now(),
            });
        }

        assert_eq!(collector.event_count(), MAX_EVENTS);
        assert_eq!(collector.get_stats().jobs_cancelled, MAX_EVENTS + 10);

        let recent = collector.recent_events(1);
        assert!(matches!(
            recent[0],
            TelemetryEvent::JobCancelled { job_id, .. } if job_id == MAX_EVENTS as i64 + 9
        ));
    }
}
