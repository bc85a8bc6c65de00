//! Provider health monitor (circuit breaker)
//!
//! ```text
//!   Closed ──(failure_threshold consecutive transient failures)──> Open
//!   Open ──(cooldown elapsed, next caller)──> HalfOpen
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open
//! ```
//!
//! State lives in atomics so workers can consult the breaker without locks.
//! Only one caller at a time holds the half-open probe slot. After every
//! recorded outcome a [`ProviderHealth`] snapshot is written to the store;
//! a failed write is logged and otherwise ignored.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::errors::ProviderError;
use crate::health::{Admission, BreakerConfig, CircuitState, HealthStore, ProviderHealth};
use crate::provider::EmbeddingProvider;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};

#[derive(Debug, Default)]
struct HealthDetails {
    last_checked_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct ProviderHealthMonitor {
    provider: String,
    config: BreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch` when the breaker last opened
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    epoch: Instant,
    details: Mutex<HealthDetails>,
    store: Option<HealthStore>,
    telemetry: Option<TelemetryCollector>,
}

impl ProviderHealthMonitor {
    /// Fresh, closed breaker that is not persisted
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
            details: Mutex::new(HealthDetails::default()),
            store: None,
            telemetry: None,
        }
    }

    /// Breaker backed by `store`, resuming from the last persisted snapshot.
    ///
    /// A breaker persisted as OPEN or HALF_OPEN resumes OPEN with a fresh cooldown.
    pub fn restore(provider: impl Into<String>, config: BreakerConfig, store: HealthStore) -> Self {
        let mut monitor = Self::new(provider, config);

        match store.load(&monitor.provider) {
            Ok(Some(saved)) => {
                monitor
                    .consecutive_failures
                    .store(saved.consecutive_failures, Ordering::Release);
                if saved.circuit_state != CircuitState::Closed {
                    monitor
                        .state
                        .store(CircuitState::Open as u8, Ordering::Release);
                }
                *monitor.lock_details() = HealthDetails {
                    last_checked_at: saved.last_checked_at,
                    last_success_at: saved.last_success_at,
                    last_error: saved.last_error,
                };
                tracing::debug!(
                    target: "embedline.health",
                    provider = %monitor.provider,
                    state = %monitor.state(),
                    consecutive_failures = saved.consecutive_failures,
                    "restored provider health"
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                target: "embedline.health",
                provider = %monitor.provider,
                error = %e,
                "failed to load provider health; starting closed"
            ),
        }

        monitor.store = Some(store);
        monitor
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Ask permission to call the provider.
    ///
    /// An OPEN breaker whose cooldown has elapsed moves to HALF_OPEN here and
    /// the caller receives the probe slot.
    pub fn try_acquire(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                if !self.cooldown_elapsed() {
                    return Admission::Rejected;
                }
                let moved = self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if moved {
                    self.on_transition(CircuitState::Open, CircuitState::HalfOpen);
                }
                self.acquire_probe()
            }
            CircuitState::HalfOpen => self.acquire_probe(),
        }
    }

    /// Whether a call would currently be admitted, without taking the probe slot
    pub fn allows_requests(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(),
            CircuitState::HalfOpen => !self.probe_in_flight.load(Ordering::Acquire),
        }
    }

    /// Return an unused probe slot
    pub fn release_probe(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Record a successful call. Only a success seen in HALF_OPEN closes the
    /// breaker; one that lands while OPEN came from a call admitted before
    /// the trip and leaves the state alone.
    pub fn record_success(&self) {
        let now = Utc::now();
        if self.state() == CircuitState::Open {
            {
                let mut details = self.lock_details();
                details.last_checked_at = Some(now);
                details.last_success_at = Some(now);
            }
            self.persist();
            return;
        }

        self.consecutive_failures.store(0, Ordering::Release);
        let closed = self
            .state
            .compare_exchange(
                CircuitState::HalfOpen as u8,
                CircuitState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.probe_in_flight.store(false, Ordering::Release);
        if closed {
            self.on_transition(CircuitState::HalfOpen, CircuitState::Closed);
        }

        {
            let mut details = self.lock_details();
            details.last_checked_at = Some(now);
            details.last_success_at = Some(now);
            details.last_error = None;
        }
        self.persist();
    }

    /// Record a failed call. A permanent error means the provider answered,
    /// so it counts toward availability like a success.
    pub fn record_failure(&self, error: &ProviderError) {
        if !error.is_transient() {
            self.record_success();
            return;
        }

        let failures = self
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        {
            let mut details = self.lock_details();
            details.last_checked_at = Some(Utc::now());
            details.last_error = Some(error.message().to_string());
        }

        match self.state() {
            CircuitState::HalfOpen => {
                if self.trip(CircuitState::HalfOpen) {
                    tracing::warn!(
                        target: "embedline.health",
                        provider = %self.provider,
                        error = %error,
                        "probe failed; circuit re-opened"
                    );
                }
                self.probe_in_flight.store(false, Ordering::Release);
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                if self.trip(CircuitState::Closed) {
                    tracing::warn!(
                        target: "embedline.health",
                        provider = %self.provider,
                        consecutive_failures = failures,
                        error = %error,
                        "circuit opened after consecutive failures"
                    );
                }
            }
            _ => {}
        }

        self.persist();
    }

    /// Feed a health-check result to the breaker
    pub fn record_health_check(&self, healthy: bool) {
        if healthy {
            self.record_success();
        } else {
            self.record_failure(&ProviderError::Transient("health check failed".to_string()));
        }
    }

    /// Run `provider`'s health check if the breaker admits a call now.
    ///
    /// An OPEN breaker only lets the check through once its cooldown has
    /// passed, and then as the single HALF_OPEN probe. Returns `None` when the
    /// breaker refused and the provider was not called.
    pub async fn check_health(&self, provider: &dyn EmbeddingProvider) -> Option<bool> {
        if self.try_acquire() == Admission::Rejected {
            return None;
        }
        let healthy = provider.health_check().await;
        self.record_health_check(healthy);
        Some(healthy)
    }

    pub fn snapshot(&self) -> ProviderHealth {
        let state = self.state();
        let details = self.lock_details();
        ProviderHealth {
            provider: self.provider.clone(),
            is_available: state == CircuitState::Closed,
            consecutive_failures: self.consecutive_failures(),
            circuit_state: state,
            last_checked_at: details.last_checked_at,
            last_success_at: details.last_success_at,
            last_error: details.last_error.clone(),
        }
    }

    fn acquire_probe(&self) -> Admission {
        match self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Admission::Probe,
            Err(_) => Admission::Rejected,
        }
    }

    /// Move `from` → OPEN and restart the cooldown; false if another caller got there first
    fn trip(&self, from: CircuitState) -> bool {
        let tripped = self
            .state
            .compare_exchange(
                from as u8,
                CircuitState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if tripped {
            self.opened_at_ms.store(self.elapsed_ms(), Ordering::Release);
            self.on_transition(from, CircuitState::Open);
        }
        tripped
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let cooldown_ms = u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms().saturating_sub(opened_at) >= cooldown_ms
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn on_transition(&self, from: CircuitState, to: CircuitState) {
        tracing::info!(
            target: "embedline.health",
            provider = %self.provider,
            from = %from,
            to = %to,
            "circuit breaker transition"
        );
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(TelemetryEvent::BreakerTransition {
                provider: self.provider.clone(),
                from,
                to,
                timestamp: Instant::now(),
            });
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.snapshot()) {
            tracing::warn!(
                target: "embedline.health",
                provider = %self.provider,
                error = %e,
                "failed to persist provider health"
            );
        }
    }

    fn lock_details(&self) -> MutexGuard<'_, HealthDetails> {
        self.details
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ProviderHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHealthMonitor")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Embedding;
    use crate::storage::Database;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingProvider {
        checks: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, _text: &str) -> Result<Embedding, ProviderError> {
            Err(ProviderError::Permanent("not used".to_string()))
        }

        async fn health_check(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn transient() -> ProviderError {
        ProviderError::Transient("connection refused".to_string())
    }

    fn monitor(threshold: u32, cooldown: Duration) -> ProviderHealthMonitor {
        ProviderHealthMonitor::new(
            "ollama",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = monitor(3, Duration::from_secs(60));
        breaker.record_failure(&transient());
        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);

        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
        assert!(!breaker.allows_requests());

        let snapshot = breaker.snapshot();
        assert!(!snapshot.is_available);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = monitor(3, Duration::from_secs(60));
        breaker.record_failure(&transient());
        breaker.record_failure(&transient());
        breaker.record_success();
        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[test]
    fn test_permanent_error_counts_as_reachable() {
        let breaker = monitor(1, Duration::from_secs(60));
        breaker.record_failure(&ProviderError::Permanent("bad input".to_string()));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = monitor(1, Duration::ZERO);
        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Open);

        assert_eq!(breaker.try_acquire(), Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
        assert!(!breaker.allows_requests());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn test_late_success_does_not_close_open_breaker() {
        let breaker = monitor(1, Duration::from_secs(60));
        breaker.record_failure(&transient());
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
        assert!(breaker.snapshot().last_success_at.is_some());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = monitor(1, Duration::from_millis(0));
        breaker.record_failure(&transient());
        assert_eq!(breaker.try_acquire(), Admission::Probe);

        breaker.record_failure(&transient());
        assert_eq!(breaker.state(), CircuitState::Open);
        // Zero cooldown: the next caller may probe again
        assert_eq!(breaker.try_acquire(), Admission::Probe);
    }

    #[test]
    fn test_released_probe_can_be_retaken() {
        let breaker = monitor(1, Duration::ZERO);
        breaker.record_failure(&transient());
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        breaker.release_probe();
        assert_eq!(breaker.try_acquire(), Admission::Probe);
    }

    #[test]
    fn test_concurrent_probe_acquisition() {
        let breaker = Arc::new(monitor(1, Duration::ZERO));
        breaker.record_failure(&transient());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || breaker.try_acquire())
            })
            .collect();
        let probes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Admission::Probe)
            .count();
        assert_eq!(probes, 1);
    }

    #[tokio::test]
    async fn test_health_check_waits_for_cooldown() {
        let breaker = monitor(1, Duration::from_secs(600));
        let provider = CountingProvider::default();
        breaker.record_failure(&transient());

        assert_eq!(breaker.check_health(&provider).await, None);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(provider.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_check_is_the_half_open_probe() {
        let breaker = monitor(1, Duration::ZERO);
        let provider = CountingProvider::default();
        breaker.record_failure(&transient());

        assert_eq!(breaker.check_health(&provider).await, Some(true));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(provider.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_check_skipped_while_probe_in_flight() {
        let breaker = monitor(1, Duration::ZERO);
        let provider = CountingProvider::default();
        breaker.record_failure(&transient());
        // A worker holds the probe slot
        assert_eq!(breaker.try_acquire(), Admission::Probe);

        assert_eq!(breaker.check_health(&provider).await, None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(provider.checks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transitions_recorded_in_telemetry() {
        let telemetry = TelemetryCollector::new();
        let breaker = monitor(1, Duration::ZERO).with_telemetry(telemetry.clone());
        breaker.record_failure(&transient());
        breaker.try_acquire();
        breaker.record_success();

        assert_eq!(telemetry.get_stats().breaker_trips, 1);
        assert_eq!(telemetry.event_count(), 3);
    }

    #[test]
    fn test_persisted_and_restored() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        };

        let breaker =
            ProviderHealthMonitor::restore("ollama", config.clone(), HealthStore::new(db.clone()));
        breaker.record_failure(&transient());
        breaker.record_failure(&transient());

        let saved = HealthStore::new(db.clone()).load("ollama").unwrap().unwrap();
        assert_eq!(saved.circuit_state, CircuitState::Open);
        assert!(!saved.is_available);

        let restored = ProviderHealthMonitor::restore("ollama", config, HealthStore::new(db));
        assert_eq!(restored.state(), CircuitState::Open);
        assert_eq!(restored.consecutive_failures(), 2);
        assert_eq!(restored.try_acquire(), Admission::Rejected);
    }
}
