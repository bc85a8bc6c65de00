//! Fixed-size worker pool plus the sweeper and health-probe tasks
//!
//! Every task watches one shutdown channel. A worker checks it only between
//! steps, so a job in flight is finished (or left to its lease) before the
//! task exits.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::Result;
use crate::health::CircuitState;
use crate::worker::processor::{JobProcessor, WorkOutcome};
use crate::worker::recovery::CrashRecovery;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,
    pub health_check_interval: Duration,
    pub worker_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            size: config.worker.pool_size.max(1),
            lease: config.lease_duration(),
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            reclaim_interval: Duration::from_millis(config.worker.reclaim_interval_ms),
            health_check_interval: Duration::from_millis(config.breaker.health_check_interval_ms),
            worker_prefix: config.worker.worker_prefix.clone(),
        }
    }
}

pub struct WorkerPool {
    processor: Arc<JobProcessor>,
    recovery: CrashRecovery,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(processor: Arc<JobProcessor>, recovery: CrashRecovery, config: PoolConfig) -> Self {
        Self {
            processor,
            recovery,
            config,
        }
    }

    /// Reclaim orphans, then spawn the workers and background tasks
    pub async fn start(self) -> Result<RunningPool> {
        self.recovery.run_startup()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.config.size + 2);
        let mut worker_ids = Vec::with_capacity(self.config.size);

        for index in 0..self.config.size {
            let worker_id = format!("{}-{}-{}", self.config.worker_prefix, index, Uuid::new_v4());
            worker_ids.push(worker_id.clone());
            handles.push(tokio::spawn(worker_loop(
                self.processor.clone(),
                worker_id,
                self.config.lease,
                self.config.poll_interval,
                shutdown_rx.clone(),
            )));
        }

        handles.push(tokio::spawn(sweeper_loop(
            self.recovery.clone(),
            self.config.reclaim_interval,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(health_probe_loop(
            self.processor.clone(),
            self.config.health_check_interval,
            shutdown_rx,
        )));

        tracing::info!(
            target: "embedline.worker",
            workers = self.config.size,
            lease_ms = self.config.lease.as_millis() as u64,
            "worker pool started"
        );

        Ok(RunningPool {
            shutdown: shutdown_tx,
            handles,
            worker_ids,
        })
    }
}

/// Handle to a started pool
pub struct RunningPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
}

impl RunningPool {
    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Signal every task and wait for them to finish their current step
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(target: "embedline.worker", error = %e, "pool task ended abnormally");
            }
        }
        tracing::info!(target: "embedline.worker", "worker pool stopped");
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
/// Returns true when the caller should stop.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn worker_loop(
    processor: Arc<JobProcessor>,
    worker_id: String,
    lease: Duration,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(target: "embedline.worker", worker_id = %worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match processor.work_once(&worker_id, lease).await {
            Ok(WorkOutcome::Processed { job_id, outcome }) => {
                tracing::debug!(
                    target: "embedline.worker",
                    worker_id = %worker_id,
                    job_id,
                    outcome = ?outcome,
                    "worker step finished"
                );
                false
            }
            Ok(WorkOutcome::Idle) | Ok(WorkOutcome::Throttled) => true,
            Err(e) => {
                tracing::warn!(
                    target: "embedline.worker",
                    worker_id = %worker_id,
                    error = %e,
                    "claim failed"
                );
                true
            }
        };

        if idle && wait_or_shutdown(&mut shutdown, poll_interval).await {
            break;
        }
    }

    tracing::debug!(target: "embedline.worker", worker_id = %worker_id, "worker stopped");
}

async fn sweeper_loop(
    recovery: CrashRecovery,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !wait_or_shutdown(&mut shutdown, interval).await {
        if let Err(e) = recovery.sweep() {
            tracing::warn!(target: "embedline.recovery", error = %e, "sweep failed");
        }
    }
}

async fn health_probe_loop(
    processor: Arc<JobProcessor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !wait_or_shutdown(&mut shutdown, interval).await {
        let monitor = processor.monitor();
        if monitor.state() == CircuitState::Closed {
            continue;
        }

        // Waits out the cooldown and never races a worker's probe
        let Some(healthy) = monitor.check_health(processor.provider().as_ref()).await else {
            continue;
        };
        tracing::debug!(
            target: "embedline.health",
            provider = monitor.provider(),
            healthy,
            "background health check"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::health::{BreakerConfig, ProviderHealthMonitor};
    use crate::jobs::{JobStatus, JobStore, RetryPolicy};
    use crate::provider::{Embedding, EmbeddingProvider};
    use crate::source::InMemoryChunkSource;
    use crate::storage::Database;
    use crate::telemetry::TelemetryCollector;
    use async_trait::async_trait;

    #[derive(Default)]
    struct UnitProvider {
        health_checks: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for UnitProvider {
        fn name(&self) -> &str {
            "unit"
        }

        async fn embed(&self, _text: &str) -> std::result::Result<Embedding, ProviderError> {
            Ok(Embedding {
                vector: vec![1.0, 0.0],
                model: "unit".to_string(),
            })
        }

        async fn health_check(&self) -> bool {
            self.health_checks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        }
    }

    struct Fixture {
        pool: WorkerPool,
        store: Arc<JobStore>,
        source: Arc<InMemoryChunkSource>,
        monitor: Arc<ProviderHealthMonitor>,
        provider: Arc<UnitProvider>,
    }

    fn test_config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            reclaim_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_millis(20),
            worker_prefix: "test-worker".to_string(),
        }
    }

    fn fixture(size: usize, cooldown: Duration) -> Fixture {
        let store = Arc::new(JobStore::new(Arc::new(Database::open_in_memory().unwrap()), 3));
        let source = Arc::new(InMemoryChunkSource::new());
        let provider = Arc::new(UnitProvider::default());
        let monitor = Arc::new(ProviderHealthMonitor::new(
            "unit",
            BreakerConfig {
                failure_threshold: 1,
                cooldown,
            },
        ));
        let telemetry = TelemetryCollector::new();
        let processor = Arc::new(JobProcessor::new(
            store.clone(),
            source.clone(),
            provider.clone(),
            monitor.clone(),
            RetryPolicy::default(),
            telemetry.clone(),
        ));
        let recovery = CrashRecovery::new(store.clone(), telemetry);
        Fixture {
            pool: WorkerPool::new(processor, recovery, test_config(size)),
            store,
            source,
            monitor,
            provider,
        }
    }

    async fn wait_for_status(store: &JobStore, job_id: i64, status: JobStatus) -> bool {
        for _ in 0..200 {
            if store.get(job_id).unwrap().status == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_pool_processes_jobs() {
        let Fixture {
            pool, store, source, ..
        } = fixture(3, Duration::from_secs(600));
        let mut ids = Vec::new();
        for entity_id in 1..=5 {
            source.insert("DOC", entity_id, ["some text"]);
            ids.push(store.enqueue("DOC", entity_id, 1).unwrap().job_id);
        }

        let running = pool.start().await.unwrap();
        for id in ids {
            assert!(wait_for_status(&store, id, JobStatus::Completed).await);
        }
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_ids_are_unique_and_prefixed() {
        let running = fixture(4, Duration::from_secs(600)).pool.start().await.unwrap();

        let ids = running.worker_ids().to_vec();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|id| id.starts_with("test-worker-")));
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 4);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_breaker_stays_open_during_cooldown() {
        let Fixture {
            pool,
            monitor,
            provider,
            ..
        } = fixture(1, Duration::from_secs(600));
        monitor.record_failure(&ProviderError::Transient("down".to_string()));
        assert_eq!(monitor.state(), CircuitState::Open);

        let running = pool.start().await.unwrap();
        // Many health intervals pass, none of them past the cooldown
        tokio::time::sleep(Duration::from_millis(300)).await;
        running.shutdown().await;

        assert_eq!(monitor.state(), CircuitState::Open);
        assert_eq!(
            provider
                .health_checks
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_health_check_closes_breaker_after_cooldown() {
        let Fixture {
            pool,
            monitor,
            provider,
            ..
        } = fixture(1, Duration::from_millis(50));
        monitor.record_failure(&ProviderError::Transient("down".to_string()));
        assert_eq!(monitor.state(), CircuitState::Open);

        let running = pool.start().await.unwrap();
        for _ in 0..200 {
            if monitor.state() == CircuitState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        running.shutdown().await;

        assert_eq!(monitor.state(), CircuitState::Closed);
        assert!(
            provider
                .health_checks
                .load(std::sync::atomic::Ordering::SeqCst)
                >= 1
        );
    }

    #[tokio::test]
    async fn test_wait_or_shutdown_wakes_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_or_shutdown(&mut rx, Duration::from_secs(60)).await });
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }
}
