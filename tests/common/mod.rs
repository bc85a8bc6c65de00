//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use embedline::config::Config;
use embedline::provider::{Embedding, EmbeddingProvider};
use embedline::service::Pipeline;
use embedline::source::InMemoryChunkSource;
use embedline::storage::Database;
use embedline::worker::{PoolConfig, WorkOutcome};
use embedline::ProviderError;

pub const MODEL: &str = "scripted-embed";

/// Vocabulary mapped onto vector axes; one extra constant axis keeps
/// vectors of unrelated text non-zero
const TOPICS: [&str; 5] = ["rust", "python", "database", "search", "embedding"];

/// Deterministic topic vector for `text`
pub fn topic_vector(text: &str) -> Vec<f32> {
    let lowered = text.to_lowercase();
    let mut vector: Vec<f32> = TOPICS
        .iter()
        .map(|topic| if lowered.contains(topic) { 1.0 } else { 0.0 })
        .collect();
    vector.push(0.1);
    vector
}

/// Fake gateway driven by a queue of scripted failures.
///
/// Each call pops the next scripted outcome; once the script is exhausted
/// calls succeed, unless `fail_all` is set.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ProviderError>>,
    fail_all: AtomicBool,
    healthy: AtomicBool,
    calls: AtomicUsize,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Provider whose `embed` signals `started` then waits for `release`
    pub fn gated(started: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            gate: Some((started, release)),
            ..Self::default()
        }
    }

    pub fn push_failure(&self, error: ProviderError) {
        self.script.lock().unwrap().push_back(error);
    }

    pub fn push_transient(&self, times: usize) {
        for _ in 0..times {
            self.push_failure(ProviderError::Transient("connection reset by peer".to_string()));
        }
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("service unavailable".to_string()));
        }
        if let Some(error) = self.script.lock().unwrap().pop_front() {
            return Err(error);
        }
        if text.contains("<binary>") {
            return Err(ProviderError::Permanent("unsupported content".to_string()));
        }

        Ok(Embedding {
            vector: topic_vector(text),
            model: MODEL.to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Defaults with immediate retries so retry paths run without sleeping
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.initial_delay_ms = 0;
    config.retry.jitter = 0.0;
    config
}

pub fn fast_pool_config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        lease: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
        reclaim_interval: Duration::from_millis(25),
        health_check_interval: Duration::from_millis(25),
        worker_prefix: "it-worker".to_string(),
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub provider: Arc<ScriptedProvider>,
    pub source: Arc<InMemoryChunkSource>,
}

impl Harness {
    pub fn new(db: Arc<Database>, config: &Config, provider: ScriptedProvider) -> Self {
        let provider = Arc::new(provider);
        let source = Arc::new(InMemoryChunkSource::new());
        let pipeline = Pipeline::build(db, config, provider.clone(), source.clone());
        Self {
            pipeline,
            provider,
            source,
        }
    }

    pub fn in_memory(config: &Config) -> Self {
        Self::new(
            Arc::new(Database::open_in_memory().unwrap()),
            config,
            ScriptedProvider::new(),
        )
    }

    /// Run worker steps in this task until the queue has nothing eligible
    pub async fn drain(&self, worker_id: &str) -> Vec<WorkOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = self
                .pipeline
                .processor()
                .work_once(worker_id, Duration::from_secs(30))
                .await
                .unwrap();
            match outcome {
                WorkOutcome::Processed { .. } => outcomes.push(outcome),
                _ => {
                    outcomes.push(outcome);
                    return outcomes;
                }
            }
        }
    }
}

/// Poll `check` every 10ms for up to two seconds
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
