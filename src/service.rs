//! Public facade over the job store, embedding store and hybrid search,
//! plus [`Pipeline`], which wires every component from a [`Config`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::embeddings::{EmbeddingChunk, EmbeddingStore};
use crate::errors::Result;
use crate::health::{HealthStore, ProviderHealth, ProviderHealthMonitor};
use crate::jobs::{EnqueueOutcome, Job, JobStats, JobStore};
use crate::provider::{EmbeddingProvider, NoOpProvider, OllamaProvider};
use crate::search::{ChunkTextKeywordRanker, HybridMerger, HybridSearch, SearchHit, SemanticRanker};
use crate::source::{ChunkSource, FileChunkSource};
use crate::storage::Database;
use crate::telemetry::TelemetryCollector;
use crate::worker::{CrashRecovery, JobProcessor, PoolConfig, WorkerPool};

/// Queue and index overview
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub jobs: JobStats,
    /// PENDING plus due RETRY_PENDING
    pub eligible: u64,
    pub chunks: u64,
}

pub struct EmbeddingService {
    jobs: Arc<JobStore>,
    embeddings: Arc<EmbeddingStore>,
    search: HybridSearch,
    provider: Arc<dyn EmbeddingProvider>,
    monitor: Arc<ProviderHealthMonitor>,
    recovery: CrashRecovery,
    telemetry: TelemetryCollector,
    min_similarity: f64,
}

impl EmbeddingService {
    /// Queue an entity for embedding. Idempotent while a job is live.
    pub fn enqueue(&self, entity_type: &str, entity_id: i64, priority: i32) -> Result<EnqueueOutcome> {
        self.jobs.enqueue(entity_type, entity_id, priority)
    }

    /// Cancel every live job of `entity_type`
    pub fn cancel_pending(&self, entity_type: &str) -> Result<usize> {
        self.jobs.cancel(entity_type)
    }

    /// Cancel one job; false when it had already finished
    pub fn cancel_job(&self, job_id: i64) -> Result<bool> {
        self.jobs.cancel_job(job_id)
    }

    pub fn get_status(&self, job_id: i64) -> Result<Job> {
        self.jobs.get(job_id)
    }

    /// Every job ever created for the entity, newest first
    pub fn history(&self, entity_type: &str, entity_id: i64) -> Result<Vec<Job>> {
        self.jobs.history_for(entity_type, entity_id)
    }

    pub fn stats(&self) -> Result<PipelineStats> {
        Ok(PipelineStats {
            jobs: self.jobs.stats()?,
            eligible: self.jobs.count_eligible(Utc::now())?,
            chunks: self.embeddings.count_chunks(None)?,
        })
    }

    /// Hybrid keyword + semantic search; `min_similarity` defaults to the
    /// configured threshold
    pub async fn search(
        &self,
        query: &str,
        entity_type: &str,
        limit: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<SearchHit>> {
        self.search
            .search(
                query,
                entity_type,
                limit,
                min_similarity.unwrap_or(self.min_similarity),
            )
            .await
    }

    pub fn chunks_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<EmbeddingChunk>> {
        self.embeddings.chunks_for(entity_type, entity_id)
    }

    pub fn delete_embeddings(&self, entity_type: &str, entity_id: i64) -> Result<usize> {
        self.embeddings.delete_entity(entity_type, entity_id)
    }

    /// Delete terminal jobs last updated before `older_than`
    pub fn purge_jobs(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.jobs.purge_terminal(older_than)
    }

    pub fn reclaim_orphans(&self) -> Result<usize> {
        self.recovery.reclaim_orphans()
    }

    pub fn provider_health(&self) -> ProviderHealth {
        self.monitor.snapshot()
    }

    /// Run the provider health check now if the breaker admits it, and
    /// feed the result to the breaker. An OPEN breaker still cooling down
    /// is reported as is.
    pub async fn check_provider(&self) -> ProviderHealth {
        if self.monitor.check_health(self.provider.as_ref()).await.is_none() {
            tracing::debug!(
                target: "embedline.health",
                provider = self.monitor.provider(),
                state = %self.monitor.state(),
                "health check skipped; breaker refused the call"
            );
        }
        self.monitor.snapshot()
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }
}

/// Every component of a running pipeline, built from one configuration
pub struct Pipeline {
    service: Arc<EmbeddingService>,
    processor: Arc<JobProcessor>,
    recovery: CrashRecovery,
    pool_config: PoolConfig,
}

impl Pipeline {
    /// Open the configured database and connect the configured provider
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.storage.database)?);

        let provider: Arc<dyn EmbeddingProvider> = if config.ollama.enabled {
            Arc::new(OllamaProvider::new(&config.ollama)?)
        } else {
            tracing::warn!(
                target: "embedline.provider",
                "no embedding provider enabled; jobs will fail and search is keyword-only"
            );
            Arc::new(NoOpProvider)
        };
        let source: Arc<dyn ChunkSource> = Arc::new(FileChunkSource::new(config.source.root.clone()));

        Ok(Self::build(db, config, provider, source))
    }

    /// Wire the pipeline around explicit collaborators
    pub fn build(
        db: Arc<Database>,
        config: &Config,
        provider: Arc<dyn EmbeddingProvider>,
        source: Arc<dyn ChunkSource>,
    ) -> Self {
        let telemetry = TelemetryCollector::new();
        let monitor = Arc::new(
            ProviderHealthMonitor::restore(
                provider.name(),
                config.breaker_config(),
                HealthStore::new(db.clone()),
            )
            .with_telemetry(telemetry.clone()),
        );

        let jobs = Arc::new(JobStore::new(db.clone(), config.retry.max_attempts));
        let embeddings = Arc::new(EmbeddingStore::new(db));

        let semantic = config.hybrid.enabled.then(|| {
            SemanticRanker::new(provider.clone(), monitor.clone(), embeddings.clone())
        });
        let search = HybridSearch::new(
            Arc::new(ChunkTextKeywordRanker::new(embeddings.clone())),
            semantic,
            HybridMerger::new(config.fusion_config()),
        );

        let recovery = CrashRecovery::new(jobs.clone(), telemetry.clone());
        let processor = Arc::new(JobProcessor::new(
            jobs.clone(),
            source,
            provider.clone(),
            monitor.clone(),
            config.retry_policy(),
            telemetry.clone(),
        ));

        let service = Arc::new(EmbeddingService {
            jobs,
            embeddings,
            search,
            provider,
            monitor,
            recovery: recovery.clone(),
            telemetry,
            min_similarity: config.hybrid.min_similarity,
        });

        Self {
            service,
            processor,
            recovery,
            pool_config: PoolConfig::from_config(config),
        }
    }

    pub fn service(&self) -> &Arc<EmbeddingService> {
        &self.service
    }

    pub fn processor(&self) -> &Arc<JobProcessor> {
        &self.processor
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    /// A pool using the configured pool settings
    pub fn worker_pool(&self) -> WorkerPool {
        self.worker_pool_with(self.pool_config.clone())
    }

    pub fn worker_pool_with(&self, config: PoolConfig) -> WorkerPool {
        WorkerPool::new(self.processor.clone(), self.recovery.clone(), config)
    }
}
