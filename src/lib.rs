//! embedline - background embedding jobs and hybrid retrieval
//!
//! Entities are queued as jobs in SQLite, claimed by a pool of workers under
//! time-boxed leases, embedded through a provider gated by a circuit breaker,
//! and stored as per-chunk vectors. Search fuses a keyword ranking with a
//! semantic ranking using Reciprocal Rank Fusion.
//!
//! # Architecture
//!
//! - [`jobs`]: job state machine, backoff policy and the SQLite job store
//! - [`worker`]: claim/process step, worker pool and crash recovery
//! - [`health`]: provider circuit breaker and its persisted snapshot
//! - [`embeddings`]: chunk vector storage and cosine search
//! - [`search`]: keyword and semantic rankers, RRF fusion
//! - [`service`]: the public facade and component wiring

pub mod errors;
pub mod config;
pub mod storage;

pub mod jobs;
pub mod embeddings;
pub mod provider;
pub mod health;
pub mod source;
pub mod search;
pub mod worker;

pub mod telemetry;
pub mod service;
pub mod cli;

// Re-export commonly used types
pub use errors::{EmbedError, ProviderError, Result};
pub use jobs::{Job, JobStatus, JobStore};
pub use search::{rrf_merge, FusionConfig, HybridMerger, SearchHit};
pub use service::{EmbeddingService, Pipeline};
