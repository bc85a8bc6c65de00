//! Embedding job lifecycle: states, retry policy and the durable store

pub mod backoff;
pub mod state;
pub mod store;
pub mod types;

pub use backoff::{RetryDecision, RetryPolicy};
pub use state::{JobEvent, JobStatus};
pub use store::JobStore;
pub use types::{CommitOutcome, EnqueueOutcome, Job, JobStats};
