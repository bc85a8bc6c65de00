//! Job processing: the per-job step, the worker pool and crash recovery

pub mod pool;
pub mod processor;
pub mod recovery;

pub use pool::{PoolConfig, RunningPool, WorkerPool};
pub use processor::{JobOutcome, JobProcessor, WorkOutcome};
pub use recovery::{CrashRecovery, SweepReport};
