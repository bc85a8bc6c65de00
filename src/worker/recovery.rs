//! Crash recovery and the periodic lease sweeper
//!
//! Leases expire independently of which process took them, so recovery may
//! run from any instance and running it twice is a no-op.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::Result;
use crate::jobs::JobStore;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// IN_PROGRESS jobs with an expired lease reset to PENDING
    pub reclaimed: usize,
    /// Due RETRY_PENDING jobs moved to PENDING
    pub promoted: usize,
}

#[derive(Clone)]
pub struct CrashRecovery {
    store: Arc<JobStore>,
    telemetry: TelemetryCollector,
}

impl CrashRecovery {
    pub fn new(store: Arc<JobStore>, telemetry: TelemetryCollector) -> Self {
        Self { store, telemetry }
    }

    /// Reclaim orphaned jobs; run before any worker starts claiming
    pub fn run_startup(&self) -> Result<usize> {
        let reclaimed = self.reclaim_orphans()?;
        tracing::info!(
            target: "embedline.recovery",
            reclaimed,
            "startup recovery finished"
        );
        Ok(reclaimed)
    }

    /// One sweeper pass
    pub fn sweep(&self) -> Result<SweepReport> {
        let reclaimed = self.reclaim_orphans()?;
        let promoted = self.store.promote_due_retries(Utc::now())?;

        if promoted > 0 {
            tracing::debug!(
                target: "embedline.recovery",
                promoted,
                "promoted due retries"
            );
        }
        Ok(SweepReport {
            reclaimed,
            promoted,
        })
    }

    /// Reset IN_PROGRESS jobs whose lease has expired
    pub fn reclaim_orphans(&self) -> Result<usize> {
        let reclaimed = self.store.reclaim_orphans(Utc::now())?;
        if reclaimed > 0 {
            self.telemetry.record(TelemetryEvent::OrphansReclaimed {
                count: reclaimed,
                timestamp: Instant::now(),
            });
        }
        Ok(reclaimed)
    }
}
