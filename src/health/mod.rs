//! Provider health tracking and the circuit breaker that gates workers

pub mod monitor;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use monitor::ProviderHealthMonitor;
pub use store::HealthStore;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CircuitState {
    /// Calls proceed
    Closed = 0,
    /// Calls short-circuited until the cooldown passes
    Open = 1,
    /// A single probe call is allowed
    HalfOpen = 2,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLOSED" => Some(CircuitState::Closed),
            "OPEN" => Some(CircuitState::Open),
            "HALF_OPEN" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive transient failures that trip CLOSED → OPEN
    pub failure_threshold: u32,
    /// Time spent OPEN before a probe is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Answer to "may I call the provider now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed
    Allowed,
    /// Breaker half-open and this caller holds the single probe slot.
    /// The outcome must be recorded, or the slot returned with
    /// [`ProviderHealthMonitor::release_probe`].
    Probe,
    /// Breaker open, or another probe is in flight
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Point-in-time view of a provider's health, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub is_available: bool,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
