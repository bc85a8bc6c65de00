//! `provider_health` persistence, one row per provider, last write wins

use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::errors::Result;
use crate::health::{CircuitState, ProviderHealth};
use crate::storage::{from_millis, to_millis, Database};

#[derive(Clone)]
pub struct HealthStore {
    db: Arc<Database>,
}

impl HealthStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn save(&self, health: &ProviderHealth) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO provider_health \
                 (provider, is_available, consecutive_failures, circuit_state, \
                  last_checked_at, last_success_at, last_error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (provider) DO UPDATE SET \
                     is_available = excluded.is_available, \
                     consecutive_failures = excluded.consecutive_failures, \
                     circuit_state = excluded.circuit_state, \
                     last_checked_at = excluded.last_checked_at, \
                     last_success_at = excluded.last_success_at, \
                     last_error = excluded.last_error",
                params![
                    health.provider,
                    health.is_available,
                    health.consecutive_failures,
                    health.circuit_state.as_str(),
                    health.last_checked_at.map(to_millis),
                    health.last_success_at.map(to_millis),
                    health.last_error
                ],
            )?;
            Ok(())
        })
    }

    pub fn load(&self, provider: &str) -> Result<Option<ProviderHealth>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT provider, is_available, consecutive_failures, circuit_state, \
                            last_checked_at, last_success_at, last_error \
                     FROM provider_health WHERE provider = ?1",
                    params![provider],
                    |row| {
                        let state: String = row.get(3)?;
                        Ok(ProviderHealth {
                            provider: row.get(0)?,
                            is_available: row.get(1)?,
                            consecutive_failures: row.get(2)?,
                            circuit_state: CircuitState::parse(&state)
                                .unwrap_or(CircuitState::Closed),
                            last_checked_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
                            last_success_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
                            last_error: row.get(6)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_save_and_load_last_write_wins() {
        let store = HealthStore::new(Arc::new(Database::open_in_memory().unwrap()));
        assert!(store.load("ollama").unwrap().is_none());

        let mut health = ProviderHealth {
            provider: "ollama".to_string(),
            is_available: false,
            consecutive_failures: 5,
            circuit_state: CircuitState::Open,
            last_checked_at: Utc.timestamp_millis_opt(1_700_000_000_000).single(),
            last_success_at: None,
            last_error: Some("connection refused".to_string()),
        };
        store.save(&health).unwrap();
        assert_eq!(store.load("ollama").unwrap(), Some(health.clone()));

        health.is_available = true;
        health.consecutive_failures = 0;
        health.circuit_state = CircuitState::Closed;
        health.last_error = None;
        store.save(&health).unwrap();
        assert_eq!(store.load("ollama").unwrap(), Some(health));
    }
}
