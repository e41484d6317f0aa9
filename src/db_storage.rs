use crate::circuit_breaker::{create_state_store_circuit_breaker, StateStoreBreaker};
use crate::errors::ResilienceError;
use crate::state_store::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use failsafe::futures::CircuitBreaker;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Postgres-backed state store shared by every process serving requests.
///
/// Rows live in `resilience_state`; expired rows are ignored on read and
/// removed by [`PgStateStore::purge_expired`], which runs each time the
/// store is opened through [`crate::state_store::from_config`].
pub struct PgStateStore {
    pool: PgPool,
    breaker: StateStoreBreaker,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            breaker: create_state_store_circuit_breaker(),
        }
    }

    /// Deletes rows whose TTL has passed. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, ResilienceError> {
        let pool = self.pool.clone();
        let result = self
            .breaker
            .call(async move {
                sqlx::query("DELETE FROM resilience_state WHERE expires_at <= NOW()")
                    .execute(&pool)
                    .await
            })
            .await
            .map_err(breaker_error)?;

        Ok(result.rows_affected())
    }
}

fn breaker_error(err: failsafe::Error<sqlx::Error>) -> ResilienceError {
    match err {
        failsafe::Error::Inner(e) => {
            tracing::error!("State store query failed: {:?}", e);
            ResilienceError::from(e)
        }
        failsafe::Error::Rejected => {
            ResilienceError::StateStore("state store circuit open".to_string())
        }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ResilienceError> {
        let pool = self.pool.clone();
        let key = key.to_string();
        let row = self
            .breaker
            .call(async move {
                sqlx::query(
                    "SELECT value FROM resilience_state WHERE key = $1 AND expires_at > NOW()",
                )
                .bind(key)
                .fetch_optional(&pool)
                .await
            })
            .await
            .map_err(breaker_error)?;

        let value = row
            .map(|row| row.try_get::<Vec<u8>, _>("value"))
            .transpose()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), ResilienceError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let pool = self.pool.clone();
        let key = key.to_string();

        self.breaker
            .call(async move {
                sqlx::query(
                    r#"
                    INSERT INTO resilience_state (key, value, expires_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (key) DO UPDATE
                    SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .execute(&pool)
                .await
            })
            .await
            .map_err(breaker_error)?;

        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
