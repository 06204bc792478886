//! PostgreSQL swap store

use super::{SwapStore, TransitionRecord};
use crate::config::StoreConfig;
use crate::error::{SwapError, SwapResult};
use crate::swap::Swap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Insert-only transition table keyed by (swap_id, sequence)
pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    /// Connect to the configured database
    pub async fn new(config: &StoreConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create the transition table if missing
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_transitions (
                swap_id UUID NOT NULL,
                sequence BIGINT NOT NULL,
                state VARCHAR(64) NOT NULL,
                record JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (swap_id, sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transitions_recorded
            ON swap_transitions (recorded_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Swap store migrations complete");
        Ok(())
    }
}

#[async_trait]
impl SwapStore for PgSwapStore {
    async fn append(&self, swap_id: Uuid, record: &TransitionRecord) -> SwapResult<()> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM swap_transitions WHERE swap_id = $1")
                .bind(swap_id)
                .fetch_one(&self.pool)
                .await?;

        let expected = last.map_or(0, |s| s as u64 + 1);
        if record.sequence != expected {
            return Err(SwapError::SequenceConflict {
                swap_id,
                expected,
                got: record.sequence,
            });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO swap_transitions (swap_id, sequence, state, record, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(swap_id)
        .bind(record.sequence as i64)
        .bind(record.state.name())
        .bind(Json(record))
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    "Swap {}: stored {} (sequence {})",
                    swap_id, record.state, record.sequence
                );
                Ok(())
            }
            // A concurrent writer committed the same sequence first
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(SwapError::SequenceConflict {
                    swap_id,
                    expected,
                    got: record.sequence,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resume(&self, swap_id: Uuid) -> SwapResult<Option<Swap>> {
        let row = sqlx::query(
            r#"
            SELECT record FROM swap_transitions
            WHERE swap_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(swap_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Json<TransitionRecord>, _>("record").0.swap))
    }

    async fn history(&self, swap_id: Uuid) -> SwapResult<Vec<TransitionRecord>> {
        let rows = sqlx::query(
            "SELECT record FROM swap_transitions WHERE swap_id = $1 ORDER BY sequence ASC",
        )
        .bind(swap_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<Json<TransitionRecord>, _>("record").0)
            .collect())
    }

    async fn unfinished(&self) -> SwapResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (swap_id) swap_id, record
            FROM swap_transitions
            ORDER BY swap_id, sequence DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|r| !r.get::<Json<TransitionRecord>, _>("record").0.state.is_terminal())
            .map(|r| r.get::<Uuid, _>("swap_id"))
            .collect())
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
