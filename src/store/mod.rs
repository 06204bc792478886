//! Swap store - append-only, crash-durable transition log per swap
//!
//! Every committed transition is one record holding the full swap as it
//! was after the transition. Records are never overwritten; the last one is
//! the state a restarted engine resumes from.

mod file;
mod postgres;

pub use file::FileSwapStore;
pub use postgres::PgSwapStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::SwapResult;
use crate::swap::{Swap, SwapState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One committed transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub swap_id: Uuid,
    pub sequence: u64,
    pub state: SwapState,
    pub swap: Swap,
    pub recorded_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn of(swap: &Swap) -> Self {
        Self {
            swap_id: swap.uuid,
            sequence: swap.sequence,
            state: swap.state,
            swap: swap.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// Durable, ordered transition log
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Append a transition; its sequence must follow the last one (0 for a new swap)
    async fn append(&self, swap_id: Uuid, record: &TransitionRecord) -> SwapResult<()>;

    /// Swap as of its last committed transition
    async fn resume(&self, swap_id: Uuid) -> SwapResult<Option<Swap>>;

    async fn history(&self, swap_id: Uuid) -> SwapResult<Vec<TransitionRecord>>;

    /// Swaps whose last committed state is not terminal
    async fn unfinished(&self) -> SwapResult<Vec<Uuid>>;

    async fn health_check(&self) -> SwapResult<()>;
}

/// Open the configured store backend
pub async fn open(config: &StoreConfig) -> SwapResult<Arc<dyn SwapStore>> {
    match config.backend {
        StoreBackend::File => {
            let store = FileSwapStore::open(&config.path).await?;
            info!("Using file swap store at {}", config.path);
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => {
            let store = PgSwapStore::new(config).await?;
            store.run_migrations().await?;
            info!("Using PostgreSQL swap store");
            Ok(Arc::new(store))
        }
    }
}
