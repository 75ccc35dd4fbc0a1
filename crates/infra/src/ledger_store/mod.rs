//! Append-only inventory ledger boundary.
//!
//! The ledger is the only writer-facing surface for stock: balances are
//! always derived from it (see `stock_projector`).

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{Clock, InMemoryLedgerStore};
pub use postgres::{MaterializedBalance, PostgresLedgerStore};
pub use r#trait::{stock_fold_guard, AppendGuard, LedgerStore, LedgerStoreError};

use std::sync::Arc;

use tracing::info;

use crate::config::DatabaseConfig;

/// Pick the ledger backend: Postgres when a URL is configured, else in-memory.
pub async fn from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn LedgerStore>, LedgerStoreError> {
    match &config.url {
        Some(url) => {
            let store = PostgresLedgerStore::connect(url, config.max_connections).await?;
            info!(max_connections = config.max_connections, "using postgres ledger");
            Ok(Arc::new(store))
        }
        None => {
            info!("no database configured; using in-memory ledger");
            Ok(Arc::new(InMemoryLedgerStore::new()))
        }
    }
}
