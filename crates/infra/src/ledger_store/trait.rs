use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use fleetshop_core::TransactionId;
use fleetshop_inventory::{InventoryTransaction, LedgerError, NewTransaction, StockFold, StockKey};

/// Ledger store operation error.
///
/// `Rule` carries a ledger rule rejection decided inside the key's exclusive
/// section; the other variants are infrastructure failures. In every case
/// nothing was appended.
#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error(transparent)]
    Rule(#[from] LedgerError),

    #[error("transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Check run over a key's full ordered history right before an append.
///
/// Executed inside the key's exclusive section: no other append to the same
/// key can interleave between the check and the write.
pub type AppendGuard<'a> =
    &'a (dyn Fn(&[InventoryTransaction], &NewTransaction) -> Result<(), LedgerError> + Send + Sync);

/// The stock fold invariant as an append guard: replay the history and ask
/// the fold whether the candidate keeps `on_hand` and `reserved` non-negative.
pub fn stock_fold_guard(
    history: &[InventoryTransaction],
    candidate: &NewTransaction,
) -> Result<(), LedgerError> {
    StockFold::replay(candidate.key, history)?.check(candidate)?;
    Ok(())
}

/// Append-only inventory ledger.
///
/// Transactions are grouped by [`StockKey`]. Within a key the order is
/// `(created_at, sequence)`; stores stamp `created_at` with
/// `max(now, last created_at of the key)` so that order agrees with append
/// order. Sequence numbers are unique store-wide and increase per key.
///
/// There is no update or delete: corrections are new transactions.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomic read-then-conditionally-append for one key.
    ///
    /// Implementations must serialize this per key: the guard sees the key's
    /// complete history and the append happens only if it accepts.
    async fn append_guarded(
        &self,
        tx: NewTransaction,
        guard: AppendGuard<'_>,
    ) -> Result<InventoryTransaction, LedgerStoreError>;

    /// Ordered history of a key, optionally cut at `as_of` (inclusive).
    async fn list_by_key(
        &self,
        key: StockKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError>;

    /// Ordered suffix of a key's history strictly after `sequence`.
    async fn list_after(
        &self,
        key: StockKey,
        sequence: Option<u64>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError>;

    /// Every key with at least one transaction.
    async fn keys(&self) -> Result<Vec<StockKey>, LedgerStoreError>;

    async fn get(&self, id: TransactionId) -> Result<InventoryTransaction, LedgerStoreError>;

    /// Validate kind and sign, then append under the stock fold guard.
    async fn append(&self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerStoreError> {
        tx.validate()?;
        self.append_guarded(tx, &stock_fold_guard).await
    }
}

#[async_trait::async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn append_guarded(
        &self,
        tx: NewTransaction,
        guard: AppendGuard<'_>,
    ) -> Result<InventoryTransaction, LedgerStoreError> {
        (**self).append_guarded(tx, guard).await
    }

    async fn list_by_key(
        &self,
        key: StockKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        (**self).list_by_key(key, as_of).await
    }

    async fn list_after(
        &self,
        key: StockKey,
        sequence: Option<u64>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        (**self).list_after(key, sequence).await
    }

    async fn keys(&self) -> Result<Vec<StockKey>, LedgerStoreError> {
        (**self).keys().await
    }

    async fn get(&self, id: TransactionId) -> Result<InventoryTransaction, LedgerStoreError> {
        (**self).get(id).await
    }

    async fn append(&self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerStoreError> {
        (**self).append(tx).await
    }
}
