use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use fleetshop_core::{ItemId, LocationId, TransactionId, WorkOrderId};
use fleetshop_inventory::{
    InventoryTransaction, LedgerError, NewTransaction, StockBalance, StockFold, StockKey,
    StockSeverity, TransactionType,
};

use crate::ledger_store::{LedgerStore, LedgerStoreError};

/// Outcome of comparing the cached balance with a full replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockVerification {
    pub key: StockKey,
    pub cached: StockBalance,
    pub replayed: StockBalance,
}

impl StockVerification {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.replayed
    }
}

/// Balance of a key next to its minimum stock level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub key: StockKey,
    pub balance: StockBalance,
    pub min_level: i64,
    pub severity: StockSeverity,
}

/// Stock balances derived from the ledger.
///
/// Keeps one [`StockFold`] per key as a cache. The cache is only a hint: every
/// read first pulls the ledger suffix after the cached cursor, and `replay`
/// rebuilds a key from scratch. Writes go through the store's guarded append,
/// so the fold rules are enforced inside the key's exclusive section, not
/// against this cache.
#[derive(Debug)]
pub struct StockProjector<S> {
    store: S,
    cache: RwLock<HashMap<StockKey, StockFold>>,
    min_levels: RwLock<HashMap<StockKey, i64>>,
}

impl<S> StockProjector<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            min_levels: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current balance of a key, resynchronized incrementally.
    #[instrument(skip(self), err)]
    pub async fn balance(
        &self,
        item_id: ItemId,
        location_id: LocationId,
    ) -> Result<StockBalance, LedgerStoreError> {
        let fold = self.resync(StockKey::new(item_id, location_id)).await?;
        Ok(fold.balance())
    }

    /// Balance as of a point in time (inclusive), by full fold.
    #[instrument(skip(self), err)]
    pub async fn balance_as_of(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        as_of: DateTime<Utc>,
    ) -> Result<StockBalance, LedgerStoreError> {
        let key = StockKey::new(item_id, location_id);
        let history = self.store.list_by_key(key, Some(as_of)).await?;
        Ok(StockFold::replay(key, &history)?.balance())
    }

    /// Rebuild a key from the full ledger history and replace the cache entry.
    #[instrument(skip(self), err)]
    pub async fn replay(
        &self,
        item_id: ItemId,
        location_id: LocationId,
    ) -> Result<StockBalance, LedgerStoreError> {
        let key = StockKey::new(item_id, location_id);
        let fold = self.full_fold(key).await?;
        let balance = fold.balance();
        self.cache_write()?.insert(key, fold);
        Ok(balance)
    }

    /// Append any transaction kind under the stock fold guard.
    #[instrument(
        skip(self, tx),
        fields(key = %tx.key, kind = %tx.transaction_type, delta = tx.quantity_delta),
        err
    )]
    pub async fn record(&self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerStoreError> {
        let key = tx.key;
        let committed = self.store.append(tx).await?;
        let fold = self.resync(key).await?;
        info!(
            id = %committed.id,
            on_hand = fold.balance().on_hand,
            reserved = fold.balance().reserved,
            "inventory transaction recorded"
        );
        Ok(committed)
    }

    pub async fn receive(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        qty: i64,
        receiving_ticket_id: Uuid,
    ) -> Result<TransactionId, LedgerStoreError> {
        let tx = NewTransaction::receive(StockKey::new(item_id, location_id), qty, receiving_ticket_id);
        Ok(self.record(tx).await?.id)
    }

    pub async fn adjust(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        delta: i64,
        adjustment_id: Uuid,
    ) -> Result<TransactionId, LedgerStoreError> {
        let tx = NewTransaction::adjust(StockKey::new(item_id, location_id), delta, adjustment_id);
        Ok(self.record(tx).await?.id)
    }

    pub async fn cycle_count_adjust(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        delta: i64,
        cycle_count_id: Uuid,
    ) -> Result<TransactionId, LedgerStoreError> {
        let tx = NewTransaction::cycle_count_adjust(
            StockKey::new(item_id, location_id),
            delta,
            cycle_count_id,
        );
        Ok(self.record(tx).await?.id)
    }

    /// Hold stock for a work order. Fails with `InsufficientStock` when
    /// `on_hand < qty` at the moment of append.
    pub async fn reserve(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        qty: i64,
        work_order_id: WorkOrderId,
    ) -> Result<TransactionId, LedgerStoreError> {
        let tx = NewTransaction::reserve(StockKey::new(item_id, location_id), qty, work_order_id);
        Ok(self.record(tx).await?.id)
    }

    /// Issue stock to a work order, consuming its reservation first.
    pub async fn issue(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        qty: i64,
        work_order_id: WorkOrderId,
    ) -> Result<TransactionId, LedgerStoreError> {
        let tx = NewTransaction::issue(StockKey::new(item_id, location_id), qty, work_order_id);
        Ok(self.record(tx).await?.id)
    }

    /// Compensating RETURN of (part of) an earlier ISSUE, at the ISSUE's key.
    pub async fn return_issued(
        &self,
        issue_id: TransactionId,
        qty: i64,
    ) -> Result<TransactionId, LedgerStoreError> {
        let issue = self.store.get(issue_id).await?;
        if issue.transaction_type != TransactionType::Issue {
            return Err(LedgerError::invalid_return(format!(
                "{issue_id} is a {}, not an ISSUE",
                issue.transaction_type
            ))
            .into());
        }
        let tx = NewTransaction::return_issued(issue.key(), qty, issue_id);
        Ok(self.record(tx).await?.id)
    }

    /// Compare the incrementally maintained balance with a full replay.
    #[instrument(skip(self), err)]
    pub async fn verify(
        &self,
        item_id: ItemId,
        location_id: LocationId,
    ) -> Result<StockVerification, LedgerStoreError> {
        let key = StockKey::new(item_id, location_id);
        let cached = self.resync(key).await?;
        let replayed = self.full_fold(key).await?;

        let report = StockVerification {
            key,
            cached: cached.balance(),
            replayed: replayed.balance(),
        };
        if !report.is_consistent() {
            warn!(
                key = %key,
                cached = ?report.cached,
                replayed = ?report.replayed,
                "stock balance drift detected"
            );
        }
        Ok(report)
    }

    /// `verify` over every key in the ledger.
    pub async fn verify_all(&self) -> Result<Vec<StockVerification>, LedgerStoreError> {
        let mut reports = Vec::new();
        for key in self.store.keys().await? {
            reports.push(self.verify(key.item_id, key.location_id).await?);
        }
        Ok(reports)
    }

    /// Minimum stock level of a key. Keys without one use 0.
    pub fn set_min_stock_level(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        level: i64,
    ) -> Result<(), LedgerStoreError> {
        if level < 0 {
            return Err(LedgerError::quantity("min_stock_level cannot be negative").into());
        }
        self.min_levels
            .write()
            .map_err(|_| LedgerStoreError::Storage("min level lock poisoned".to_string()))?
            .insert(StockKey::new(item_id, location_id), level);
        Ok(())
    }

    pub async fn stock_level(
        &self,
        item_id: ItemId,
        location_id: LocationId,
    ) -> Result<StockLevel, LedgerStoreError> {
        let key = StockKey::new(item_id, location_id);
        let balance = self.resync(key).await?.balance();
        let min_level = self.min_level(key)?;
        Ok(StockLevel {
            key,
            balance,
            min_level,
            severity: balance.severity(min_level),
        })
    }

    /// Keys at a location that are out of stock or at/below their minimum,
    /// emptiest first.
    #[instrument(skip(self), err)]
    pub async fn alerts(&self, location_id: LocationId) -> Result<Vec<StockLevel>, LedgerStoreError> {
        let mut alerts = Vec::new();
        for key in self.store.keys().await? {
            if key.location_id != location_id {
                continue;
            }
            let level = self.stock_level(key.item_id, key.location_id).await?;
            if level.severity != StockSeverity::Normal {
                alerts.push(level);
            }
        }
        alerts.sort_by_key(|l| (l.balance.physical(), l.balance.on_hand));
        if !alerts.is_empty() {
            warn!(%location_id, count = alerts.len(), "stock alerts raised");
        }
        Ok(alerts)
    }

    fn min_level(&self, key: StockKey) -> Result<i64, LedgerStoreError> {
        let levels = self
            .min_levels
            .read()
            .map_err(|_| LedgerStoreError::Storage("min level lock poisoned".to_string()))?;
        Ok(levels.get(&key).copied().unwrap_or(0))
    }

    async fn full_fold(&self, key: StockKey) -> Result<StockFold, LedgerStoreError> {
        let history = self.store.list_by_key(key, None).await?;
        Ok(StockFold::replay(key, &history)?)
    }

    /// Pull the ledger suffix after the cached cursor and fold it in.
    async fn resync(&self, key: StockKey) -> Result<StockFold, LedgerStoreError> {
        let mut fold = self
            .cache_read()?
            .get(&key)
            .cloned()
            .unwrap_or_else(|| StockFold::new(key));

        let suffix = self.store.list_after(key, fold.last_sequence()).await?;
        for tx in &suffix {
            fold.apply(tx)?;
        }

        let mut cache = self.cache_write()?;
        let entry = cache.entry(key).or_insert_with(|| fold.clone());
        // A concurrent resync may already have moved further.
        if entry.last_sequence() < fold.last_sequence() {
            *entry = fold;
        }
        Ok(entry.clone())
    }

    fn cache_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<StockKey, StockFold>>, LedgerStoreError> {
        self.cache
            .read()
            .map_err(|_| LedgerStoreError::Storage("projection cache lock poisoned".to_string()))
    }

    fn cache_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<StockKey, StockFold>>, LedgerStoreError> {
        self.cache
            .write()
            .map_err(|_| LedgerStoreError::Storage("projection cache lock poisoned".to_string()))
    }
}
