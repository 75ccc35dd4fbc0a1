use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use fleetshop_core::TransactionId;
use fleetshop_inventory::{InventoryTransaction, NewTransaction, StockKey};

use super::r#trait::{AppendGuard, LedgerStore, LedgerStoreError};

/// Source of `created_at` stamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

type KeySection = Arc<Mutex<Vec<InventoryTransaction>>>;

/// In-memory append-only ledger.
///
/// Each key owns an async mutex around its history; appends to different keys
/// never contend. Sequence numbers come from one store-wide counter, drawn
/// inside the key's section so they increase in append order per key.
pub struct InMemoryLedgerStore {
    sections: RwLock<BTreeMap<StockKey, KeySection>>,
    index: RwLock<HashMap<TransactionId, StockKey>>,
    sequence: AtomicU64,
    clock: Clock,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }
}

impl core::fmt::Debug for InMemoryLedgerStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryLedgerStore")
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store stamping `created_at` from `clock` (tests use a skewed clock).
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            sections: RwLock::new(BTreeMap::new()),
            index: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            clock,
        }
    }

    fn section(&self, key: StockKey) -> Result<KeySection, LedgerStoreError> {
        if let Some(section) = self.read_sections()?.get(&key) {
            return Ok(section.clone());
        }
        let mut sections = self
            .sections
            .write()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(sections.entry(key).or_default().clone())
    }

    fn existing_section(&self, key: StockKey) -> Result<Option<KeySection>, LedgerStoreError> {
        Ok(self.read_sections()?.get(&key).cloned())
    }

    fn read_sections(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<StockKey, KeySection>>, LedgerStoreError> {
        self.sections
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    #[instrument(
        skip(self, tx, guard),
        fields(key = %tx.key, kind = %tx.transaction_type, delta = tx.quantity_delta),
        err
    )]
    async fn append_guarded(
        &self,
        tx: NewTransaction,
        guard: AppendGuard<'_>,
    ) -> Result<InventoryTransaction, LedgerStoreError> {
        let key = tx.key;
        let section = self.section(key)?;
        let mut history = section.lock().await;

        guard(&history, &tx)?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let now = (self.clock)();
        let created_at = history
            .last()
            .map_or(now, |last| last.created_at.max(now));

        let committed = InventoryTransaction::commit(tx, TransactionId::new(), sequence, created_at);
        self.index
            .write()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?
            .insert(committed.id, key);
        history.push(committed.clone());

        debug!(id = %committed.id, sequence, "ledger append");
        Ok(committed)
    }

    async fn list_by_key(
        &self,
        key: StockKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        let Some(section) = self.existing_section(key)? else {
            return Ok(Vec::new());
        };
        let history = section.lock().await;
        Ok(history
            .iter()
            .filter(|t| as_of.is_none_or(|cut| t.created_at <= cut))
            .cloned()
            .collect())
    }

    async fn list_after(
        &self,
        key: StockKey,
        sequence: Option<u64>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        let Some(section) = self.existing_section(key)? else {
            return Ok(Vec::new());
        };
        let history = section.lock().await;
        let start = match sequence {
            Some(seq) => history.partition_point(|t| t.sequence <= seq),
            None => 0,
        };
        Ok(history[start..].to_vec())
    }

    async fn keys(&self) -> Result<Vec<StockKey>, LedgerStoreError> {
        let sections: Vec<(StockKey, KeySection)> = self
            .read_sections()?
            .iter()
            .map(|(k, s)| (*k, s.clone()))
            .collect();

        let mut keys = Vec::with_capacity(sections.len());
        for (key, section) in sections {
            if !section.lock().await.is_empty() {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn get(&self, id: TransactionId) -> Result<InventoryTransaction, LedgerStoreError> {
        let key = self
            .index
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?
            .get(&id)
            .copied()
            .ok_or(LedgerStoreError::NotFound(id))?;

        let section = self
            .existing_section(key)?
            .ok_or(LedgerStoreError::NotFound(id))?;
        let history = section.lock().await;
        history
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(LedgerStoreError::NotFound(id))
    }
}
