//! Postgres-backed inventory ledger.
//!
//! Schema: `migrations/0001_inventory_ledger.sql`.
//!
//! ## Per-key exclusive section
//!
//! Every append runs in one database transaction that first takes
//! `pg_advisory_xact_lock(hashtext(key))`. The lock is released on commit or
//! rollback, so the guard read, the insert and the `stock_balances` upsert are
//! one atomic unit per key. Different keys hash to different locks and never
//! wait on each other (barring hash collisions, which only cost throughput).
//!
//! ## Error mapping
//!
//! | SQLx error | `LedgerStoreError` |
//! |------------|--------------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | RowNotFound on point lookup | `NotFound` |
//! | Other (network, TLS, decode) | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use fleetshop_core::{ItemId, LocationId, TransactionId, UserId};
use fleetshop_inventory::{
    InventoryTransaction, NewTransaction, ReferenceType, StockBalance, StockFold, StockKey,
    TransactionType,
};

use super::r#trait::{AppendGuard, LedgerStore, LedgerStoreError};

const SELECT_COLUMNS: &str = r#"
    sequence, id, item_id, location_id, quantity_delta, transaction_type,
    reference_type, reference_id, unit_cost, performed_by, notes, created_at
"#;

/// Row of the `stock_balances` hint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializedBalance {
    pub key: StockKey,
    pub balance: StockBalance,
    pub last_sequence: u64,
}

/// Postgres-backed append-only ledger.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Read the cached balance row of a key, if any.
    #[instrument(skip(self), fields(key = %key), err)]
    pub async fn materialized_balance(
        &self,
        key: StockKey,
    ) -> Result<Option<MaterializedBalance>, LedgerStoreError> {
        let row = sqlx::query(
            r#"
            SELECT item_id, location_id, on_hand, reserved, last_sequence
            FROM stock_balances
            WHERE item_id = $1 AND location_id = $2
            "#,
        )
        .bind(key.item_id.as_uuid())
        .bind(key.location_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("materialized_balance", e))?;

        row.map(|r| materialized_from_row(&r)).transpose()
    }

    /// Overwrite the cached balance row of a key (repair after drift).
    #[instrument(skip(self), fields(key = %hint.key), err)]
    pub async fn store_materialized_balance(
        &self,
        hint: MaterializedBalance,
    ) -> Result<(), LedgerStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        upsert_balance(&mut tx, hint).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn load_history(
        tx: &mut Transaction<'_, Postgres>,
        key: StockKey,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM inventory_transactions \
             WHERE item_id = $1 AND location_id = $2 \
             ORDER BY created_at ASC, sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(key.item_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_history", e))?;
        rows_to_transactions(rows)
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(
        skip(self, new, guard),
        fields(key = %new.key, kind = %new.transaction_type, delta = new.quantity_delta),
        err
    )]
    async fn append_guarded(
        &self,
        new: NewTransaction,
        guard: AppendGuard<'_>,
    ) -> Result<InventoryTransaction, LedgerStoreError> {
        let key = new.key;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        let history = Self::load_history(&mut tx, key).await?;

        // Returning early drops `tx`, which rolls back and releases the lock.
        guard(&history, &new)?;

        let now = Utc::now();
        let created_at = history.last().map_or(now, |last| last.created_at.max(now));
        let id = TransactionId::new();

        let row = sqlx::query(
            r#"
            INSERT INTO inventory_transactions (
                id, item_id, location_id, quantity_delta, transaction_type,
                reference_type, reference_id, unit_cost, performed_by, notes, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING sequence
            "#,
        )
        .bind(id.as_uuid())
        .bind(key.item_id.as_uuid())
        .bind(key.location_id.as_uuid())
        .bind(new.quantity_delta)
        .bind(new.transaction_type.as_str())
        .bind(new.reference_type.as_str())
        .bind(new.reference_id)
        .bind(new.unit_cost)
        .bind(new.performed_by.map(|u| *u.as_uuid()))
        .bind(new.notes.as_deref())
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?;

        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| map_sqlx_error("insert_transaction", e))?;
        let committed = InventoryTransaction::commit(new, id, sequence as u64, created_at);

        let fold = StockFold::replay(key, history.iter().chain(std::iter::once(&committed)))?;
        upsert_balance(
            &mut tx,
            MaterializedBalance {
                key,
                balance: fold.balance(),
                last_sequence: committed.sequence,
            },
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(id = %committed.id, sequence = committed.sequence, "ledger append");
        Ok(committed)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn list_by_key(
        &self,
        key: StockKey,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM inventory_transactions \
             WHERE item_id = $1 AND location_id = $2 \
               AND ($3::timestamptz IS NULL OR created_at <= $3) \
             ORDER BY created_at ASC, sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(key.item_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(as_of)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_key", e))?;
        rows_to_transactions(rows)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn list_after(
        &self,
        key: StockKey,
        sequence: Option<u64>,
    ) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM inventory_transactions \
             WHERE item_id = $1 AND location_id = $2 AND sequence > $3 \
             ORDER BY created_at ASC, sequence ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(key.item_id.as_uuid())
            .bind(key.location_id.as_uuid())
            .bind(sequence.map_or(0, |s| s as i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_after", e))?;
        rows_to_transactions(rows)
    }

    #[instrument(skip(self), err)]
    async fn keys(&self) -> Result<Vec<StockKey>, LedgerStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT item_id, location_id
            FROM inventory_transactions
            ORDER BY item_id, location_id
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("keys", e))?;

        rows.iter()
            .map(|r| {
                let item: Uuid = r.try_get("item_id").map_err(|e| map_sqlx_error("keys", e))?;
                let location: Uuid = r
                    .try_get("location_id")
                    .map_err(|e| map_sqlx_error("keys", e))?;
                Ok(StockKey::new(ItemId::from_uuid(item), LocationId::from_uuid(location)))
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = %id), err)]
    async fn get(&self, id: TransactionId) -> Result<InventoryTransaction, LedgerStoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM inventory_transactions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .ok_or(LedgerStoreError::NotFound(id))?;

        let parsed = TransactionRow::from_row(&row).map_err(|e| map_sqlx_error("get", e))?;
        parsed.try_into()
    }
}

async fn upsert_balance(
    tx: &mut Transaction<'_, Postgres>,
    hint: MaterializedBalance,
) -> Result<(), LedgerStoreError> {
    sqlx::query(
        r#"
        INSERT INTO stock_balances (item_id, location_id, on_hand, reserved, last_sequence, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        ON CONFLICT (item_id, location_id)
        DO UPDATE SET
            on_hand = EXCLUDED.on_hand,
            reserved = EXCLUDED.reserved,
            last_sequence = EXCLUDED.last_sequence,
            updated_at = NOW()
        "#,
    )
    .bind(hint.key.item_id.as_uuid())
    .bind(hint.key.location_id.as_uuid())
    .bind(hint.balance.on_hand)
    .bind(hint.balance.reserved)
    .bind(hint.last_sequence as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("upsert_balance", e))?;
    Ok(())
}

fn materialized_from_row(row: &PgRow) -> Result<MaterializedBalance, LedgerStoreError> {
    let get = |e| map_sqlx_error("materialized_balance", e);
    let item: Uuid = row.try_get("item_id").map_err(get)?;
    let location: Uuid = row.try_get("location_id").map_err(get)?;
    let on_hand: i64 = row.try_get("on_hand").map_err(get)?;
    let reserved: i64 = row.try_get("reserved").map_err(get)?;
    let last_sequence: i64 = row.try_get("last_sequence").map_err(get)?;
    Ok(MaterializedBalance {
        key: StockKey::new(ItemId::from_uuid(item), LocationId::from_uuid(location)),
        balance: StockBalance::new(on_hand, reserved),
        last_sequence: last_sequence as u64,
    })
}

fn rows_to_transactions(rows: Vec<PgRow>) -> Result<Vec<InventoryTransaction>, LedgerStoreError> {
    rows.iter()
        .map(|row| {
            TransactionRow::from_row(row)
                .map_err(|e| map_sqlx_error("decode_transaction", e))?
                .try_into()
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerStoreError {
    match err {
        sqlx::Error::Database(db_err) => LedgerStoreError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("-"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LedgerStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => LedgerStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct TransactionRow {
    sequence: i64,
    id: Uuid,
    item_id: Uuid,
    location_id: Uuid,
    quantity_delta: i64,
    transaction_type: String,
    reference_type: String,
    reference_id: Uuid,
    unit_cost: Option<Decimal>,
    performed_by: Option<Uuid>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransactionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransactionRow {
            sequence: row.try_get("sequence")?,
            id: row.try_get("id")?,
            item_id: row.try_get("item_id")?,
            location_id: row.try_get("location_id")?,
            quantity_delta: row.try_get("quantity_delta")?,
            transaction_type: row.try_get("transaction_type")?,
            reference_type: row.try_get("reference_type")?,
            reference_id: row.try_get("reference_id")?,
            unit_cost: row.try_get("unit_cost")?,
            performed_by: row.try_get("performed_by")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<TransactionRow> for InventoryTransaction {
    type Error = LedgerStoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let transaction_type: TransactionType = row
            .transaction_type
            .parse()
            .map_err(|e| LedgerStoreError::Storage(format!("row {}: {e}", row.id)))?;
        let reference_type: ReferenceType = row
            .reference_type
            .parse()
            .map_err(|e| LedgerStoreError::Storage(format!("row {}: {e}", row.id)))?;

        Ok(InventoryTransaction {
            id: TransactionId::from_uuid(row.id),
            sequence: row.sequence as u64,
            item_id: ItemId::from_uuid(row.item_id),
            location_id: LocationId::from_uuid(row.location_id),
            quantity_delta: row.quantity_delta,
            transaction_type,
            reference_type,
            reference_id: row.reference_id,
            unit_cost: row.unit_cost,
            performed_by: row.performed_by.map(UserId::from_uuid),
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}
