//! Inventory ledger domain module.
//!
//! Business rules for the append-only inventory ledger, implemented purely as
//! deterministic domain logic (no IO, no storage):
//! - which (transaction type, reference type) pairings are valid,
//! - which sign each transaction type carries,
//! - how a key's ordered history folds into an on-hand / reserved balance.

pub mod balance;
pub mod error;
pub mod transaction;

pub use balance::{StockBalance, StockFold, StockSeverity};
pub use error::LedgerError;
pub use transaction::{
    InventoryTransaction, NewTransaction, ReferenceType, StockKey, TransactionType,
};
