use thiserror::Error;

use crate::transaction::{ReferenceType, StockKey, TransactionType};

/// Ledger rule violation.
///
/// Every variant is a rejection decided before anything is written: a failed
/// append leaves the ledger untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The (transaction type, reference type) pairing is not in the allowed set.
    #[error("invalid transaction kind: {transaction_type} cannot reference {reference_type}")]
    InvalidTransactionKind {
        transaction_type: TransactionType,
        reference_type: ReferenceType,
    },

    /// The quantity delta has the wrong sign for its type (or is zero).
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Applying the transaction would drive `on_hand` or `reserved` below zero.
    #[error("insufficient stock for {key}: requested {requested}, available {available}")]
    InsufficientStock {
        key: StockKey,
        requested: i64,
        available: i64,
    },

    /// A RETURN that does not compensate a known ISSUE (or returns too much).
    #[error("invalid return: {0}")]
    InvalidReturn(String),
}

impl LedgerError {
    pub fn quantity(msg: impl Into<String>) -> Self {
        Self::InvalidQuantity(msg.into())
    }

    pub fn invalid_return(msg: impl Into<String>) -> Self {
        Self::InvalidReturn(msg.into())
    }
}
