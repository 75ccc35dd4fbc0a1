use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleetshop_core::{ItemId, LocationId, TransactionId, UserId, WorkOrderId};

use crate::error::LedgerError;

/// Ledger partition: one part at one location.
///
/// Appends are totally ordered within a key and independent across keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub item_id: ItemId,
    pub location_id: LocationId,
}

impl StockKey {
    pub fn new(item_id: ItemId, location_id: LocationId) -> Self {
        Self {
            item_id,
            location_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.item_id, self.location_id)
    }
}

/// What kind of stock movement a transaction records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Receive,
    Adjust,
    CycleCountAdjust,
    Reserve,
    Issue,
    Return,
}

impl TransactionType {
    pub const ALL: [TransactionType; 6] = [
        TransactionType::Receive,
        TransactionType::Adjust,
        TransactionType::CycleCountAdjust,
        TransactionType::Reserve,
        TransactionType::Issue,
        TransactionType::Return,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Receive => "RECEIVE",
            TransactionType::Adjust => "ADJUST",
            TransactionType::CycleCountAdjust => "CYCLE_COUNT_ADJUST",
            TransactionType::Reserve => "RESERVE",
            TransactionType::Issue => "ISSUE",
            TransactionType::Return => "RETURN",
        }
    }

    /// The only reference type this transaction type may carry.
    pub fn expected_reference(self) -> ReferenceType {
        match self {
            TransactionType::Receive => ReferenceType::ReceivingTicket,
            TransactionType::Adjust => ReferenceType::Adjustment,
            TransactionType::CycleCountAdjust => ReferenceType::CycleCount,
            TransactionType::Reserve | TransactionType::Issue | TransactionType::Return => {
                ReferenceType::WorkOrder
            }
        }
    }

    fn check_sign(self, delta: i64) -> Result<(), LedgerError> {
        if delta == 0 {
            return Err(LedgerError::quantity("quantity_delta cannot be zero"));
        }
        match self {
            TransactionType::Receive | TransactionType::Return if delta < 0 => Err(
                LedgerError::quantity(format!("{} requires a positive delta, got {delta}", self)),
            ),
            TransactionType::Reserve | TransactionType::Issue if delta > 0 => Err(
                LedgerError::quantity(format!("{} requires a negative delta, got {delta}", self)),
            ),
            _ => Ok(()),
        }
    }
}

impl core::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown transaction_type '{s}'"))
    }
}

/// The business document a transaction originates from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    ReceivingTicket,
    Adjustment,
    CycleCount,
    WorkOrder,
}

impl ReferenceType {
    pub const ALL: [ReferenceType; 4] = [
        ReferenceType::ReceivingTicket,
        ReferenceType::Adjustment,
        ReferenceType::CycleCount,
        ReferenceType::WorkOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceType::ReceivingTicket => "RECEIVING_TICKET",
            ReferenceType::Adjustment => "ADJUSTMENT",
            ReferenceType::CycleCount => "CYCLE_COUNT",
            ReferenceType::WorkOrder => "WORK_ORDER",
        }
    }
}

impl core::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReferenceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown reference_type '{s}'"))
    }
}

/// A transaction ready to be appended (not yet assigned id, sequence or timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub key: StockKey,
    pub quantity_delta: i64,
    pub transaction_type: TransactionType,
    pub reference_type: ReferenceType,
    /// Receiving ticket, adjustment, cycle count or work order id.
    /// For RETURN: the id of the ISSUE transaction being compensated.
    pub reference_id: Uuid,
    pub unit_cost: Option<Decimal>,
    pub performed_by: Option<UserId>,
    pub notes: Option<String>,
}

impl NewTransaction {
    fn with_kind(
        key: StockKey,
        quantity_delta: i64,
        transaction_type: TransactionType,
        reference_id: Uuid,
    ) -> Self {
        Self {
            key,
            quantity_delta,
            transaction_type,
            reference_type: transaction_type.expected_reference(),
            reference_id,
            unit_cost: None,
            performed_by: None,
            notes: None,
        }
    }

    /// Stock received against a posted receiving ticket.
    pub fn receive(key: StockKey, qty: i64, receiving_ticket_id: Uuid) -> Self {
        Self::with_kind(key, qty, TransactionType::Receive, receiving_ticket_id)
    }

    /// Manual adjustment (damaged, lost, found, data correction...). Either sign.
    pub fn adjust(key: StockKey, delta: i64, adjustment_id: Uuid) -> Self {
        Self::with_kind(key, delta, TransactionType::Adjust, adjustment_id)
    }

    /// Variance posted by an approved cycle count. Either sign.
    pub fn cycle_count_adjust(key: StockKey, delta: i64, cycle_count_id: Uuid) -> Self {
        Self::with_kind(key, delta, TransactionType::CycleCountAdjust, cycle_count_id)
    }

    pub fn reserve(key: StockKey, qty: i64, work_order_id: WorkOrderId) -> Self {
        Self::with_kind(
            key,
            qty.saturating_neg(),
            TransactionType::Reserve,
            work_order_id.into(),
        )
    }

    pub fn issue(key: StockKey, qty: i64, work_order_id: WorkOrderId) -> Self {
        Self::with_kind(
            key,
            qty.saturating_neg(),
            TransactionType::Issue,
            work_order_id.into(),
        )
    }

    /// Compensating return of (part of) an earlier ISSUE.
    pub fn return_issued(key: StockKey, qty: i64, issue_id: TransactionId) -> Self {
        Self::with_kind(key, qty, TransactionType::Return, issue_id.into())
    }

    pub fn with_unit_cost(mut self, unit_cost: Decimal) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    pub fn performed_by(mut self, user_id: UserId) -> Self {
        self.performed_by = Some(user_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Stateless validation: kind pairing first, then sign and cost.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.transaction_type.expected_reference() != self.reference_type {
            return Err(LedgerError::InvalidTransactionKind {
                transaction_type: self.transaction_type,
                reference_type: self.reference_type,
            });
        }
        self.transaction_type.check_sign(self.quantity_delta)?;
        if let Some(cost) = self.unit_cost {
            if cost.is_sign_negative() {
                return Err(LedgerError::quantity("unit_cost cannot be negative"));
            }
            if cost.round_dp(2) != cost {
                return Err(LedgerError::quantity(format!(
                    "unit_cost {cost} has more than 2 decimal places"
                )));
            }
        }
        Ok(())
    }
}

/// A committed ledger entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub id: TransactionId,
    /// Store-wide monotonically increasing position; tie-break for equal timestamps.
    pub sequence: u64,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity_delta: i64,
    pub transaction_type: TransactionType,
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub unit_cost: Option<Decimal>,
    pub performed_by: Option<UserId>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InventoryTransaction {
    pub fn commit(
        new: NewTransaction,
        id: TransactionId,
        sequence: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sequence,
            item_id: new.key.item_id,
            location_id: new.key.location_id,
            quantity_delta: new.quantity_delta,
            transaction_type: new.transaction_type,
            reference_type: new.reference_type,
            reference_id: new.reference_id,
            unit_cost: new.unit_cost,
            performed_by: new.performed_by,
            notes: new.notes,
            created_at,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.item_id, self.location_id)
    }

    /// Fold ordering key within a stock key.
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}
