use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleetshop_core::{TransactionId, WorkOrderId};

use crate::error::LedgerError;
use crate::transaction::{InventoryTransaction, NewTransaction, StockKey, TransactionType};

/// Derived stock level for one (item, location) key.
///
/// `on_hand` is what can still be reserved or issued; `reserved` is held for
/// work orders. Both are non-negative after every fold step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub on_hand: i64,
    pub reserved: i64,
}

impl StockBalance {
    pub fn new(on_hand: i64, reserved: i64) -> Self {
        Self { on_hand, reserved }
    }

    /// Physical quantity at the location (free + held).
    pub fn physical(&self) -> i64 {
        self.on_hand + self.reserved
    }

    /// Classify the level against a key's minimum stock level.
    ///
    /// OUT when nothing is physically there; LOW when the free quantity is at
    /// or below the minimum.
    pub fn severity(&self, min_level: i64) -> StockSeverity {
        if self.physical() == 0 {
            StockSeverity::Out
        } else if self.on_hand <= min_level {
            StockSeverity::Low
        } else {
            StockSeverity::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockSeverity {
    Out,
    Low,
    Normal,
}

/// Effect of one transaction on the fold, computed before anything is mutated.
struct Step {
    balance: StockBalance,
    reservation: Option<(Uuid, i64)>,
    returned: Option<(TransactionId, i64)>,
}

/// Fold state for one key.
///
/// A pure function of the ordered transaction sequence: replaying the same
/// history from scratch always yields an equal `StockFold`. Besides the
/// balance it tracks outstanding reservations per work order and the
/// still-returnable quantity of every ISSUE, which the ISSUE and RETURN rules
/// need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockFold {
    key: StockKey,
    balance: StockBalance,
    reservations: BTreeMap<Uuid, i64>,
    returnable: BTreeMap<TransactionId, i64>,
    cursor: Option<(DateTime<Utc>, u64)>,
}

impl StockFold {
    pub fn new(key: StockKey) -> Self {
        Self {
            key,
            balance: StockBalance::default(),
            reservations: BTreeMap::new(),
            returnable: BTreeMap::new(),
            cursor: None,
        }
    }

    /// Fold a key's ordered history from scratch.
    pub fn replay<'a, I>(key: StockKey, history: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = &'a InventoryTransaction>,
    {
        let mut fold = Self::new(key);
        for tx in history {
            fold.apply(tx)?;
        }
        Ok(fold)
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn balance(&self) -> StockBalance {
        self.balance
    }

    /// Sequence number of the last applied transaction (incremental resync cursor).
    pub fn last_sequence(&self) -> Option<u64> {
        self.cursor.map(|(_, seq)| seq)
    }

    /// Quantity still held for a work order at this key.
    pub fn reserved_for(&self, work_order_id: WorkOrderId) -> i64 {
        self.reservations
            .get(work_order_id.as_uuid())
            .copied()
            .unwrap_or(0)
    }

    /// Quantity of an ISSUE that has not been returned yet.
    pub fn returnable(&self, issue_id: TransactionId) -> i64 {
        self.returnable.get(&issue_id).copied().unwrap_or(0)
    }

    /// Decide whether `tx` may be appended after the current history.
    ///
    /// Returns the balance the key would have afterwards.
    pub fn check(&self, tx: &NewTransaction) -> Result<StockBalance, LedgerError> {
        tx.validate()?;
        let step = self.plan(tx.transaction_type, tx.quantity_delta, tx.reference_id)?;
        Ok(step.balance)
    }

    /// Apply a committed transaction.
    ///
    /// Transactions at or before the cursor are ignored, so re-delivering a
    /// suffix is harmless.
    pub fn apply(&mut self, tx: &InventoryTransaction) -> Result<(), LedgerError> {
        if tx.key() != self.key {
            return Err(LedgerError::quantity(format!(
                "transaction {} belongs to {}, not {}",
                tx.id,
                tx.key(),
                self.key
            )));
        }
        if let Some(cursor) = self.cursor {
            if tx.order_key() <= cursor {
                return Ok(());
            }
        }

        let step = self.plan(tx.transaction_type, tx.quantity_delta, tx.reference_id)?;

        self.balance = step.balance;
        if let Some((work_order, outstanding)) = step.reservation {
            if outstanding == 0 {
                self.reservations.remove(&work_order);
            } else {
                self.reservations.insert(work_order, outstanding);
            }
        }
        if let Some((issue_id, remaining)) = step.returned {
            self.returnable.insert(issue_id, remaining);
        }
        if tx.transaction_type == TransactionType::Issue {
            self.returnable.insert(tx.id, -tx.quantity_delta);
        }
        self.cursor = Some(tx.order_key());
        Ok(())
    }

    fn plan(
        &self,
        transaction_type: TransactionType,
        delta: i64,
        reference_id: Uuid,
    ) -> Result<Step, LedgerError> {
        let current = self.balance;
        let overflow = || LedgerError::quantity("quantity overflow");

        match transaction_type {
            TransactionType::Receive
            | TransactionType::Adjust
            | TransactionType::CycleCountAdjust
            | TransactionType::Return => {
                let on_hand = current.on_hand.checked_add(delta).ok_or_else(overflow)?;
                if on_hand < 0 {
                    return Err(self.insufficient(-delta, current.on_hand));
                }

                let returned = if transaction_type == TransactionType::Return {
                    let issue_id = TransactionId::from_uuid(reference_id);
                    let remaining = self.returnable.get(&issue_id).copied().ok_or_else(|| {
                        LedgerError::invalid_return(format!(
                            "{issue_id} is not an ISSUE recorded for {}",
                            self.key
                        ))
                    })?;
                    if delta > remaining {
                        return Err(LedgerError::invalid_return(format!(
                            "return of {delta} exceeds remaining issued quantity {remaining} of {issue_id}"
                        )));
                    }
                    Some((issue_id, remaining - delta))
                } else {
                    None
                };

                Ok(Step {
                    balance: StockBalance::new(on_hand, current.reserved),
                    reservation: None,
                    returned,
                })
            }
            TransactionType::Reserve => {
                let qty = delta.checked_neg().ok_or_else(overflow)?;
                if qty > current.on_hand {
                    return Err(self.insufficient(qty, current.on_hand));
                }
                let held = self.reservations.get(&reference_id).copied().unwrap_or(0);
                Ok(Step {
                    balance: StockBalance::new(
                        current.on_hand - qty,
                        current.reserved.checked_add(qty).ok_or_else(overflow)?,
                    ),
                    reservation: Some((reference_id, held + qty)),
                    returned: None,
                })
            }
            TransactionType::Issue => {
                let qty = delta.checked_neg().ok_or_else(overflow)?;
                let held = self.reservations.get(&reference_id).copied().unwrap_or(0);
                let from_reserved = qty.min(held);
                let from_on_hand = qty - from_reserved;
                if from_on_hand > current.on_hand {
                    return Err(self.insufficient(qty, current.on_hand + from_reserved));
                }
                Ok(Step {
                    balance: StockBalance::new(
                        current.on_hand - from_on_hand,
                        current.reserved - from_reserved,
                    ),
                    reservation: (held > 0).then_some((reference_id, held - from_reserved)),
                    returned: None,
                })
            }
        }
    }

    fn insufficient(&self, requested: i64, available: i64) -> LedgerError {
        LedgerError::InsufficientStock {
            key: self.key,
            requested,
            available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleetshop_core::{ItemId, LocationId};
    use proptest::prelude::*;

    fn test_key() -> StockKey {
        StockKey::new(ItemId::new(), LocationId::new())
    }

    /// Minimal in-test "store": checks, commits and applies in order.
    struct Harness {
        fold: StockFold,
        history: Vec<InventoryTransaction>,
        base: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                fold: StockFold::new(test_key()),
                history: Vec::new(),
                base: Utc::now(),
            }
        }

        fn key(&self) -> StockKey {
            self.fold.key()
        }

        fn append(&mut self, tx: NewTransaction) -> Result<InventoryTransaction, LedgerError> {
            self.fold.check(&tx)?;
            let seq = self.history.len() as u64 + 1;
            let committed = InventoryTransaction::commit(
                tx,
                TransactionId::new(),
                seq,
                self.base + Duration::milliseconds(seq as i64),
            );
            self.fold.apply(&committed)?;
            self.history.push(committed.clone());
            Ok(committed)
        }
    }

    #[test]
    fn reserve_then_issue_consumes_the_reservation() {
        let mut h = Harness::new();
        let k = h.key();
        let wo = WorkOrderId::new();

        h.append(NewTransaction::receive(k, 10, Uuid::now_v7())).unwrap();
        h.append(NewTransaction::reserve(k, 2, wo)).unwrap();
        assert_eq!(h.fold.balance(), StockBalance::new(8, 2));
        assert_eq!(h.fold.reserved_for(wo), 2);

        h.append(NewTransaction::issue(k, 2, wo)).unwrap();
        assert_eq!(h.fold.balance(), StockBalance::new(8, 0));
        assert_eq!(h.fold.reserved_for(wo), 0);
    }

    #[test]
    fn issue_without_reservation_draws_on_hand() {
        let mut h = Harness::new();
        let k = h.key();
        h.append(NewTransaction::receive(k, 5, Uuid::now_v7())).unwrap();
        h.append(NewTransaction::issue(k, 3, WorkOrderId::new())).unwrap();
        assert_eq!(h.fold.balance(), StockBalance::new(2, 0));
    }

    #[test]
    fn issue_beyond_reservation_takes_remainder_from_on_hand() {
        let mut h = Harness::new();
        let k = h.key();
        let wo = WorkOrderId::new();
        h.append(NewTransaction::receive(k, 10, Uuid::now_v7())).unwrap();
        h.append(NewTransaction::reserve(k, 2, wo)).unwrap();
        h.append(NewTransaction::issue(k, 5, wo)).unwrap();
        assert_eq!(h.fold.balance(), StockBalance::new(5, 0));
    }

    #[test]
    fn another_work_orders_reservation_is_not_consumed() {
        let mut h = Harness::new();
        let k = h.key();
        let (a, b) = (WorkOrderId::new(), WorkOrderId::new());
        h.append(NewTransaction::receive(k, 4, Uuid::now_v7())).unwrap();
        h.append(NewTransaction::reserve(k, 3, a)).unwrap();

        let err = h.append(NewTransaction::issue(k, 2, b)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                key: k,
                requested: 2,
                available: 1
            }
        );
        assert_eq!(h.fold.balance(), StockBalance::new(1, 3));
    }

    #[test]
    fn severity_counts_held_stock_as_present_but_not_free() {
        assert_eq!(StockBalance::new(0, 0).severity(0), StockSeverity::Out);
        assert_eq!(StockBalance::new(0, 2).severity(0), StockSeverity::Low);
        assert_eq!(StockBalance::new(3, 1).severity(3), StockSeverity::Low);
        assert_eq!(StockBalance::new(4, 1).severity(3), StockSeverity::Normal);
        assert_eq!(StockBalance::new(0, 2).physical(), 2);
    }

    #[test]
    fn overdrawing_adjustment_is_rejected() {
        let mut h = Harness::new();
        let k = h.key();
        h.append(NewTransaction::receive(k, 3, Uuid::now_v7())).unwrap();
        let err = h
            .append(NewTransaction::adjust(k, -4, Uuid::now_v7()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { requested: 4, available: 3, .. }));
        assert_eq!(h.history.len(), 1);
    }

    #[test]
    fn return_compensates_a_known_issue_only() {
        let mut h = Harness::new();
        let k = h.key();
        h.append(NewTransaction::receive(k, 5, Uuid::now_v7())).unwrap();
        let issue = h.append(NewTransaction::issue(k, 3, WorkOrderId::new())).unwrap();

        h.append(NewTransaction::return_issued(k, 2, issue.id)).unwrap();
        assert_eq!(h.fold.balance(), StockBalance::new(4, 0));
        assert_eq!(h.fold.returnable(issue.id), 1);

        assert!(matches!(
            h.append(NewTransaction::return_issued(k, 2, issue.id)),
            Err(LedgerError::InvalidReturn(_))
        ));
        assert!(matches!(
            h.append(NewTransaction::return_issued(k, 1, TransactionId::new())),
            Err(LedgerError::InvalidReturn(_))
        ));
    }

    #[test]
    fn reapplying_history_is_a_no_op() {
        let mut h = Harness::new();
        let k = h.key();
        h.append(NewTransaction::receive(k, 7, Uuid::now_v7())).unwrap();
        h.append(NewTransaction::reserve(k, 2, WorkOrderId::new())).unwrap();

        let before = h.fold.clone();
        for tx in h.history.clone() {
            h.fold.apply(&tx).unwrap();
        }
        assert_eq!(h.fold, before);
    }

    #[test]
    fn foreign_key_transaction_is_refused() {
        let mut h = Harness::new();
        let other = InventoryTransaction::commit(
            NewTransaction::receive(test_key(), 1, Uuid::now_v7()),
            TransactionId::new(),
            1,
            Utc::now(),
        );
        assert!(h.fold.apply(&other).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(i64),
        Adjust(i64),
        CycleCount(i64),
        Reserve(usize, i64),
        Issue(usize, i64),
        Return(usize, i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..50).prop_map(Op::Receive),
            (-30i64..30).prop_filter("non-zero", |d| *d != 0).prop_map(Op::Adjust),
            (-10i64..10).prop_filter("non-zero", |d| *d != 0).prop_map(Op::CycleCount),
            (0usize..3, 1i64..20).prop_map(|(w, q)| Op::Reserve(w, q)),
            (0usize..3, 1i64..20).prop_map(|(w, q)| Op::Issue(w, q)),
            (0usize..8, 1i64..10).prop_map(|(i, q)| Op::Return(i, q)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: balances stay non-negative at every step, and the
        /// incrementally maintained fold equals a full replay of the history.
        #[test]
        fn incremental_fold_matches_full_replay(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut h = Harness::new();
            let k = h.key();
            let work_orders = [WorkOrderId::new(), WorkOrderId::new(), WorkOrderId::new()];
            let mut issues: Vec<TransactionId> = Vec::new();

            for op in ops {
                let tx = match op {
                    Op::Receive(q) => NewTransaction::receive(k, q, Uuid::now_v7()),
                    Op::Adjust(d) => NewTransaction::adjust(k, d, Uuid::now_v7()),
                    Op::CycleCount(d) => NewTransaction::cycle_count_adjust(k, d, Uuid::now_v7()),
                    Op::Reserve(w, q) => NewTransaction::reserve(k, q, work_orders[w]),
                    Op::Issue(w, q) => NewTransaction::issue(k, q, work_orders[w]),
                    Op::Return(i, q) => match issues.get(i) {
                        Some(id) => NewTransaction::return_issued(k, q, *id),
                        None => continue,
                    },
                };
                let before = h.history.len();
                if let Ok(committed) = h.append(tx) {
                    if committed.transaction_type == TransactionType::Issue {
                        issues.push(committed.id);
                    }
                } else {
                    prop_assert_eq!(h.history.len(), before);
                }

                let b = h.fold.balance();
                prop_assert!(b.on_hand >= 0);
                prop_assert!(b.reserved >= 0);
            }

            let replayed = StockFold::replay(k, &h.history).unwrap();
            prop_assert_eq!(&replayed, &h.fold);
            let again = StockFold::replay(k, &h.history).unwrap();
            prop_assert_eq!(replayed, again);
        }
    }
}
