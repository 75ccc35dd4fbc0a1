//! Part lines backed by the inventory ledger.
//!
//! Adding a part reserves what the location can spare, issuing draws the
//! line's reservation down, and returns compensate the line's own ISSUE
//! entries. Every ledger entry references the work order, and the line's
//! quantities follow what the ledger accepted.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use fleetshop_core::{AggregateRoot, DomainError, ExpectedVersion, TransactionId, WorkOrderId};
use fleetshop_inventory::{LedgerError, NewTransaction, StockKey};
use fleetshop_workorders::{LineId, NewPartLine, PartLine, WorkOrder, WorkOrderError};

use crate::cost_engine::{CostEngine, CostEngineError};
use crate::fleet_store::{CustomerFleetStore, InternalFleetStore};
use crate::ledger_store::{LedgerStore, LedgerStoreError};
use crate::stock_projector::StockProjector;
use crate::work_order_store::WorkOrderStore;

#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error(transparent)]
    WorkOrder(#[from] CostEngineError),

    #[error(transparent)]
    Ledger(#[from] LedgerStoreError),
}

impl From<WorkOrderError> for FulfillmentError {
    fn from(err: WorkOrderError) -> Self {
        Self::WorkOrder(err.into())
    }
}

impl From<DomainError> for FulfillmentError {
    fn from(err: DomainError) -> Self {
        WorkOrderError::from(err).into()
    }
}

/// Work-order part lines wired to stock.
///
/// Runs under the same per-work-order section as the [`CostEngine`]. The
/// ledger entry is appended first and the work order saved after it; a save
/// that fails at that point is logged with the orphaned transaction id.
#[derive(Debug)]
pub struct PartFulfillment<S, I, C, L> {
    engine: Arc<CostEngine<S, I, C>>,
    stock: Arc<StockProjector<L>>,
}

impl<S, I, C, L> PartFulfillment<S, I, C, L>
where
    S: WorkOrderStore,
    I: InternalFleetStore,
    C: CustomerFleetStore,
    L: LedgerStore,
{
    pub fn new(engine: Arc<CostEngine<S, I, C>>, stock: Arc<StockProjector<L>>) -> Self {
        Self { engine, stock }
    }

    pub fn stock(&self) -> &StockProjector<L> {
        &self.stock
    }

    /// Add a part line and reserve `min(free, requested)` for it. The line
    /// ends RESERVED when fully covered, BACKORDERED otherwise.
    #[instrument(skip(self, line), fields(work_order_id = %id, item_id = %line.item_id), err)]
    pub async fn add_part(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line: NewPartLine,
    ) -> Result<(WorkOrder, LineId), FulfillmentError> {
        let _section = self.engine.lock(id).await?;
        let mut work_order = self.engine.load(id, expected).await?;
        let loaded = work_order.version();

        let line_id = work_order.add_part(line, Utc::now())?;
        let (entry, reserved) = self.reserve_outstanding(&work_order, line_id).await?;
        work_order.record_reservation(line_id, reserved, Utc::now())?;

        let saved = self.save(work_order, loaded, entry).await?;
        Ok((saved, line_id))
    }

    /// Try again to cover a backordered line.
    #[instrument(skip(self), fields(work_order_id = %id, line_id = %line_id), err)]
    pub async fn reserve_part(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line_id: LineId,
    ) -> Result<WorkOrder, FulfillmentError> {
        let _section = self.engine.lock(id).await?;
        let mut work_order = self.engine.load(id, expected).await?;
        let loaded = work_order.version();
        work_order.ensure_modifiable()?;

        let (entry, reserved) = self.reserve_outstanding(&work_order, line_id).await?;
        work_order.record_reservation(line_id, reserved, Utc::now())?;
        self.save(work_order, loaded, entry).await
    }

    /// Issue reserved units of a line. Never more than the line holds.
    #[instrument(skip(self), fields(work_order_id = %id, line_id = %line_id), err)]
    pub async fn issue_part(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line_id: LineId,
        qty: i64,
    ) -> Result<(WorkOrder, TransactionId), FulfillmentError> {
        let _section = self.engine.lock(id).await?;
        let mut work_order = self.engine.load(id, expected).await?;
        let loaded = work_order.version();
        work_order.ensure_modifiable()?;

        let line = part_line(&work_order, line_id)?;
        line.check_issue(qty)?;
        let tx = NewTransaction::issue(stock_key(line), qty, id)
            .with_unit_cost(unit_cost(line.unit_price))
            .with_notes(format!("Issued to work order {}", work_order.number()));
        let issue = self.stock.record(tx).await?;

        work_order.record_issue(line_id, issue.id, qty, Utc::now())?;
        let saved = self.save(work_order, loaded, Some(issue.id)).await?;
        Ok((saved, issue.id))
    }

    /// Return issued units of a line, newest ISSUE first.
    ///
    /// When the ledger refuses part of a return split over several issues,
    /// the accepted part is still booked on the line before the error is
    /// reported.
    #[instrument(skip(self), fields(work_order_id = %id, line_id = %line_id), err)]
    pub async fn return_part(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line_id: LineId,
        qty: i64,
    ) -> Result<WorkOrder, FulfillmentError> {
        let _section = self.engine.lock(id).await?;
        let mut work_order = self.engine.load(id, expected).await?;
        let loaded = work_order.version();
        work_order.ensure_modifiable()?;

        let line = part_line(&work_order, line_id)?;
        let (key, price) = (stock_key(line), unit_cost(line.unit_price));
        let plan = line.plan_return(qty)?;

        let mut accepted = Vec::new();
        let mut refused = None;
        for (issue_id, lot) in plan {
            let tx = NewTransaction::return_issued(key, lot, issue_id)
                .with_unit_cost(price)
                .with_notes(format!("Returned from work order {}", work_order.number()));
            match self.stock.record(tx).await {
                Ok(committed) => accepted.push((issue_id, lot, committed.id)),
                Err(err) => {
                    refused = Some(err);
                    break;
                }
            }
        }

        let Some(&(_, _, last)) = accepted.last() else {
            return Err(refused.map_or_else(
                || DomainError::validation("nothing to return").into(),
                FulfillmentError::from,
            ));
        };
        for (issue_id, lot, _) in &accepted {
            work_order.record_return(line_id, *issue_id, *lot, Utc::now())?;
        }
        let saved = self.save(work_order, loaded, Some(last)).await?;
        match refused {
            Some(err) => Err(err.into()),
            None => Ok(saved),
        }
    }

    /// Reserve up to the line's outstanding quantity from the free stock.
    ///
    /// Returns the RESERVE entry (if one was written) and the quantity it
    /// holds. Zero leaves the line backordered, including when another writer
    /// drained the key between the balance read and the append.
    async fn reserve_outstanding(
        &self,
        work_order: &WorkOrder,
        line_id: LineId,
    ) -> Result<(Option<TransactionId>, i64), FulfillmentError> {
        let line = part_line(work_order, line_id)?;
        let wanted = line.outstanding()?;
        if wanted == 0 {
            return Ok((None, 0));
        }
        let key = stock_key(line);

        let free = self.stock.balance(key.item_id, key.location_id).await?.on_hand;
        let qty = wanted.min(free);
        if qty > 0 {
            let tx = NewTransaction::reserve(key, qty, *work_order.id())
                .with_notes(format!("Reserved for work order {}", work_order.number()));
            match self.stock.record(tx).await {
                Ok(committed) => {
                    info!(%key, qty, wanted, "stock reserved for part line");
                    return Ok((Some(committed.id), qty));
                }
                Err(LedgerStoreError::Rule(LedgerError::InsufficientStock { .. })) => {}
                Err(err) => return Err(err.into()),
            }
        }

        warn!(%key, wanted, number = work_order.number(), "part line backordered");
        Ok((None, 0))
    }

    async fn save(
        &self,
        work_order: WorkOrder,
        loaded: u64,
        ledger_entry: Option<TransactionId>,
    ) -> Result<WorkOrder, FulfillmentError> {
        let id = *work_order.id();
        self.engine.commit(work_order, loaded).await.map_err(|err| {
            if let Some(tx) = ledger_entry {
                error!(
                    work_order_id = %id,
                    transaction_id = %tx,
                    error = %err,
                    "work order save failed after its ledger entry was written"
                );
            }
            err.into()
        })
    }
}

fn part_line(work_order: &WorkOrder, line_id: LineId) -> Result<&PartLine, DomainError> {
    work_order.part_line(line_id).ok_or_else(DomainError::not_found)
}

fn stock_key(line: &PartLine) -> StockKey {
    StockKey::new(line.item_id, line.location_id)
}

fn unit_cost(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_store::{InMemoryCustomerFleet, InMemoryInternalFleet};
    use crate::ledger_store::InMemoryLedgerStore;
    use crate::vehicle_resolver::VehicleResolver;
    use crate::work_order_store::InMemoryWorkOrderStore;
    use fleetshop_core::{ItemId, LocationId};
    use fleetshop_inventory::{StockBalance, TransactionType};
    use fleetshop_workorders::{OpenWorkOrder, PartLineStatus, Priority, WorkOrderKind, WorkOrderStatus};
    use uuid::Uuid;

    type Parts = PartFulfillment<
        InMemoryWorkOrderStore,
        InMemoryInternalFleet,
        InMemoryCustomerFleet,
        Arc<InMemoryLedgerStore>,
    >;

    fn parts() -> Parts {
        let vehicles = Arc::new(VehicleResolver::new(
            InMemoryInternalFleet::new(),
            InMemoryCustomerFleet::new(),
        ));
        let engine = Arc::new(CostEngine::new(InMemoryWorkOrderStore::new(), vehicles));
        let stock = Arc::new(StockProjector::new(Arc::new(InMemoryLedgerStore::new())));
        PartFulfillment::new(engine, stock)
    }

    async fn open(p: &Parts, location_id: LocationId) -> WorkOrderId {
        *p.engine
            .open(OpenWorkOrder {
                id: WorkOrderId::new(),
                number: "WO-5001".to_string(),
                vehicle: None,
                customer_id: None,
                location_id,
                kind: WorkOrderKind::Repair,
                priority: Priority::Normal,
                description: None,
                tax_rate_percent: Decimal::ZERO,
                opened_at: Utc::now(),
            })
            .await
            .unwrap()
            .id()
    }

    fn part(item_id: ItemId, location_id: LocationId, qty: i64) -> NewPartLine {
        NewPartLine {
            item_id,
            location_id,
            quantity: Decimal::new(qty, 0),
            unit_price: Decimal::new(1999, 2),
            taxable: true,
        }
    }

    #[tokio::test]
    async fn short_stock_backorders_then_tops_up() {
        let p = parts();
        let (item, loc) = (ItemId::new(), LocationId::new());
        let id = open(&p, loc).await;
        p.stock().receive(item, loc, 3, Uuid::now_v7()).await.unwrap();

        let (wo, line) = p.add_part(id, ExpectedVersion::Exact(1), part(item, loc, 5)).await.unwrap();
        let stored = wo.part_line(line).unwrap();
        assert_eq!(stored.status, PartLineStatus::Backordered);
        assert_eq!(stored.qty_reserved, 3);
        assert_eq!(wo.costs().parts_subtotal, Decimal::new(9995, 2));
        assert_eq!(p.stock().balance(item, loc).await.unwrap(), StockBalance::new(0, 3));

        let history = p.stock().store().list_by_key(StockKey::new(item, loc), None).await.unwrap();
        let reserve = &history[1];
        assert_eq!(reserve.transaction_type, TransactionType::Reserve);
        assert_eq!(reserve.reference_id, *id.as_uuid());
        assert_eq!(reserve.notes.as_deref(), Some("Reserved for work order WO-5001"));

        // Nothing free: the line stays backordered.
        let wo = p.reserve_part(id, ExpectedVersion::Any, line).await.unwrap();
        assert_eq!(wo.part_line(line).unwrap().qty_reserved, 3);

        p.stock().receive(item, loc, 4, Uuid::now_v7()).await.unwrap();
        let wo = p.reserve_part(id, ExpectedVersion::Any, line).await.unwrap();
        let stored = wo.part_line(line).unwrap();
        assert_eq!(stored.status, PartLineStatus::Reserved);
        assert_eq!(stored.qty_reserved, 5);
        assert_eq!(p.stock().balance(item, loc).await.unwrap(), StockBalance::new(2, 5));
    }

    #[tokio::test]
    async fn issue_and_return_follow_the_line() {
        let p = parts();
        let (item, loc) = (ItemId::new(), LocationId::new());
        let id = open(&p, loc).await;
        p.stock().receive(item, loc, 10, Uuid::now_v7()).await.unwrap();
        let (_, line) = p.add_part(id, ExpectedVersion::Any, part(item, loc, 4)).await.unwrap();

        let err = p.issue_part(id, ExpectedVersion::Any, line, 5).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::WorkOrder(CostEngineError::Rejected(WorkOrderError::Domain(
                DomainError::Validation(_)
            )))
        ));

        let (_, first) = p.issue_part(id, ExpectedVersion::Any, line, 1).await.unwrap();
        let (wo, second) = p.issue_part(id, ExpectedVersion::Any, line, 3).await.unwrap();
        assert_eq!(wo.part_line(line).unwrap().status, PartLineStatus::Issued);
        assert_eq!(p.stock().balance(item, loc).await.unwrap(), StockBalance::new(6, 0));

        let issued = p.stock().store().get(second).await.unwrap();
        assert_eq!(issued.reference_id, *id.as_uuid());
        assert_eq!(issued.unit_cost, Some(Decimal::new(1999, 2)));

        // Three from the newest issue, one from the first.
        let wo = p.return_part(id, ExpectedVersion::Any, line, 4).await.unwrap();
        let stored = wo.part_line(line).unwrap();
        assert_eq!(stored.status, PartLineStatus::Returned);
        assert_eq!((stored.qty_issued, stored.qty_returned), (0, 4));
        assert_eq!(p.stock().balance(item, loc).await.unwrap(), StockBalance::new(10, 0));

        let returns: Vec<_> = p
            .stock()
            .store()
            .list_by_key(StockKey::new(item, loc), None)
            .await
            .unwrap()
            .into_iter()
            .filter(|tx| tx.transaction_type == TransactionType::Return)
            .map(|tx| (TransactionId::from_uuid(tx.reference_id), tx.quantity_delta))
            .collect();
        assert_eq!(returns, vec![(second, 3), (first, 1)]);

        assert!(p.return_part(id, ExpectedVersion::Any, line, 1).await.is_err());
    }

    #[tokio::test]
    async fn stale_version_writes_nothing_to_the_ledger() {
        let p = parts();
        let (item, loc) = (ItemId::new(), LocationId::new());
        let id = open(&p, loc).await;
        p.stock().receive(item, loc, 2, Uuid::now_v7()).await.unwrap();
        p.add_part(id, ExpectedVersion::Exact(1), part(item, loc, 1)).await.unwrap();

        let err = p
            .add_part(id, ExpectedVersion::Exact(1), part(item, loc, 1))
            .await
            .unwrap_err();
        assert!(matches!(&err, FulfillmentError::WorkOrder(e) if e.is_conflict()));
        assert_eq!(p.stock().balance(item, loc).await.unwrap(), StockBalance::new(1, 1));
    }

    #[tokio::test]
    async fn locked_work_order_touches_no_stock() {
        let p = parts();
        let (item, loc) = (ItemId::new(), LocationId::new());
        let id = open(&p, loc).await;
        p.stock().receive(item, loc, 2, Uuid::now_v7()).await.unwrap();
        let (_, line) = p.add_part(id, ExpectedVersion::Any, part(item, loc, 2)).await.unwrap();
        for status in [WorkOrderStatus::InProgress, WorkOrderStatus::Completed, WorkOrderStatus::Closed] {
            p.engine.set_status(id, ExpectedVersion::Any, status).await.unwrap();
        }

        assert!(p.issue_part(id, ExpectedVersion::Any, line, 1).await.is_err());
        assert!(p.add_part(id, ExpectedVersion::Any, part(item, loc, 1)).await.is_err());
        assert_eq!(p.stock().balance(item, loc).await.unwrap(), StockBalance::new(0, 2));
    }
}
