use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use fleetshop_core::{
    AggregateRoot, CustomerId, DomainError, ItemId, LocationId, TransactionId, WorkOrderId,
};
use fleetshop_fleet::VehicleId;

use crate::cost::{
    checked_sum, compute_costs, overflow, round_currency, CostBreakdown, CostError, CostInputs,
    Discount,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkOrderError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Cost(#[from] CostError),
}

/// Work-order status lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderStatus {
    Draft,
    InProgress,
    WaitingParts,
    Completed,
    Closed,
    Canceled,
    Invoiced,
}

impl WorkOrderStatus {
    /// Terminal for editing: line items, discount, tax and vehicle are frozen.
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            WorkOrderStatus::Closed | WorkOrderStatus::Canceled | WorkOrderStatus::Invoiced
        )
    }

    pub fn can_transition_to(self, next: WorkOrderStatus) -> bool {
        use WorkOrderStatus::*;
        matches!(
            (self, next),
            (Draft, InProgress)
                | (Draft, Canceled)
                | (InProgress, WaitingParts)
                | (InProgress, Completed)
                | (InProgress, Canceled)
                | (WaitingParts, InProgress)
                | (WaitingParts, Completed)
                | (WaitingParts, Canceled)
                | (Completed, Closed)
                | (Completed, Canceled)
                | (Completed, Invoiced)
                | (Closed, Invoiced)
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderKind {
    #[default]
    Repair,
    Pm,
    Inspection,
    Tire,
    Other,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeType {
    ShopSupplies,
    Env,
    Misc,
}

/// Line item identifier (unique across labor, part and fee lines).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineId(Uuid);

impl LineId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LineId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaborLine {
    pub id: LineId,
    pub description: String,
    pub hours: Decimal,
    pub rate: Decimal,
    pub taxable: bool,
    pub line_total: Decimal,
}

/// Stock state of a part line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartLineStatus {
    /// Nothing reserved yet.
    #[default]
    Pending,
    Reserved,
    /// Part of the requested quantity could not be reserved.
    Backordered,
    Issued,
    Returned,
}

/// An ISSUE booked against a part line and how much of it can still be returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockIssue {
    pub transaction_id: TransactionId,
    pub returnable: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartLine {
    pub id: LineId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    /// Requested quantity; priced in full.
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub taxable: bool,
    pub line_total: Decimal,
    pub qty_reserved: i64,
    pub qty_issued: i64,
    pub qty_returned: i64,
    pub status: PartLineStatus,
    pub issues: Vec<StockIssue>,
}

impl PartLine {
    /// Requested quantity in whole stock units.
    pub fn requested_units(&self) -> Result<i64, DomainError> {
        if !self.quantity.fract().is_zero() {
            return Err(DomainError::validation(format!(
                "part quantity {} is not a whole number of stock units",
                self.quantity
            )));
        }
        self.quantity
            .to_i64()
            .ok_or_else(|| DomainError::validation("part quantity is out of range"))
    }

    /// Units still to be reserved: requested minus reserved, issued and returned.
    pub fn outstanding(&self) -> Result<i64, DomainError> {
        let held = self.qty_reserved + self.qty_issued + self.qty_returned;
        Ok((self.requested_units()? - held).max(0))
    }

    pub fn holds_stock(&self) -> bool {
        self.qty_reserved > 0 || self.qty_issued > 0
    }

    pub fn check_issue(&self, qty: i64) -> Result<(), DomainError> {
        ensure_positive_units("issue quantity", qty)?;
        if qty > self.qty_reserved {
            return Err(DomainError::validation(format!(
                "cannot issue {qty}: only {} reserved on this line",
                self.qty_reserved
            )));
        }
        Ok(())
    }

    /// Split a return over the line's issues, newest first.
    pub fn plan_return(&self, qty: i64) -> Result<Vec<(TransactionId, i64)>, DomainError> {
        ensure_positive_units("return quantity", qty)?;
        if qty > self.qty_issued {
            return Err(DomainError::validation(format!(
                "cannot return {qty}: only {} issued on this line",
                self.qty_issued
            )));
        }
        let mut left = qty;
        let mut plan = Vec::new();
        for issue in self.issues.iter().rev() {
            if left == 0 {
                break;
            }
            let take = left.min(issue.returnable);
            if take > 0 {
                plan.push((issue.transaction_id, take));
                left -= take;
            }
        }
        Ok(plan)
    }

    /// Derive the status from the quantities. PENDING is only the state
    /// before the first reservation attempt.
    fn refresh_status(&mut self) -> Result<(), DomainError> {
        let outstanding = self.outstanding()?;
        self.status = if self.qty_issued > 0 && self.qty_reserved == 0 && outstanding == 0 {
            PartLineStatus::Issued
        } else if self.qty_issued == 0 && self.qty_reserved == 0 && self.qty_returned > 0 {
            PartLineStatus::Returned
        } else if outstanding > 0 {
            PartLineStatus::Backordered
        } else {
            PartLineStatus::Reserved
        };
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLine {
    pub id: LineId,
    pub fee_type: FeeType,
    pub amount: Decimal,
    pub taxable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLaborLine {
    pub description: String,
    pub hours: Decimal,
    pub rate: Decimal,
    pub taxable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPartLine {
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub taxable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFeeLine {
    pub fee_type: FeeType,
    pub amount: Decimal,
    pub taxable: bool,
}

/// Payload for opening a work order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenWorkOrder {
    pub id: WorkOrderId,
    pub number: String,
    pub vehicle: Option<VehicleId>,
    pub customer_id: Option<CustomerId>,
    pub location_id: LocationId,
    pub kind: WorkOrderKind,
    pub priority: Priority,
    pub description: Option<String>,
    pub tax_rate_percent: Decimal,
    pub opened_at: DateTime<Utc>,
}

/// Work order aggregate.
///
/// `costs` is always the output of [`compute_costs`] over the current line
/// items, discount and tax rate: every mutation recomputes before it returns,
/// and a mutation whose recomputation fails leaves the aggregate unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    id: WorkOrderId,
    number: String,
    vehicle: Option<VehicleId>,
    customer_id: Option<CustomerId>,
    location_id: LocationId,
    kind: WorkOrderKind,
    priority: Priority,
    status: WorkOrderStatus,
    description: Option<String>,
    labor: Vec<LaborLine>,
    parts: Vec<PartLine>,
    fees: Vec<FeeLine>,
    discount: Discount,
    tax_rate_percent: Decimal,
    costs: CostBreakdown,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkOrder {
    /// Open a new DRAFT work order with no line items.
    pub fn open(cmd: OpenWorkOrder) -> Result<Self, WorkOrderError> {
        let number = cmd.number.trim().to_string();
        if number.is_empty() {
            return Err(DomainError::validation("work order number cannot be empty").into());
        }
        ensure_non_negative("tax_rate_percent", cmd.tax_rate_percent)?;

        let mut order = Self {
            id: cmd.id,
            number,
            vehicle: cmd.vehicle,
            customer_id: cmd.customer_id,
            location_id: cmd.location_id,
            kind: cmd.kind,
            priority: cmd.priority,
            status: WorkOrderStatus::Draft,
            description: cmd.description,
            labor: Vec::new(),
            parts: Vec::new(),
            fees: Vec::new(),
            discount: Discount::none(),
            tax_rate_percent: cmd.tax_rate_percent,
            costs: CostBreakdown::default(),
            version: 0,
            created_at: cmd.opened_at,
            updated_at: cmd.opened_at,
            completed_at: None,
        };
        order.costs = compute_costs(&order.cost_inputs()?)?;
        Ok(order)
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn vehicle(&self) -> Option<VehicleId> {
        self.vehicle
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn kind(&self) -> WorkOrderKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> WorkOrderStatus {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn labor(&self) -> &[LaborLine] {
        &self.labor
    }

    pub fn parts(&self) -> &[PartLine] {
        &self.parts
    }

    pub fn fees(&self) -> &[FeeLine] {
        &self.fees
    }

    pub fn discount(&self) -> Discount {
        self.discount
    }

    pub fn tax_rate_percent(&self) -> Decimal {
        self.tax_rate_percent
    }

    pub fn costs(&self) -> &CostBreakdown {
        &self.costs
    }

    pub fn total_amount(&self) -> Decimal {
        self.costs.total_amount
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_modifiable(&self) -> bool {
        !self.status.is_locked()
    }

    /// Inputs of the cost formula, derived from the current line items.
    pub fn cost_inputs(&self) -> Result<CostInputs, CostError> {
        Ok(CostInputs {
            labor_subtotal: checked_sum(self.labor.iter().map(|l| l.line_total))?,
            parts_subtotal: checked_sum(self.parts.iter().map(|l| l.line_total))?,
            fees_subtotal: checked_sum(self.fees.iter().map(|l| l.amount))?,
            discount: self.discount,
            tax_rate_percent: self.tax_rate_percent,
        })
    }

    /// Recompute the breakdown from line items and store it.
    ///
    /// Returns whether the stored figures changed.
    pub fn recompute(&mut self) -> Result<bool, CostError> {
        let costs = compute_costs(&self.cost_inputs()?)?;
        let changed = costs != self.costs;
        self.costs = costs;
        Ok(changed)
    }

    /// Stamp the version a store assigned on a successful write.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn add_labor(&mut self, line: NewLaborLine, at: DateTime<Utc>) -> Result<LineId, WorkOrderError> {
        if line.description.trim().is_empty() {
            return Err(DomainError::validation("labor description cannot be empty").into());
        }
        ensure_non_negative("hours", line.hours)?;
        ensure_non_negative("rate", line.rate)?;

        let line_total = line_total("labor", line.hours, line.rate)?;
        let id = LineId::new();
        self.edit(at, |wo| {
            wo.labor.push(LaborLine {
                id,
                description: line.description,
                hours: line.hours,
                rate: line.rate,
                taxable: line.taxable,
                line_total,
            });
            Ok(())
        })?;
        Ok(id)
    }

    pub fn add_part(&mut self, line: NewPartLine, at: DateTime<Utc>) -> Result<LineId, WorkOrderError> {
        if line.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("part quantity must be positive").into());
        }
        ensure_non_negative("unit_price", line.unit_price)?;

        let line_total = line_total("part", line.quantity, line.unit_price)?;
        let id = LineId::new();
        self.edit(at, |wo| {
            wo.parts.push(PartLine {
                id,
                item_id: line.item_id,
                location_id: line.location_id,
                quantity: line.quantity,
                unit_price: line.unit_price,
                taxable: line.taxable,
                line_total,
                qty_reserved: 0,
                qty_issued: 0,
                qty_returned: 0,
                status: PartLineStatus::Pending,
                issues: Vec::new(),
            });
            Ok(())
        })?;
        Ok(id)
    }

    pub fn part_line(&self, line_id: LineId) -> Option<&PartLine> {
        self.parts.iter().find(|l| l.id == line_id)
    }

    /// Book units the ledger reserved for a part line.
    pub fn record_reservation(
        &mut self,
        line_id: LineId,
        qty: i64,
        at: DateTime<Utc>,
    ) -> Result<(), WorkOrderError> {
        if qty < 0 {
            return Err(DomainError::validation("reserved quantity cannot be negative").into());
        }
        self.edit_part(line_id, at, |line| {
            let outstanding = line.outstanding()?;
            if qty > outstanding {
                return Err(DomainError::validation(format!(
                    "cannot reserve {qty}: only {outstanding} outstanding on this line"
                )));
            }
            line.qty_reserved += qty;
            line.refresh_status()
        })
    }

    /// Book an ISSUE recorded in the ledger for a part line.
    pub fn record_issue(
        &mut self,
        line_id: LineId,
        transaction_id: TransactionId,
        qty: i64,
        at: DateTime<Utc>,
    ) -> Result<(), WorkOrderError> {
        self.edit_part(line_id, at, |line| {
            line.check_issue(qty)?;
            line.qty_reserved -= qty;
            line.qty_issued += qty;
            line.issues.push(StockIssue {
                transaction_id,
                returnable: qty,
            });
            line.refresh_status()
        })
    }

    /// Book a RETURN recorded in the ledger against one of the line's issues.
    pub fn record_return(
        &mut self,
        line_id: LineId,
        issue_id: TransactionId,
        qty: i64,
        at: DateTime<Utc>,
    ) -> Result<(), WorkOrderError> {
        self.edit_part(line_id, at, |line| {
            ensure_positive_units("return quantity", qty)?;
            let issue = line
                .issues
                .iter_mut()
                .find(|i| i.transaction_id == issue_id)
                .ok_or_else(DomainError::not_found)?;
            if qty > issue.returnable {
                return Err(DomainError::validation(format!(
                    "cannot return {qty} against {issue_id}: {} returnable",
                    issue.returnable
                )));
            }
            issue.returnable -= qty;
            line.qty_issued -= qty;
            line.qty_returned += qty;
            line.refresh_status()
        })
    }

    pub fn add_fee(&mut self, line: NewFeeLine, at: DateTime<Utc>) -> Result<LineId, WorkOrderError> {
        ensure_non_negative("fee amount", line.amount)?;

        let id = LineId::new();
        self.edit(at, |wo| {
            wo.fees.push(FeeLine {
                id,
                fee_type: line.fee_type,
                amount: round_currency(line.amount),
                taxable: line.taxable,
            });
            Ok(())
        })?;
        Ok(id)
    }

    /// Remove a labor, part or fee line. A part line holding reserved or
    /// issued stock stays until that stock is issued or returned.
    pub fn remove_line(&mut self, line_id: LineId, at: DateTime<Utc>) -> Result<(), WorkOrderError> {
        if self.part_line(line_id).is_some_and(PartLine::holds_stock) {
            return Err(DomainError::invariant(format!(
                "part line {line_id} still holds reserved or issued stock"
            ))
            .into());
        }
        self.edit(at, |wo| {
            let before = wo.labor.len() + wo.parts.len() + wo.fees.len();
            wo.labor.retain(|l| l.id != line_id);
            wo.parts.retain(|l| l.id != line_id);
            wo.fees.retain(|l| l.id != line_id);
            if wo.labor.len() + wo.parts.len() + wo.fees.len() == before {
                return Err(DomainError::not_found().into());
            }
            Ok(())
        })
    }

    pub fn set_discount(&mut self, discount: Discount, at: DateTime<Utc>) -> Result<(), WorkOrderError> {
        discount.validate()?;
        self.edit(at, |wo| {
            wo.discount = discount;
            Ok(())
        })
    }

    pub fn set_tax_rate(&mut self, rate_percent: Decimal, at: DateTime<Utc>) -> Result<(), WorkOrderError> {
        ensure_non_negative("tax_rate_percent", rate_percent)?;
        self.edit(at, |wo| {
            wo.tax_rate_percent = rate_percent;
            Ok(())
        })
    }

    /// Attach, replace or clear the vehicle reference. The reference is not
    /// checked against the fleets here; see the resolver.
    pub fn assign_vehicle(&mut self, vehicle: Option<VehicleId>, at: DateTime<Utc>) -> Result<(), WorkOrderError> {
        self.edit(at, |wo| {
            wo.vehicle = vehicle;
            Ok(())
        })
    }

    /// Move along the status lifecycle.
    ///
    /// Locked statuses may still advance (CLOSED → INVOICED); nothing leaves
    /// INVOICED or CANCELED.
    pub fn set_status(&mut self, next: WorkOrderStatus, at: DateTime<Utc>) -> Result<(), WorkOrderError> {
        if next == self.status {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "invalid status transition from {:?} to {:?}",
                self.status, next
            ))
            .into());
        }

        self.status = next;
        if next == WorkOrderStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
        self.updated_at = at;
        self.recompute()?;
        Ok(())
    }

    pub fn ensure_modifiable(&self) -> Result<(), DomainError> {
        if self.is_modifiable() {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "work order {} is {:?} and can no longer be modified",
                self.number, self.status
            )))
        }
    }

    /// Apply `change` to a copy, recompute, and commit only if both succeed.
    fn edit<F>(&mut self, at: DateTime<Utc>, change: F) -> Result<(), WorkOrderError>
    where
        F: FnOnce(&mut WorkOrder) -> Result<(), WorkOrderError>,
    {
        self.ensure_modifiable()?;
        let mut next = self.clone();
        change(&mut next)?;
        next.recompute()?;
        next.updated_at = at;
        *self = next;
        Ok(())
    }

    fn edit_part<F>(&mut self, line_id: LineId, at: DateTime<Utc>, change: F) -> Result<(), WorkOrderError>
    where
        F: FnOnce(&mut PartLine) -> Result<(), DomainError>,
    {
        self.edit(at, |wo| {
            let line = wo
                .parts
                .iter_mut()
                .find(|l| l.id == line_id)
                .ok_or_else(DomainError::not_found)?;
            change(line)?;
            Ok(())
        })
    }
}

impl AggregateRoot for WorkOrder {
    type Id = WorkOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn ensure_positive_units(field: &str, qty: i64) -> Result<(), DomainError> {
    if qty <= 0 {
        return Err(DomainError::validation(format!("{field} must be greater than zero")));
    }
    Ok(())
}

/// `quantity * price` rounded to cents, or a validation error when out of range.
fn line_total(kind: &str, quantity: Decimal, price: Decimal) -> Result<Decimal, WorkOrderError> {
    let total = overflow(&format!("{kind} line total"), quantity.checked_mul(price))?;
    Ok(round_currency(total))
}

fn ensure_non_negative(field: &str, value: Decimal) -> Result<(), DomainError> {
    if value < Decimal::ZERO {
        return Err(DomainError::validation(format!("{field} cannot be negative")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::DiscountType;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn open() -> WorkOrder {
        WorkOrder::open(OpenWorkOrder {
            id: WorkOrderId::new(),
            number: "WO-1001".to_string(),
            vehicle: None,
            customer_id: None,
            location_id: LocationId::new(),
            kind: WorkOrderKind::Repair,
            priority: Priority::Normal,
            description: Some("brake job".to_string()),
            tax_rate_percent: dec("8.25"),
            opened_at: t0(),
        })
        .unwrap()
    }

    fn labor(hours: &str, rate: &str) -> NewLaborLine {
        NewLaborLine {
            description: "labor".to_string(),
            hours: dec(hours),
            rate: dec(rate),
            taxable: true,
        }
    }

    /// labor 100 + parts 50 + fees 10, 10% discount, 8.25% tax.
    fn priced() -> WorkOrder {
        let mut wo = open();
        wo.add_labor(labor("2", "50"), t0()).unwrap();
        wo.add_part(
            NewPartLine {
                item_id: ItemId::new(),
                location_id: wo.location_id(),
                quantity: dec("2"),
                unit_price: dec("25"),
                taxable: true,
            },
            t0(),
        )
        .unwrap();
        wo.add_fee(
            NewFeeLine {
                fee_type: FeeType::ShopSupplies,
                amount: dec("10"),
                taxable: false,
            },
            t0(),
        )
        .unwrap();
        wo.set_discount(Discount::percent(dec("10")), t0()).unwrap();
        wo
    }

    #[test]
    fn opened_work_order_is_draft_with_zero_totals() {
        let wo = open();
        assert_eq!(wo.status(), WorkOrderStatus::Draft);
        assert_eq!(wo.total_amount(), Decimal::ZERO);
        assert_eq!(wo.version(), 0);
    }

    #[test]
    fn every_line_mutation_recomputes_totals() {
        let wo = priced();
        let c = wo.costs();
        assert_eq!(c.labor_subtotal, dec("100"));
        assert_eq!(c.parts_subtotal, dec("50"));
        assert_eq!(c.fees_subtotal, dec("10"));
        assert_eq!(c.discount_amount, dec("16"));
        assert_eq!(c.tax_amount, dec("11.88"));
        assert_eq!(c.total_amount, dec("155.88"));
        assert_eq!(c.discount.discount_type, DiscountType::Percent);
    }

    #[test]
    fn removing_a_line_lowers_the_total() {
        let mut wo = priced();
        let fee = wo.fees()[0].id;
        wo.remove_line(fee, t0()).unwrap();
        assert_eq!(wo.costs().subtotal, dec("150"));
        assert_eq!(wo.costs().total_amount, dec("146.14"));

        assert_eq!(
            wo.remove_line(fee, t0()),
            Err(WorkOrderError::Domain(DomainError::NotFound))
        );
    }

    #[test]
    fn line_totals_round_half_up() {
        let mut wo = open();
        wo.add_labor(labor("1.5", "33.33"), t0()).unwrap();
        // 1.5 * 33.33 = 49.995
        assert_eq!(wo.labor()[0].line_total, dec("50.00"));
    }

    #[test]
    fn recompute_is_idempotent() {
        let mut wo = priced();
        let before = *wo.costs();
        assert!(!wo.recompute().unwrap());
        assert_eq!(wo.costs(), &before);
    }

    #[test]
    fn invalid_input_leaves_the_order_untouched() {
        let mut wo = priced();
        let snapshot = wo.clone();
        assert!(wo.add_labor(labor("-1", "50"), t0()).is_err());
        assert!(wo.set_tax_rate(dec("-2"), t0()).is_err());
        assert!(wo.set_discount(Discount::amount(dec("-1")), t0()).is_err());
        assert_eq!(wo, snapshot);
    }

    #[test]
    fn invoiced_work_order_rejects_edits_and_keeps_totals() {
        let mut wo = priced();
        wo.set_status(WorkOrderStatus::InProgress, t0()).unwrap();
        wo.set_status(WorkOrderStatus::Completed, t0()).unwrap();
        wo.set_status(WorkOrderStatus::Invoiced, t0()).unwrap();
        assert_eq!(wo.completed_at(), Some(t0()));

        let total = wo.total_amount();
        let err = wo.add_labor(labor("1", "100"), t0()).unwrap_err();
        assert!(matches!(
            err,
            WorkOrderError::Domain(DomainError::InvariantViolation(_))
        ));
        assert!(wo.set_discount(Discount::none(), t0()).is_err());
        assert!(wo.assign_vehicle(None, t0()).is_err());
        assert_eq!(wo.total_amount(), total);
    }

    #[test]
    fn out_of_range_amounts_are_rejected_without_panicking() {
        let mut wo = open();
        let snapshot = wo.clone();
        let err = wo
            .add_labor(
                NewLaborLine {
                    hours: Decimal::MAX,
                    rate: Decimal::TWO,
                    ..labor("1", "1")
                },
                t0(),
            )
            .unwrap_err();
        assert!(matches!(err, WorkOrderError::Cost(CostError::Validation(_))));
        assert_eq!(wo, snapshot);

        // The line itself fits; the 8.25% tax on it does not.
        let huge = NewLaborLine {
            hours: Decimal::MAX,
            rate: Decimal::ONE,
            ..labor("1", "1")
        };
        assert!(wo.add_labor(huge, t0()).is_err());
        assert!(wo.labor().is_empty());
        assert_eq!(wo.costs().total_amount, Decimal::ZERO);
    }

    fn part(qty: &str) -> NewPartLine {
        NewPartLine {
            item_id: ItemId::new(),
            location_id: LocationId::new(),
            quantity: dec(qty),
            unit_price: dec("12.50"),
            taxable: true,
        }
    }

    #[test]
    fn part_line_tracks_reserved_issued_and_returned_units() {
        let mut wo = open();
        let line = wo.add_part(part("4"), t0()).unwrap();
        assert_eq!(wo.part_line(line).unwrap().status, PartLineStatus::Pending);

        wo.record_reservation(line, 3, t0()).unwrap();
        assert_eq!(wo.part_line(line).unwrap().status, PartLineStatus::Backordered);
        wo.record_reservation(line, 1, t0()).unwrap();
        assert_eq!(wo.part_line(line).unwrap().status, PartLineStatus::Reserved);
        assert!(wo.record_reservation(line, 1, t0()).is_err());

        let (first, second) = (TransactionId::new(), TransactionId::new());
        assert!(wo.record_issue(line, first, 5, t0()).is_err());
        wo.record_issue(line, first, 1, t0()).unwrap();
        wo.record_issue(line, second, 3, t0()).unwrap();
        let issued = wo.part_line(line).unwrap();
        assert_eq!((issued.qty_reserved, issued.qty_issued), (0, 4));
        assert_eq!(issued.status, PartLineStatus::Issued);

        // Stock-holding lines cannot be dropped.
        assert!(matches!(
            wo.remove_line(line, t0()),
            Err(WorkOrderError::Domain(DomainError::InvariantViolation(_)))
        ));

        let plan = wo.part_line(line).unwrap().plan_return(4).unwrap();
        assert_eq!(plan, vec![(second, 3), (first, 1)]);
        for (issue, qty) in plan {
            wo.record_return(line, issue, qty, t0()).unwrap();
        }
        let returned = wo.part_line(line).unwrap();
        assert_eq!((returned.qty_issued, returned.qty_returned), (0, 4));
        assert_eq!(returned.status, PartLineStatus::Returned);
        assert_eq!(returned.outstanding().unwrap(), 0);

        // Stock state never changes the price of the line.
        assert_eq!(wo.costs().parts_subtotal, dec("50.00"));
        wo.remove_line(line, t0()).unwrap();
    }

    #[test]
    fn fractional_part_quantities_cannot_be_stocked() {
        let mut wo = open();
        let line = wo.add_part(part("1.5"), t0()).unwrap();
        assert!(wo.part_line(line).unwrap().requested_units().is_err());
        assert!(wo.record_reservation(line, 1, t0()).is_err());
        assert_eq!(wo.part_line(line).unwrap().qty_reserved, 0);
    }

    #[test]
    fn status_lifecycle_rejects_skips_and_reopening() {
        let mut wo = open();
        assert!(wo.set_status(WorkOrderStatus::Completed, t0()).is_err());
        wo.set_status(WorkOrderStatus::Canceled, t0()).unwrap();
        assert!(wo.set_status(WorkOrderStatus::InProgress, t0()).is_err());
        assert!(!wo.is_modifiable());
    }
}
