use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use fleetshop_core::{AggregateRoot, DomainError, ExpectedVersion, WorkOrderId};
use fleetshop_fleet::VehicleId;
use fleetshop_workorders::{
    CostBreakdown, Discount, LineId, NewFeeLine, NewLaborLine, NewPartLine, OpenWorkOrder,
    WorkOrder, WorkOrderError, WorkOrderStatus,
};

use crate::fleet_store::{CustomerFleetStore, InternalFleetStore};
use crate::vehicle_resolver::{VehicleReference, VehicleResolver};
use crate::work_order_store::{WorkOrderStore, WorkOrderStoreError};

#[derive(Debug, Error)]
pub enum CostEngineError {
    /// The work order refused the change (validation, locked status, cost rule).
    #[error(transparent)]
    Rejected(#[from] WorkOrderError),

    #[error(transparent)]
    Store(#[from] WorkOrderStoreError),
}

impl CostEngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CostEngineError::Store(WorkOrderStoreError::Conflict(_)))
    }
}

/// Work order plus the read-time status of its vehicle reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkOrderView {
    pub work_order: WorkOrder,
    pub vehicle: VehicleReference,
}

type Section = Arc<AsyncMutex<()>>;

/// Work-order write path.
///
/// Every mutation takes the work order's section, loads the current
/// aggregate, applies the change (which recomputes the cost breakdown from
/// the resulting line items) and saves it. Writers to one work order are
/// serialized, so `ExpectedVersion::Any` never loses a line; a caller that
/// passes a stale `Exact(v)` gets a conflict. The store still checks the
/// loaded version on save, which covers writers in other processes.
#[derive(Debug)]
pub struct CostEngine<S, I, C> {
    store: S,
    vehicles: Arc<VehicleResolver<I, C>>,
    sections: Mutex<HashMap<WorkOrderId, Section>>,
}

impl<S, I, C> CostEngine<S, I, C>
where
    S: WorkOrderStore,
    I: InternalFleetStore,
    C: CustomerFleetStore,
{
    pub fn new(store: S, vehicles: Arc<VehicleResolver<I, C>>) -> Self {
        Self {
            store,
            vehicles,
            sections: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(skip(self, cmd), fields(work_order_id = %cmd.id, number = %cmd.number), err)]
    pub async fn open(&self, cmd: OpenWorkOrder) -> Result<WorkOrder, CostEngineError> {
        let work_order = WorkOrder::open(cmd)?;
        Ok(self.store.insert(work_order).await?)
    }

    /// Recompute the stored breakdown from the stored line items.
    ///
    /// Writes only when the figures differ; repeated calls are no-ops.
    #[instrument(skip(self), fields(work_order_id = %id), err)]
    pub async fn recompute(&self, id: WorkOrderId) -> Result<CostBreakdown, CostEngineError> {
        let _section = self.lock(id).await?;
        let mut work_order = self.store.get(id).await?;
        let loaded = work_order.version();

        let changed = work_order.recompute().map_err(WorkOrderError::from)?;
        if !changed {
            return Ok(*work_order.costs());
        }
        if work_order.status().is_locked() {
            return Err(WorkOrderError::from(DomainError::invariant(format!(
                "work order {} is {:?}; stored totals cannot be rewritten",
                work_order.number(),
                work_order.status()
            )))
            .into());
        }

        let saved = self.commit(work_order, loaded).await?;
        Ok(*saved.costs())
    }

    pub async fn add_labor(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line: NewLaborLine,
    ) -> Result<(WorkOrder, LineId), CostEngineError> {
        self.mutate(id, expected, |wo, at| wo.add_labor(line, at)).await
    }

    pub async fn add_part(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line: NewPartLine,
    ) -> Result<(WorkOrder, LineId), CostEngineError> {
        self.mutate(id, expected, |wo, at| wo.add_part(line, at)).await
    }

    pub async fn add_fee(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line: NewFeeLine,
    ) -> Result<(WorkOrder, LineId), CostEngineError> {
        self.mutate(id, expected, |wo, at| wo.add_fee(line, at)).await
    }

    pub async fn remove_line(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        line_id: LineId,
    ) -> Result<WorkOrder, CostEngineError> {
        let (wo, ()) = self.mutate(id, expected, |wo, at| wo.remove_line(line_id, at)).await?;
        Ok(wo)
    }

    pub async fn set_discount(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        discount: Discount,
    ) -> Result<WorkOrder, CostEngineError> {
        let (wo, ()) = self.mutate(id, expected, |wo, at| wo.set_discount(discount, at)).await?;
        Ok(wo)
    }

    pub async fn set_tax_rate(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        rate_percent: Decimal,
    ) -> Result<WorkOrder, CostEngineError> {
        let (wo, ()) = self.mutate(id, expected, |wo, at| wo.set_tax_rate(rate_percent, at)).await?;
        Ok(wo)
    }

    pub async fn set_status(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        status: WorkOrderStatus,
    ) -> Result<WorkOrder, CostEngineError> {
        let (wo, ()) = self.mutate(id, expected, |wo, at| wo.set_status(status, at)).await?;
        Ok(wo)
    }

    /// Attach or clear the vehicle. The reference is soft: it is not checked
    /// against the fleets, so an unreachable fleet never blocks the write.
    pub async fn assign_vehicle(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        vehicle: Option<VehicleId>,
    ) -> Result<WorkOrder, CostEngineError> {
        let (wo, ()) = self.mutate(id, expected, |wo, at| wo.assign_vehicle(vehicle, at)).await?;
        Ok(wo)
    }

    /// Read a work order with its vehicle reference classified.
    #[instrument(skip(self), fields(work_order_id = %id), err)]
    pub async fn view(&self, id: WorkOrderId) -> Result<WorkOrderView, CostEngineError> {
        let work_order = self.store.get(id).await?;
        let vehicle = self.vehicles.check_reference(work_order.vehicle()).await;
        if vehicle.is_dangling() {
            warn!(number = work_order.number(), "work order references a vehicle no fleet knows");
        }
        Ok(WorkOrderView {
            work_order,
            vehicle,
        })
    }

    /// Hold the section of one work order. Load, change and save happen
    /// under it.
    pub(crate) async fn lock(&self, id: WorkOrderId) -> Result<OwnedMutexGuard<()>, CostEngineError> {
        let section = {
            let mut sections = self
                .sections
                .lock()
                .map_err(|_| WorkOrderStoreError::Storage("lock poisoned".to_string()))?;
            sections.entry(id).or_default().clone()
        };
        Ok(section.lock_owned().await)
    }

    /// Load a work order for a change under its section, rejecting a stale
    /// caller version.
    pub(crate) async fn load(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
    ) -> Result<WorkOrder, CostEngineError> {
        let work_order = self.store.get(id).await?;
        expected
            .check(work_order.version())
            .map_err(|e| WorkOrderStoreError::Conflict(format!("work order {id}: {e}")))?;
        Ok(work_order)
    }

    /// Save a changed work order over the version it was loaded at.
    pub(crate) async fn commit(&self, work_order: WorkOrder, loaded: u64) -> Result<WorkOrder, CostEngineError> {
        let id = *work_order.id();
        let saved = self.store.save(work_order, ExpectedVersion::Exact(loaded)).await?;
        info!(
            work_order_id = %id,
            version = saved.version(),
            total = %saved.total_amount(),
            "work order updated"
        );
        Ok(saved)
    }

    async fn mutate<T, F>(
        &self,
        id: WorkOrderId,
        expected: ExpectedVersion,
        change: F,
    ) -> Result<(WorkOrder, T), CostEngineError>
    where
        T: Send,
        F: FnOnce(&mut WorkOrder, DateTime<Utc>) -> Result<T, WorkOrderError> + Send,
    {
        let _section = self.lock(id).await?;
        let mut work_order = self.load(id, expected).await?;
        let loaded = work_order.version();

        let value = change(&mut work_order, Utc::now())?;
        let saved = self.commit(work_order, loaded).await?;
        Ok((saved, value))
    }
}
