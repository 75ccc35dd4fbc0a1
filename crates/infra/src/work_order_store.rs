use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use fleetshop_core::{AggregateRoot, ExpectedVersion, WorkOrderId};
use fleetshop_workorders::WorkOrder;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkOrderStoreError {
    #[error("work order not found: {0}")]
    NotFound(WorkOrderId),

    #[error("work order already exists: {0}")]
    Duplicate(WorkOrderId),

    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence for work-order aggregates.
///
/// The store owns the version: a successful `insert` persists version 1 and
/// each successful `save` persists `current + 1`.
#[async_trait::async_trait]
pub trait WorkOrderStore: Send + Sync {
    async fn get(&self, id: WorkOrderId) -> Result<WorkOrder, WorkOrderStoreError>;

    async fn insert(&self, work_order: WorkOrder) -> Result<WorkOrder, WorkOrderStoreError>;

    /// Replace the stored aggregate if its version satisfies `expected`.
    async fn save(
        &self,
        work_order: WorkOrder,
        expected: ExpectedVersion,
    ) -> Result<WorkOrder, WorkOrderStoreError>;
}

/// In-memory work-order store.
#[derive(Debug, Default)]
pub struct InMemoryWorkOrderStore {
    orders: RwLock<HashMap<WorkOrderId, WorkOrder>>,
}

impl InMemoryWorkOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> WorkOrderStoreError {
    WorkOrderStoreError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl WorkOrderStore for InMemoryWorkOrderStore {
    async fn get(&self, id: WorkOrderId) -> Result<WorkOrder, WorkOrderStoreError> {
        self.orders
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or(WorkOrderStoreError::NotFound(id))
    }

    async fn insert(&self, work_order: WorkOrder) -> Result<WorkOrder, WorkOrderStoreError> {
        let id = *work_order.id();
        let mut orders = self.orders.write().map_err(|_| poisoned())?;
        if orders.contains_key(&id) {
            return Err(WorkOrderStoreError::Duplicate(id));
        }
        let stored = work_order.with_version(1);
        orders.insert(id, stored.clone());
        Ok(stored)
    }

    async fn save(
        &self,
        work_order: WorkOrder,
        expected: ExpectedVersion,
    ) -> Result<WorkOrder, WorkOrderStoreError> {
        let id = *work_order.id();
        let mut orders = self.orders.write().map_err(|_| poisoned())?;
        let current = orders
            .get(&id)
            .map(|wo| wo.version())
            .ok_or(WorkOrderStoreError::NotFound(id))?;

        expected
            .check(current)
            .map_err(|e| WorkOrderStoreError::Conflict(format!("work order {id}: {e}")))?;

        let stored = work_order.with_version(current + 1);
        orders.insert(id, stored.clone());
        Ok(stored)
    }
}
