//! Vehicle sources: the company fleet and customer-owned vehicles.
//!
//! Two independent stores with independent raw id spaces. The resolver is the
//! only component that looks at both.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use fleetshop_core::CustomerId;
use fleetshop_fleet::{CustomerVehicle, InternalVehicle};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetStoreError {
    #[error("vehicle already exists: {0}")]
    Duplicate(Uuid),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait InternalFleetStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<InternalVehicle>, FleetStoreError>;

    async fn list(&self) -> Result<Vec<InternalVehicle>, FleetStoreError>;

    async fn insert(&self, vehicle: InternalVehicle) -> Result<(), FleetStoreError>;

    /// Retire a vehicle. Returns whether it existed.
    async fn remove(&self, id: Uuid) -> Result<bool, FleetStoreError>;
}

#[async_trait::async_trait]
pub trait CustomerFleetStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<CustomerVehicle>, FleetStoreError>;

    async fn list(&self) -> Result<Vec<CustomerVehicle>, FleetStoreError>;

    async fn list_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<CustomerVehicle>, FleetStoreError>;

    async fn insert(&self, vehicle: CustomerVehicle) -> Result<(), FleetStoreError>;

    async fn remove(&self, id: Uuid) -> Result<bool, FleetStoreError>;

    /// Cascade delete: drop every vehicle owned by `customer_id`.
    /// Returns how many were removed.
    async fn remove_customer(&self, customer_id: CustomerId) -> Result<usize, FleetStoreError>;
}

fn poisoned() -> FleetStoreError {
    FleetStoreError::Unavailable("lock poisoned".to_string())
}

/// In-memory company fleet. Listing order is by raw id.
#[derive(Debug, Default)]
pub struct InMemoryInternalFleet {
    vehicles: RwLock<BTreeMap<Uuid, InternalVehicle>>,
}

impl InMemoryInternalFleet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl InternalFleetStore for InMemoryInternalFleet {
    async fn get(&self, id: Uuid) -> Result<Option<InternalVehicle>, FleetStoreError> {
        Ok(self.vehicles.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<InternalVehicle>, FleetStoreError> {
        Ok(self
            .vehicles
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }

    async fn insert(&self, vehicle: InternalVehicle) -> Result<(), FleetStoreError> {
        let mut vehicles = self.vehicles.write().map_err(|_| poisoned())?;
        if vehicles.contains_key(&vehicle.id) {
            return Err(FleetStoreError::Duplicate(vehicle.id));
        }
        vehicles.insert(vehicle.id, vehicle);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, FleetStoreError> {
        Ok(self
            .vehicles
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .is_some())
    }
}

/// In-memory customer vehicles. Listing order is by raw id.
#[derive(Debug, Default)]
pub struct InMemoryCustomerFleet {
    vehicles: RwLock<BTreeMap<Uuid, CustomerVehicle>>,
}

impl InMemoryCustomerFleet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CustomerFleetStore for InMemoryCustomerFleet {
    async fn get(&self, id: Uuid) -> Result<Option<CustomerVehicle>, FleetStoreError> {
        Ok(self.vehicles.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<CustomerVehicle>, FleetStoreError> {
        Ok(self
            .vehicles
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }

    async fn list_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<CustomerVehicle>, FleetStoreError> {
        Ok(self
            .vehicles
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|v| v.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn insert(&self, vehicle: CustomerVehicle) -> Result<(), FleetStoreError> {
        let mut vehicles = self.vehicles.write().map_err(|_| poisoned())?;
        if vehicles.contains_key(&vehicle.id) {
            return Err(FleetStoreError::Duplicate(vehicle.id));
        }
        vehicles.insert(vehicle.id, vehicle);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, FleetStoreError> {
        Ok(self
            .vehicles
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .is_some())
    }

    #[instrument(skip(self), err)]
    async fn remove_customer(&self, customer_id: CustomerId) -> Result<usize, FleetStoreError> {
        let mut vehicles = self.vehicles.write().map_err(|_| poisoned())?;
        let before = vehicles.len();
        vehicles.retain(|_, v| v.customer_id != customer_id);
        let removed = before - vehicles.len();
        info!(%customer_id, removed, "customer vehicles removed");
        Ok(removed)
    }
}
