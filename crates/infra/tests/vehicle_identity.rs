use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use fleetshop_core::{AggregateRoot, CustomerId, ExpectedVersion, LocationId, WorkOrderId};
use fleetshop_fleet::{
    CustomerVehicle, InternalVehicle, VehicleFilter, VehicleId, VehicleSource,
};
use fleetshop_infra::cost_engine::CostEngine;
use fleetshop_infra::fleet_store::{
    CustomerFleetStore, FleetStoreError, InMemoryCustomerFleet, InMemoryInternalFleet,
    InternalFleetStore,
};
use fleetshop_infra::vehicle_resolver::{ResolveError, VehicleReference, VehicleResolver};
use fleetshop_infra::work_order_store::InMemoryWorkOrderStore;
use fleetshop_workorders::{OpenWorkOrder, Priority, WorkOrderKind};

/// Company fleet that is always down.
struct OfflineFleet;

#[async_trait::async_trait]
impl InternalFleetStore for OfflineFleet {
    async fn get(&self, _id: Uuid) -> Result<Option<InternalVehicle>, FleetStoreError> {
        Err(FleetStoreError::Unavailable("connection refused".to_string()))
    }

    async fn list(&self) -> Result<Vec<InternalVehicle>, FleetStoreError> {
        Err(FleetStoreError::Unavailable("connection refused".to_string()))
    }

    async fn insert(&self, _vehicle: InternalVehicle) -> Result<(), FleetStoreError> {
        Err(FleetStoreError::Unavailable("connection refused".to_string()))
    }

    async fn remove(&self, _id: Uuid) -> Result<bool, FleetStoreError> {
        Err(FleetStoreError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn colliding_raw_ids_stay_distinct_in_the_unified_listing() {
    let resolver = VehicleResolver::new(InMemoryInternalFleet::new(), InMemoryCustomerFleet::new());
    let customer = CustomerId::new();

    // Every raw id exists in both fleets.
    for i in 0..1000 {
        let raw = Uuid::now_v7();
        let mut truck = InternalVehicle::new(format!("INT{i:05}"));
        truck.id = raw;
        resolver.internal().insert(truck).await.unwrap();

        let mut van = CustomerVehicle::new(customer, format!("CUS{i:05}"));
        van.id = raw;
        resolver.customer().insert(van).await.unwrap();
    }

    let listing = resolver.list_all(&VehicleFilter::default()).await;
    assert!(listing.is_complete());
    assert_eq!(listing.len(), 2000);

    let ids: Vec<VehicleId> = listing.iter().map(|v| v.id).collect();
    let unique: HashSet<VehicleId> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 2000);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    for v in &listing {
        assert_eq!(v.company_owned, v.source == VehicleSource::Internal);
        assert_eq!(v.customer_id.is_some(), v.source == VehicleSource::Customer);
    }

    let sample = ids[0].raw;
    let internal = resolver.resolve(sample, VehicleSource::Internal).await.unwrap();
    let external = resolver.resolve(sample, VehicleSource::Customer).await.unwrap();
    assert_ne!(internal.id, external.id);
    assert!(internal.vin.starts_with("INT"));
    assert!(external.vin.starts_with("CUS"));
}

#[tokio::test]
async fn unavailable_source_yields_a_partial_listing() {
    let resolver = VehicleResolver::new(OfflineFleet, InMemoryCustomerFleet::new());
    let customer = CustomerId::new();
    resolver
        .customer()
        .insert(CustomerVehicle::new(customer, "1HTMMAAL"))
        .await
        .unwrap();

    let listing = resolver.list_all(&VehicleFilter::default()).await;
    assert_eq!(listing.len(), 1);
    assert!(!listing.is_complete());
    assert_eq!(listing.failures()[0].fleet, VehicleSource::Internal);

    // The company fleet is filtered out entirely, so nothing is missing.
    let customer_only = resolver
        .list_all(&VehicleFilter {
            source: Some(VehicleSource::Customer),
            ..Default::default()
        })
        .await;
    assert!(customer_only.is_complete());

    let raw = Uuid::now_v7();
    assert!(matches!(
        resolver.resolve(raw, VehicleSource::Internal).await,
        Err(ResolveError::SourceUnavailable { fleet: VehicleSource::Internal, .. })
    ));
    assert_eq!(
        resolver.check_reference(Some(VehicleId::internal(raw))).await,
        VehicleReference::Unverified(VehicleId::internal(raw))
    );
}

#[tokio::test]
async fn deleting_a_customer_leaves_work_orders_readable_with_a_dangling_marker() {
    let resolver = Arc::new(VehicleResolver::new(
        InMemoryInternalFleet::new(),
        InMemoryCustomerFleet::new(),
    ));
    let engine = CostEngine::new(InMemoryWorkOrderStore::new(), resolver.clone());

    let customer = CustomerId::new();
    let van = CustomerVehicle::new(customer, "2FMDK3GC");
    let vehicle = VehicleId::customer(van.id);
    resolver.customer().insert(van).await.unwrap();

    let wo = engine
        .open(OpenWorkOrder {
            id: WorkOrderId::new(),
            number: "WO-3001".to_string(),
            vehicle: Some(vehicle),
            customer_id: Some(customer),
            location_id: LocationId::new(),
            kind: WorkOrderKind::Inspection,
            priority: Priority::Normal,
            description: None,
            tax_rate_percent: Decimal::ZERO,
            opened_at: Utc::now(),
        })
        .await
        .unwrap();
    let id = *wo.id();

    assert!(matches!(
        engine.view(id).await.unwrap().vehicle,
        VehicleReference::Resolved(_)
    ));

    resolver.customer().remove_customer(customer).await.unwrap();

    let view = engine.view(id).await.unwrap();
    assert_eq!(view.vehicle, VehicleReference::Dangling(vehicle));
    assert!(view.vehicle.is_dangling());
    assert_eq!(view.work_order.vehicle(), Some(vehicle));

    // Dangling references never block writes.
    engine
        .set_tax_rate(id, ExpectedVersion::Any, Decimal::new(5, 0))
        .await
        .unwrap();
}
