use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use fleetshop_core::{AggregateRoot, ExpectedVersion, LocationId, WorkOrderId};
use fleetshop_infra::cost_engine::CostEngine;
use fleetshop_infra::fleet_store::{InMemoryCustomerFleet, InMemoryInternalFleet};
use fleetshop_infra::vehicle_resolver::VehicleResolver;
use fleetshop_infra::work_order_store::{InMemoryWorkOrderStore, WorkOrderStore};
use fleetshop_workorders::{NewLaborLine, OpenWorkOrder, Priority, WorkOrderKind};

type Engine = CostEngine<InMemoryWorkOrderStore, InMemoryInternalFleet, InMemoryCustomerFleet>;

fn engine() -> Arc<Engine> {
    let vehicles = Arc::new(VehicleResolver::new(
        InMemoryInternalFleet::new(),
        InMemoryCustomerFleet::new(),
    ));
    Arc::new(CostEngine::new(InMemoryWorkOrderStore::new(), vehicles))
}

fn labor(rate: i64) -> NewLaborLine {
    NewLaborLine {
        description: format!("labor @ {rate}"),
        hours: Decimal::ONE,
        rate: Decimal::new(rate, 0),
        taxable: true,
    }
}

async fn open(engine: &Engine) -> WorkOrderId {
    engine
        .open(OpenWorkOrder {
            id: WorkOrderId::new(),
            number: "WO-4001".to_string(),
            vehicle: None,
            customer_id: None,
            location_id: LocationId::new(),
            kind: WorkOrderKind::Repair,
            priority: Priority::Urgent,
            description: None,
            tax_rate_percent: Decimal::new(10, 0),
            opened_at: Utc::now(),
        })
        .await
        .unwrap()
        .id()
        .to_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_writers_from_one_version_conflict_instead_of_overwriting() {
    let e = engine();
    let id = open(&e).await;

    let handles: Vec<_> = [100, 200]
        .into_iter()
        .map(|rate| {
            let e = e.clone();
            tokio::spawn(async move { e.add_labor(id, ExpectedVersion::Exact(1), labor(rate)).await })
        })
        .collect();

    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok((wo, _)) => winners.push(wo),
            Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = e.store().get(id).await.unwrap();
    assert_eq!(stored.version(), 2);
    assert_eq!(stored.labor().len(), 1);
    assert_eq!(stored.costs(), winners[0].costs());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unversioned_writers_are_serialized_and_all_land() {
    let e = engine();
    let id = open(&e).await;

    let handles: Vec<_> = (1..=8)
        .map(|rate| {
            let e = e.clone();
            tokio::spawn(async move { e.add_labor(id, ExpectedVersion::Any, labor(rate)).await })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let stored = e.store().get(id).await.unwrap();
    assert_eq!(stored.labor().len(), 8);
    assert_eq!(stored.version(), 9);
    // 1 + 2 + ... + 8 = 36, plus 10% tax.
    assert_eq!(stored.costs().labor_subtotal, Decimal::new(36, 0));
    assert_eq!(stored.total_amount(), Decimal::new(3960, 2));
    assert_eq!(e.recompute(id).await.unwrap(), *stored.costs());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versioned_writer_behind_an_unversioned_one_conflicts() {
    let e = engine();
    let id = open(&e).await;

    e.add_labor(id, ExpectedVersion::Any, labor(50)).await.unwrap();
    let err = e
        .add_labor(id, ExpectedVersion::Exact(1), labor(60))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let stored = e.store().get(id).await.unwrap();
    assert_eq!(stored.version(), 2);
    assert_eq!(stored.labor().len(), 1);
}
