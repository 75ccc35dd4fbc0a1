//! Infrastructure layer: ledger persistence, projections, vehicle resolution,
//! the work-order write path, stock-backed part lines and configuration.

pub mod config;
pub mod cost_engine;
pub mod fleet_store;
pub mod ledger_store;
pub mod part_fulfillment;
pub mod stock_projector;
pub mod vehicle_resolver;
pub mod work_order_store;

pub use config::{AppConfig, DatabaseConfig};
pub use cost_engine::{CostEngine, CostEngineError, WorkOrderView};
pub use fleet_store::{
    CustomerFleetStore, FleetStoreError, InMemoryCustomerFleet, InMemoryInternalFleet,
    InternalFleetStore,
};
pub use ledger_store::{InMemoryLedgerStore, LedgerStore, LedgerStoreError, PostgresLedgerStore};
pub use part_fulfillment::{FulfillmentError, PartFulfillment};
pub use stock_projector::{StockLevel, StockProjector, StockVerification};
pub use vehicle_resolver::{
    MergedVehicles, ResolveError, SourceFailure, VehicleListing, VehicleReference, VehicleResolver,
};
pub use work_order_store::{InMemoryWorkOrderStore, WorkOrderStore, WorkOrderStoreError};
