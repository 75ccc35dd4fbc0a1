//! Fleet domain module: company-owned and customer-owned vehicles.
//!
//! The two fleets are keyed independently. This crate models them as one
//! tagged `Vehicle` and defines the unified identity work orders refer to.

pub mod vehicle;

pub use vehicle::{
    CustomerVehicle, InternalVehicle, UnifiedVehicle, Vehicle, VehicleFilter, VehicleId,
    VehicleSource, VehicleStatus, VehicleType,
};
