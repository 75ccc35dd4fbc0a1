use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleetshop_core::{CustomerId, LocationId};

/// Which physical fleet a vehicle lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleSource {
    Internal,
    Customer,
}

impl VehicleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            VehicleSource::Internal => "internal",
            VehicleSource::Customer => "customer",
        }
    }
}

impl core::fmt::Display for VehicleSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified vehicle identifier.
///
/// The source tag is part of the identity, so raw ids from the two fleets can
/// never collide. Ordering is `(source, raw)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VehicleId {
    pub source: VehicleSource,
    pub raw: Uuid,
}

impl VehicleId {
    pub fn internal(raw: Uuid) -> Self {
        Self {
            source: VehicleSource::Internal,
            raw,
        }
    }

    pub fn customer(raw: Uuid) -> Self {
        Self {
            source: VehicleSource::Customer,
            raw,
        }
    }
}

impl core::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source, self.raw)
    }
}

/// Operational status.
///
/// Internal vehicles carry one of the first three; customer vehicles have no
/// status workflow of their own and always read as `InService`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "in_maintenance")]
    InMaintenance,
    #[serde(rename = "out_of_service")]
    OutOfService,
    #[serde(rename = "in-service")]
    InService,
}

/// Vehicle category (internal fleet only). Defaults to a truck.
pub type VehicleType = String;

/// Company-owned fleet vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalVehicle {
    pub id: Uuid,
    pub unit_number: Option<String>,
    pub vin: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub license_plate: Option<String>,
    pub state: Option<String>,
    pub status: VehicleStatus,
    pub mileage: Option<i64>,
    pub vehicle_type: VehicleType,
    pub location_id: Option<LocationId>,
    pub inspection_expiry: Option<NaiveDate>,
    pub registration_expiry: Option<NaiveDate>,
    pub oos_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InternalVehicle {
    pub fn new(vin: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            unit_number: None,
            vin: vin.into(),
            make: None,
            model: None,
            year: None,
            license_plate: None,
            state: None,
            status: VehicleStatus::Active,
            mileage: None,
            vehicle_type: "truck".to_string(),
            location_id: None,
            inspection_expiry: None,
            registration_expiry: None,
            oos_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Customer-owned vehicle, scoped to its owning customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerVehicle {
    pub id: Uuid,
    pub customer_id: CustomerId,
    pub unit_number: Option<String>,
    pub vin: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub license_plate: Option<String>,
    pub state: Option<String>,
    pub mileage: Option<i64>,
    pub inspection_expiry: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerVehicle {
    pub fn new(customer_id: CustomerId, vin: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            customer_id,
            unit_number: None,
            vin: vin.into(),
            make: None,
            model: None,
            year: None,
            license_plate: None,
            state: None,
            mileage: None,
            inspection_expiry: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A vehicle from either fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum Vehicle {
    Internal(InternalVehicle),
    Customer(CustomerVehicle),
}

impl Vehicle {
    pub fn id(&self) -> VehicleId {
        match self {
            Vehicle::Internal(v) => VehicleId::internal(v.id),
            Vehicle::Customer(v) => VehicleId::customer(v.id),
        }
    }

    pub fn source(&self) -> VehicleSource {
        self.id().source
    }

    /// Project into the unified read shape.
    pub fn unify(self) -> UnifiedVehicle {
        match self {
            Vehicle::Internal(v) => UnifiedVehicle {
                id: VehicleId::internal(v.id),
                source: VehicleSource::Internal,
                company_owned: true,
                customer_id: None,
                status: v.status,
                unit_number: v.unit_number,
                vin: v.vin,
                make: v.make,
                model: v.model,
                year: v.year,
                license_plate: v.license_plate,
                state: v.state,
                mileage: v.mileage,
                location_id: v.location_id,
                inspection_expiry: v.inspection_expiry,
                registration_expiry: v.registration_expiry,
                oos_reason: v.oos_reason,
                created_at: v.created_at,
                updated_at: v.updated_at,
            },
            Vehicle::Customer(v) => UnifiedVehicle {
                id: VehicleId::customer(v.id),
                source: VehicleSource::Customer,
                company_owned: false,
                customer_id: Some(v.customer_id),
                status: VehicleStatus::InService,
                unit_number: v.unit_number,
                vin: v.vin,
                make: v.make,
                model: v.model,
                year: v.year,
                license_plate: v.license_plate,
                state: v.state,
                mileage: v.mileage,
                location_id: None,
                inspection_expiry: v.inspection_expiry,
                registration_expiry: None,
                oos_reason: None,
                created_at: v.created_at,
                updated_at: v.updated_at,
            },
        }
    }
}

impl From<InternalVehicle> for Vehicle {
    fn from(value: InternalVehicle) -> Self {
        Vehicle::Internal(value)
    }
}

impl From<CustomerVehicle> for Vehicle {
    fn from(value: CustomerVehicle) -> Self {
        Vehicle::Customer(value)
    }
}

/// Read shape shared by both fleets.
///
/// `company_owned` is true iff `source` is internal; `customer_id` is present
/// iff `source` is customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedVehicle {
    pub id: VehicleId,
    pub source: VehicleSource,
    pub company_owned: bool,
    pub customer_id: Option<CustomerId>,
    pub status: VehicleStatus,
    pub unit_number: Option<String>,
    pub vin: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub license_plate: Option<String>,
    pub state: Option<String>,
    pub mileage: Option<i64>,
    pub location_id: Option<LocationId>,
    pub inspection_expiry: Option<NaiveDate>,
    pub registration_expiry: Option<NaiveDate>,
    pub oos_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional narrowing for unified listings. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleFilter {
    pub source: Option<VehicleSource>,
    pub customer_id: Option<CustomerId>,
    pub status: Option<VehicleStatus>,
    pub company_owned: Option<bool>,
}

impl VehicleFilter {
    pub fn matches(&self, vehicle: &UnifiedVehicle) -> bool {
        self.source.is_none_or(|s| s == vehicle.source)
            && self
                .customer_id
                .is_none_or(|c| vehicle.customer_id == Some(c))
            && self.status.is_none_or(|s| s == vehicle.status)
            && self
                .company_owned
                .is_none_or(|owned| owned == vehicle.company_owned)
    }

    /// Whether any vehicle of `source` could match (lets callers skip a source).
    pub fn admits(&self, source: VehicleSource) -> bool {
        match (self.source, self.customer_id, self.company_owned) {
            (Some(s), _, _) if s != source => false,
            (_, Some(_), _) if source == VehicleSource::Internal => false,
            (_, _, Some(owned)) => owned == (source == VehicleSource::Internal),
            _ => true,
        }
    }
}
