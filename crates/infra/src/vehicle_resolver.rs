use std::iter::Peekable;
use std::slice::Iter;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use fleetshop_fleet::{UnifiedVehicle, Vehicle, VehicleFilter, VehicleId, VehicleSource};

use crate::fleet_store::{CustomerFleetStore, FleetStoreError, InternalFleetStore};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("vehicle not found: {0}")]
    NotFound(VehicleId),

    #[error("{fleet} fleet unavailable: {reason}")]
    SourceUnavailable { fleet: VehicleSource, reason: String },
}

/// A source that could not be read while building a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub fleet: VehicleSource,
    pub reason: String,
}

impl From<SourceFailure> for ResolveError {
    fn from(f: SourceFailure) -> Self {
        ResolveError::SourceUnavailable {
            fleet: f.fleet,
            reason: f.reason,
        }
    }
}

/// Read-time status of a soft vehicle reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "vehicle", rename_all = "snake_case")]
pub enum VehicleReference {
    /// No vehicle attached.
    Unassigned,
    Resolved(Box<UnifiedVehicle>),
    /// The referenced vehicle no longer exists in its fleet.
    Dangling(VehicleId),
    /// The owning fleet could not be reached; existence is unknown.
    Unverified(VehicleId),
}

impl VehicleReference {
    pub fn is_dangling(&self) -> bool {
        matches!(self, VehicleReference::Dangling(_))
    }
}

/// Unified listing over both fleets.
///
/// Holds each source's matching vehicles sorted by id. [`VehicleListing::iter`]
/// merges them lazily in unified id order and can be called any number of
/// times. When a source failed, its vehicles are absent and the failure is
/// listed in [`VehicleListing::failures`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleListing {
    internal: Vec<UnifiedVehicle>,
    customer: Vec<UnifiedVehicle>,
    failures: Vec<SourceFailure>,
}

impl VehicleListing {
    pub fn iter(&self) -> MergedVehicles<'_> {
        MergedVehicles {
            internal: self.internal.iter().peekable(),
            customer: self.customer.iter().peekable(),
        }
    }

    pub fn len(&self) -> usize {
        self.internal.len() + self.customer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every source answered.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[SourceFailure] {
        &self.failures
    }
}

impl<'a> IntoIterator for &'a VehicleListing {
    type Item = &'a UnifiedVehicle;
    type IntoIter = MergedVehicles<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Two-way merge of the per-source sorted runs.
#[derive(Debug, Clone)]
pub struct MergedVehicles<'a> {
    internal: Peekable<Iter<'a, UnifiedVehicle>>,
    customer: Peekable<Iter<'a, UnifiedVehicle>>,
}

impl<'a> Iterator for MergedVehicles<'a> {
    type Item = &'a UnifiedVehicle;

    fn next(&mut self) -> Option<Self::Item> {
        match (self.internal.peek(), self.customer.peek()) {
            (Some(a), Some(b)) if b.id < a.id => self.customer.next(),
            (Some(_), _) => self.internal.next(),
            (None, _) => self.customer.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.internal.len() + self.customer.len();
        (n, Some(n))
    }
}

impl ExactSizeIterator for MergedVehicles<'_> {}

/// Resolves vehicle identities across the company and customer fleets.
#[derive(Debug)]
pub struct VehicleResolver<I, C> {
    internal: I,
    customer: C,
}

impl<I, C> VehicleResolver<I, C>
where
    I: InternalFleetStore,
    C: CustomerFleetStore,
{
    pub fn new(internal: I, customer: C) -> Self {
        Self { internal, customer }
    }

    pub fn internal(&self) -> &I {
        &self.internal
    }

    pub fn customer(&self) -> &C {
        &self.customer
    }

    /// Look up a raw id in the fleet named by `source`.
    #[instrument(skip(self), err)]
    pub async fn resolve(
        &self,
        raw_id: Uuid,
        source: VehicleSource,
    ) -> Result<UnifiedVehicle, ResolveError> {
        let id = VehicleId { source, raw: raw_id };
        let found: Option<Vehicle> = match source {
            VehicleSource::Internal => self
                .internal
                .get(raw_id)
                .await
                .map_err(|e| unavailable(source, e))?
                .map(Vehicle::from),
            VehicleSource::Customer => self
                .customer
                .get(raw_id)
                .await
                .map_err(|e| unavailable(source, e))?
                .map(Vehicle::from),
        };
        found.map(Vehicle::unify).ok_or(ResolveError::NotFound(id))
    }

    pub async fn resolve_id(&self, id: VehicleId) -> Result<UnifiedVehicle, ResolveError> {
        self.resolve(id.raw, id.source).await
    }

    /// List both fleets, merged by unified id.
    ///
    /// Never fails: an unreachable source is reported in the listing and
    /// logged, and the other source's vehicles are still returned.
    #[instrument(skip(self))]
    pub async fn list_all(&self, filter: &VehicleFilter) -> VehicleListing {
        let mut listing = VehicleListing::default();

        if filter.admits(VehicleSource::Internal) {
            match self.internal.list().await {
                Ok(vehicles) => {
                    listing.internal = collect_sorted(vehicles.into_iter().map(Vehicle::from), filter);
                }
                Err(e) => listing.failures.push(failure(VehicleSource::Internal, e)),
            }
        }

        if filter.admits(VehicleSource::Customer) {
            let fetched = match filter.customer_id {
                Some(customer_id) => self.customer.list_for_customer(customer_id).await,
                None => self.customer.list().await,
            };
            match fetched {
                Ok(vehicles) => {
                    listing.customer = collect_sorted(vehicles.into_iter().map(Vehicle::from), filter);
                }
                Err(e) => listing.failures.push(failure(VehicleSource::Customer, e)),
            }
        }

        for f in &listing.failures {
            warn!(fleet = %f.fleet, reason = %f.reason, "partial vehicle listing");
        }
        listing
    }

    /// Classify a soft reference held by another record.
    pub async fn check_reference(&self, vehicle: Option<VehicleId>) -> VehicleReference {
        let Some(id) = vehicle else {
            return VehicleReference::Unassigned;
        };
        match self.resolve_id(id).await {
            Ok(v) => VehicleReference::Resolved(Box::new(v)),
            Err(ResolveError::NotFound(_)) => {
                info!(vehicle = %id, "dangling vehicle reference");
                VehicleReference::Dangling(id)
            }
            Err(ResolveError::SourceUnavailable { .. }) => VehicleReference::Unverified(id),
        }
    }
}

fn collect_sorted(
    vehicles: impl Iterator<Item = Vehicle>,
    filter: &VehicleFilter,
) -> Vec<UnifiedVehicle> {
    let mut out: Vec<UnifiedVehicle> = vehicles
        .map(Vehicle::unify)
        .filter(|v| filter.matches(v))
        .collect();
    out.sort_by_key(|v| v.id);
    out
}

fn failure(fleet: VehicleSource, err: FleetStoreError) -> SourceFailure {
    SourceFailure {
        fleet,
        reason: err.to_string(),
    }
}

fn unavailable(fleet: VehicleSource, err: FleetStoreError) -> ResolveError {
    failure(fleet, err).into()
}
