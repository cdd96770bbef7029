//! Store gateway (C4): typed access to the seven core entities.
//!
//! Generalizes the teacher's `ecs.rs` approach (a `bevy_ecs::World` as the
//! entity store) from simulation agents to Vehicle/Driver/Device/Fault/Trip/
//! Route/Alert/Telemetry. `bevy_ecs::Entity` is used directly as the opaque
//! `Id` type spec §3 asks for — it is already a generational, cheaply-copied
//! handle, so no separate newtype wrapper is needed.
//!
//! All entity-table mutations are made holding the single `Mutex<World>`, so
//! any individual store call is atomic; compare-and-swap semantics (spec
//! §4.4) are implemented by checking the expected status inside that same
//! critical section before writing the new one.

use std::sync::Mutex;

use bevy_ecs::prelude::*;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::geo::LatLon;

pub type Id = Entity;

fn order_key(id: Id) -> u64 {
    id.to_bits()
}

/// External representation of an opaque `Id`, used wherever one crosses a
/// JSON boundary (events, device-protocol messages, HTTP responses) — the
/// `bevy_ecs::Entity` bit pattern round-trips exactly via `from_bits`.
pub fn id_to_external(id: Id) -> u64 {
    id.to_bits()
}

pub fn external_to_id(bits: u64) -> Id {
    Entity::from_bits(bits)
}

/// Returns `(a, b)` reordered so `order_key(a) <= order_key(b)`, matching the
/// "vehicleId then faultId, both ascending" canonical lock order spec §5
/// requires for cross-entity transitions.
pub fn canonical_order(vehicle: Id, fault: Id) -> (Id, Id) {
    if order_key(vehicle) <= order_key(fault) {
        (vehicle, fault)
    } else {
        (fault, vehicle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleStatus {
    Available,
    Idle,
    OnRoute,
    Working,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCategory {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Waiting,
    PendingConfirmation,
    Assigned,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripStatus {
    Ongoing,
    Completed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    External,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Active,
    Completed,
    Cancelled,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPriority {
    High,
    Medium,
    Low,
}

impl From<FaultCategory> for AlertPriority {
    fn from(c: FaultCategory) -> Self {
        match c {
            FaultCategory::High => AlertPriority::High,
            FaultCategory::Medium => AlertPriority::Medium,
            FaultCategory::Low => AlertPriority::Low,
        }
    }
}

#[derive(Component, Debug, Clone)]
pub struct VehicleRecord {
    pub number: String,
    pub status: VehicleStatus,
    pub driver_id: Option<Id>,
    pub device_id: Option<Id>,
}

#[derive(Component, Debug, Clone)]
pub struct DriverRecord {
    pub name: String,
    pub license: String,
    pub contact: String,
    pub vehicle_id: Option<Id>,
}

#[derive(Component, Debug, Clone)]
pub struct DeviceRecord {
    pub external_device_id: String,
    pub vehicle_id: Option<Id>,
    pub status: DeviceStatus,
    pub installed_at: DateTime<Utc>,
}

#[derive(Component, Debug, Clone)]
pub struct FaultRecord {
    pub fault_type: String,
    pub location: String,
    pub category: FaultCategory,
    pub lat: f64,
    pub lon: f64,
    pub detail: Option<String>,
    pub reported_at: DateTime<Utc>,
    pub status: FaultStatus,
    pub assigned_vehicle_id: Option<Id>,
}

#[derive(Component, Debug, Clone)]
pub struct TripRecord {
    pub vehicle_id: Id,
    pub driver_id: Option<Id>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub start_location: LatLon,
    pub end_location: Option<LatLon>,
    pub status: TripStatus,
    pub managed_by: Option<Id>,
}

#[derive(Component, Debug, Clone)]
pub struct RouteRecord {
    pub vehicle_id: Id,
    pub fault_id: Id,
    pub waypoints: Vec<LatLon>,
    pub distance_m: f64,
    pub duration_s: f64,
    pub source: RouteSource,
    pub is_fallback: bool,
    pub calculated_at: DateTime<Utc>,
    pub route_start_at: DateTime<Utc>,
    pub status: RouteStatus,
}

#[derive(Component, Debug, Clone)]
pub struct AlertRecord {
    pub fault_id: Id,
    pub vehicle_id: Id,
    pub priority: AlertPriority,
    pub solved: bool,
    pub acknowledged_by: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySample {
    pub vehicle_id: Id,
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Resource, Default)]
struct TelemetryLog(Vec<TelemetrySample>);

/// Typed gateway over a `bevy_ecs::World`, guarded by a single mutex.
pub struct Store {
    world: Mutex<World>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let mut world = World::new();
        world.init_resource::<TelemetryLog>();
        Self { world: Mutex::new(world) }
    }

    // ---- Vehicle ----------------------------------------------------

    pub fn create_vehicle(&self, record: VehicleRecord) -> Id {
        let mut world = self.world.lock().unwrap();
        world.spawn(record).id()
    }

    pub fn get_vehicle(&self, id: Id) -> Result<VehicleRecord, StoreError> {
        let world = self.world.lock().unwrap();
        world
            .get::<VehicleRecord>(id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "vehicle", id: format!("{id:?}") })
    }

    pub fn list_vehicles_by_status(&self, status: VehicleStatus) -> Vec<(Id, VehicleRecord)> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<(Entity, &VehicleRecord)>();
        let mut out: Vec<(Id, VehicleRecord)> = query
            .iter(&world)
            .filter(|(_, v)| v.status == status)
            .map(|(e, v)| (e, v.clone()))
            .collect();
        out.sort_by_key(|(id, _)| order_key(*id));
        out
    }

    /// Compare-and-swap a vehicle's status. Returns `StoreError::Cas` if the
    /// current status does not match `expected`.
    pub fn cas_vehicle_status(
        &self,
        id: Id,
        expected: VehicleStatus,
        new: VehicleStatus,
    ) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<VehicleRecord>(id)
            .ok_or(StoreError::NotFound { entity: "vehicle", id: format!("{id:?}") })?;
        if rec.status != expected {
            return Err(StoreError::Cas { entity: "vehicle", id: format!("{id:?}") });
        }
        rec.status = new;
        Ok(())
    }

    /// Unconditional status set, used by the sweeper and timer rebuild where
    /// no prior expected state is meaningful.
    pub fn force_vehicle_status(&self, id: Id, new: VehicleStatus) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<VehicleRecord>(id)
            .ok_or(StoreError::NotFound { entity: "vehicle", id: format!("{id:?}") })?;
        rec.status = new;
        Ok(())
    }

    // ---- Driver / Device ---------------------------------------------

    pub fn create_driver(&self, record: DriverRecord) -> Id {
        let mut world = self.world.lock().unwrap();
        world.spawn(record).id()
    }

    pub fn create_device(&self, record: DeviceRecord) -> Id {
        let mut world = self.world.lock().unwrap();
        world.spawn(record).id()
    }

    pub fn get_device_for_vehicle(&self, vehicle_id: Id) -> Option<DeviceRecord> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<&DeviceRecord>();
        query
            .iter(&world)
            .find(|d| d.vehicle_id == Some(vehicle_id))
            .cloned()
    }

    // ---- Fault --------------------------------------------------------

    pub fn create_fault(&self, record: FaultRecord) -> Id {
        let mut world = self.world.lock().unwrap();
        world.spawn(record).id()
    }

    pub fn get_fault(&self, id: Id) -> Result<FaultRecord, StoreError> {
        let world = self.world.lock().unwrap();
        world
            .get::<FaultRecord>(id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "fault", id: format!("{id:?}") })
    }

    /// Faults in `status`, ordered by `reported_at` ascending (spec §4.4/§5).
    pub fn list_faults_by_status(&self, status: FaultStatus) -> Vec<(Id, FaultRecord)> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<(Entity, &FaultRecord)>();
        let mut out: Vec<(Id, FaultRecord)> = query
            .iter(&world)
            .filter(|(_, f)| f.status == status)
            .map(|(e, f)| (e, f.clone()))
            .collect();
        out.sort_by_key(|(_, f)| f.reported_at);
        out
    }

    /// All faults ever assigned to `vehicle_id` (current or historical —
    /// `assigned_vehicle_id` is never cleared on resolution), used to
    /// batch-precompute the C8 scorer inputs.
    pub fn faults_assigned_to(&self, vehicle_id: Id) -> Vec<FaultRecord> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<&FaultRecord>();
        query
            .iter(&world)
            .filter(|f| f.assigned_vehicle_id == Some(vehicle_id))
            .cloned()
            .collect()
    }

    /// The fault currently assigned to `vehicle_id` that still needs action
    /// (status `PENDING_CONFIRMATION` or `ASSIGNED`), if any. Used by the
    /// telemetry handler's arrival check and by the sweeper's orphan check
    /// (spec §4.11/§4.13).
    pub fn assigned_active_fault_for_vehicle(&self, vehicle_id: Id) -> Option<(Id, FaultRecord)> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<(Entity, &FaultRecord)>();
        query
            .iter(&world)
            .find(|(_, f)| {
                f.assigned_vehicle_id == Some(vehicle_id)
                    && matches!(f.status, FaultStatus::PendingConfirmation | FaultStatus::Assigned)
            })
            .map(|(id, f)| (id, f.clone()))
    }

    /// Transition a fault from `expected` to `new`, optionally setting
    /// `assigned_vehicle_id`. `set_assigned` of `None` leaves the field
    /// untouched; `Some(x)` sets it (use `Some(None)` to clear it).
    pub fn cas_fault_status(
        &self,
        id: Id,
        expected: FaultStatus,
        new: FaultStatus,
        set_assigned: Option<Option<Id>>,
    ) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<FaultRecord>(id)
            .ok_or(StoreError::NotFound { entity: "fault", id: format!("{id:?}") })?;
        if rec.status != expected {
            return Err(StoreError::Cas { entity: "fault", id: format!("{id:?}") });
        }
        rec.status = new;
        if let Some(assigned) = set_assigned {
            rec.assigned_vehicle_id = assigned;
        }
        Ok(())
    }

    pub fn set_fault_assigned_vehicle(&self, id: Id, assigned: Option<Id>) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<FaultRecord>(id)
            .ok_or(StoreError::NotFound { entity: "fault", id: format!("{id:?}") })?;
        rec.assigned_vehicle_id = assigned;
        Ok(())
    }

    pub fn force_fault_status(&self, id: Id, new: FaultStatus) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<FaultRecord>(id)
            .ok_or(StoreError::NotFound { entity: "fault", id: format!("{id:?}") })?;
        rec.status = new;
        Ok(())
    }

    /// Atomically reserve `vehicle_id` for `fault_id`: `Fault WAITING ->
    /// PENDING_CONFIRMATION(assignedVehicleId=vehicle)` AND `Vehicle AVAILABLE
    /// -> ON_ROUTE`, both under one lock acquisition (spec §4.9 step 6). If
    /// either precondition fails, neither mutation is applied.
    pub fn reserve(&self, vehicle_id: Id, fault_id: Id) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();

        {
            let vehicle = world
                .get::<VehicleRecord>(vehicle_id)
                .ok_or(StoreError::NotFound { entity: "vehicle", id: format!("{vehicle_id:?}") })?;
            if vehicle.status != VehicleStatus::Available {
                return Err(StoreError::Cas { entity: "vehicle", id: format!("{vehicle_id:?}") });
            }
            let fault = world
                .get::<FaultRecord>(fault_id)
                .ok_or(StoreError::NotFound { entity: "fault", id: format!("{fault_id:?}") })?;
            if fault.status != FaultStatus::Waiting {
                return Err(StoreError::Cas { entity: "fault", id: format!("{fault_id:?}") });
            }
        }

        world.get_mut::<VehicleRecord>(vehicle_id).unwrap().status = VehicleStatus::OnRoute;
        {
            let mut fault = world.get_mut::<FaultRecord>(fault_id).unwrap();
            fault.status = FaultStatus::PendingConfirmation;
            fault.assigned_vehicle_id = Some(vehicle_id);
        }
        Ok(())
    }

    // ---- Trip -----------------------------------------------------------

    /// Create a Trip for `vehicle_id`, honoring **I1** (at most one ONGOING
    /// trip per vehicle). Returns the existing ongoing trip id if one exists
    /// instead of creating a duplicate (spec §4.10 "create Trip if none
    /// ONGOING for this vehicle, else reuse").
    pub fn create_or_reuse_ongoing_trip(
        &self,
        vehicle_id: Id,
        driver_id: Option<Id>,
        start_location: LatLon,
        managed_by: Option<Id>,
    ) -> Id {
        let mut world = self.world.lock().unwrap();

        {
            let mut query = world.query::<(Entity, &TripRecord)>();
            if let Some((id, _)) = query
                .iter(&world)
                .find(|(_, t)| t.vehicle_id == vehicle_id && t.status == TripStatus::Ongoing)
            {
                return id;
            }
        }

        world
            .spawn(TripRecord {
                vehicle_id,
                driver_id,
                start_at: Utc::now(),
                end_at: None,
                start_location,
                end_location: None,
                status: TripStatus::Ongoing,
                managed_by,
            })
            .id()
    }

    pub fn get_ongoing_trip_for_vehicle(&self, vehicle_id: Id) -> Option<(Id, TripRecord)> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<(Entity, &TripRecord)>();
        query
            .iter(&world)
            .find(|(_, t)| t.vehicle_id == vehicle_id && t.status == TripStatus::Ongoing)
            .map(|(id, t)| (id, t.clone()))
    }

    pub fn complete_trip(&self, trip_id: Id, end_location: LatLon) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<TripRecord>(trip_id)
            .ok_or(StoreError::NotFound { entity: "trip", id: format!("{trip_id:?}") })?;
        rec.status = TripStatus::Completed;
        rec.end_at = Some(Utc::now());
        rec.end_location = Some(end_location);
        Ok(())
    }

    // ---- Route ------------------------------------------------------

    pub fn create_route(&self, record: RouteRecord) -> Id {
        let mut world = self.world.lock().unwrap();
        world.spawn(record).id()
    }

    pub fn get_route(&self, id: Id) -> Result<RouteRecord, StoreError> {
        let world = self.world.lock().unwrap();
        world
            .get::<RouteRecord>(id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "route", id: format!("{id:?}") })
    }

    /// The single ACTIVE route for (vehicle, fault), honoring **I2**.
    pub fn get_active_route(&self, vehicle_id: Id, fault_id: Id) -> Option<(Id, RouteRecord)> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<(Entity, &RouteRecord)>();
        query
            .iter(&world)
            .find(|(_, r)| {
                r.vehicle_id == vehicle_id && r.fault_id == fault_id && r.status == RouteStatus::Active
            })
            .map(|(id, r)| (id, r.clone()))
    }

    /// The single ACTIVE route for `vehicle_id`, irrespective of fault.
    /// Invariant **I2** guarantees at most one such route per
    /// (vehicle, fault); a vehicle only ever works one fault at a time, so
    /// this is also at most one route per vehicle.
    pub fn get_active_route_for_vehicle(&self, vehicle_id: Id) -> Option<(Id, RouteRecord)> {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<(Entity, &RouteRecord)>();
        query
            .iter(&world)
            .find(|(_, r)| r.vehicle_id == vehicle_id && r.status == RouteStatus::Active)
            .map(|(id, r)| (id, r.clone()))
    }

    /// Cancel any ACTIVE route for `vehicle_id` regardless of fault (sweeper
    /// cleanup path, spec §4.13, which has no fault to key off of).
    pub fn cancel_active_routes_for_vehicle(&self, vehicle_id: Id) {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<&mut RouteRecord>();
        for mut r in query.iter_mut(&mut world) {
            if r.vehicle_id == vehicle_id && r.status == RouteStatus::Active {
                r.status = RouteStatus::Cancelled;
            }
        }
    }

    pub fn set_route_status(&self, id: Id, new: RouteStatus) -> Result<(), StoreError> {
        let mut world = self.world.lock().unwrap();
        let mut rec = world
            .get_mut::<RouteRecord>(id)
            .ok_or(StoreError::NotFound { entity: "route", id: format!("{id:?}") })?;
        rec.status = new;
        Ok(())
    }

    /// Mark all ACTIVE routes for (vehicle, fault) as `new` (resolution path,
    /// spec §4.10: "All ACTIVE Routes for (vehicle, fault) -> CANCELLED or
    /// COMPLETED").
    pub fn close_active_routes(&self, vehicle_id: Id, fault_id: Id, new: RouteStatus) {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<&mut RouteRecord>();
        for mut r in query.iter_mut(&mut world) {
            if r.vehicle_id == vehicle_id && r.fault_id == fault_id && r.status == RouteStatus::Active {
                r.status = new;
            }
        }
    }

    // ---- Alert ------------------------------------------------------

    pub fn create_alert(&self, record: AlertRecord) -> Id {
        let mut world = self.world.lock().unwrap();
        world.spawn(record).id()
    }

    pub fn solve_alerts_for(&self, fault_id: Id, vehicle_id: Id) {
        let mut world = self.world.lock().unwrap();
        let mut query = world.query::<&mut AlertRecord>();
        for mut a in query.iter_mut(&mut world) {
            if a.fault_id == fault_id && a.vehicle_id == vehicle_id {
                a.solved = true;
            }
        }
    }

    // ---- Telemetry ----------------------------------------------------

    pub fn append_telemetry(&self, sample: TelemetrySample) {
        let mut world = self.world.lock().unwrap();
        world.resource_mut::<TelemetryLog>().0.push(sample);
    }

    pub fn latest_telemetry(&self, vehicle_id: Id) -> Option<TelemetrySample> {
        let world = self.world.lock().unwrap();
        world
            .resource::<TelemetryLog>()
            .0
            .iter()
            .rev()
            .find(|s| s.vehicle_id == vehicle_id)
            .copied()
    }
}
