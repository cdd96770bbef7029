//! Fault/Trip/Vehicle FSMs (C10): apply transitions on the store, emit
//! events, maintain invariants.
//!
//! The Vehicle FSM has no transition functions of its own (spec §4.10: "is
//! driven strictly by the events above plus arrival and timeouts; no
//! external mutation path") — its status changes happen as side effects of
//! the Fault FSM functions here, the arrival detection in `telemetry.rs`, and
//! the timer/sweeper reconciliation paths.

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::DispatchError;
use crate::events::EventBus;
use crate::store::{FaultStatus, Id, RouteStatus, Store, VehicleStatus};
use crate::timers::TimerFamily;

fn fault_status_str(status: FaultStatus) -> &'static str {
    match status {
        FaultStatus::Waiting => "WAITING",
        FaultStatus::PendingConfirmation => "PENDING_CONFIRMATION",
        FaultStatus::Assigned => "ASSIGNED",
        FaultStatus::Resolved => "RESOLVED",
    }
}

fn vehicle_status_str(status: VehicleStatus) -> &'static str {
    match status {
        VehicleStatus::Available => "AVAILABLE",
        VehicleStatus::Idle => "IDLE",
        VehicleStatus::OnRoute => "ON_ROUTE",
        VehicleStatus::Working => "WORKING",
    }
}

/// Emits `fault:updated` with the fault's *current* status, used at both
/// call sites the spec's Open Question #1 asks to preserve (on confirm and
/// on resolution) — one function, parameterized by the fault's state at the
/// time it's called, rather than two near-duplicate emitters.
fn emit_fault_updated(events: &EventBus, fault_id: Id, status: FaultStatus) {
    events.publish(
        "fault:updated",
        json!({ "fault": { "id": crate::store::id_to_external(fault_id), "status": fault_status_str(status) } }),
    );
}

fn emit_vehicle_status_change(events: &EventBus, vehicle_id: Id, status: VehicleStatus, clear_route: bool) {
    events.publish(
        "vehicle:status-change",
        json!({
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "status": vehicle_status_str(status),
            "updatedFields": { "clearRoute": clear_route },
        }),
    );
}

/// Confirmation transition: `PENDING_CONFIRMATION -> ASSIGNED`. Idempotent on
/// `fault_id` — calling it again when the fault is already ASSIGNED is a
/// no-op `WrongState` the caller (C14) logs and ignores (spec §4.14).
#[instrument(skip(store, events, ack_timers))]
pub async fn confirm_fault(
    store: &Store,
    events: &EventBus,
    ack_timers: &TimerFamily<Id>,
    fault_id: Id,
) -> Result<(), DispatchError> {
    let fault = store.get_fault(fault_id)?;
    if fault.status != FaultStatus::PendingConfirmation {
        return Err(DispatchError::WrongState {
            entity: "fault".into(),
            expected: "PENDING_CONFIRMATION".into(),
            actual: fault_status_str(fault.status).into(),
        });
    }
    let vehicle_id = fault
        .assigned_vehicle_id
        .ok_or(DispatchError::WrongState {
            entity: "fault".into(),
            expected: "has assignedVehicleId".into(),
            actual: "none".into(),
        })?;

    ack_timers.cancel(&fault_id);

    store.cas_fault_status(fault_id, FaultStatus::PendingConfirmation, FaultStatus::Assigned, None)?;

    let vehicle = store.get_vehicle(vehicle_id)?;
    store.create_or_reuse_ongoing_trip(vehicle_id, vehicle.driver_id, (fault.lat, fault.lon), None);

    info!(?fault_id, ?vehicle_id, "fault confirmed");

    events.publish(
        "vehicle:confirmation",
        json!({
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "vehicleNumber": vehicle.number,
            "faultId": crate::store::id_to_external(fault_id),
            "status": "ASSIGNED",
        }),
    );
    emit_fault_updated(events, fault_id, FaultStatus::Assigned);
    emit_vehicle_status_change(events, vehicle_id, vehicle.status, false);

    Ok(())
}

/// Resolution transition: fault in `{ASSIGNED, PENDING_CONFIRMATION}` ->
/// `RESOLVED` (terminal). Closes the ongoing trip, returns the vehicle to
/// AVAILABLE, closes active routes, and solves the alert (spec §4.10).
#[instrument(skip(store, events, auto_resolve_timers))]
pub async fn resolve_fault(
    store: &Store,
    events: &EventBus,
    auto_resolve_timers: &TimerFamily<Id>,
    fault_id: Id,
) -> Result<(), DispatchError> {
    let fault = store.get_fault(fault_id)?;
    if !matches!(fault.status, FaultStatus::Assigned | FaultStatus::PendingConfirmation) {
        return Err(DispatchError::WrongState {
            entity: "fault".into(),
            expected: "ASSIGNED or PENDING_CONFIRMATION".into(),
            actual: fault_status_str(fault.status).into(),
        });
    }
    let vehicle_id = fault
        .assigned_vehicle_id
        .ok_or(DispatchError::WrongState {
            entity: "fault".into(),
            expected: "has assignedVehicleId".into(),
            actual: "none".into(),
        })?;

    store.force_fault_status(fault_id, FaultStatus::Resolved)?;

    if let Some((trip_id, _)) = store.get_ongoing_trip_for_vehicle(vehicle_id) {
        let _ = store.complete_trip(trip_id, (fault.lat, fault.lon));
    }

    store.force_vehicle_status(vehicle_id, VehicleStatus::Available)?;
    store.close_active_routes(vehicle_id, fault_id, RouteStatus::Completed);
    store.solve_alerts_for(fault_id, vehicle_id);
    auto_resolve_timers.cancel(&vehicle_id);

    let vehicle = store.get_vehicle(vehicle_id)?;
    info!(?fault_id, ?vehicle_id, "fault resolved");

    events.publish(
        "vehicle:resolved",
        json!({
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "vehicleNumber": vehicle.number,
            "faultId": crate::store::id_to_external(fault_id),
            "status": "RESOLVED",
        }),
    );
    emit_fault_updated(events, fault_id, FaultStatus::Resolved);
    emit_vehicle_status_change(events, vehicle_id, VehicleStatus::Available, false);

    Ok(())
}

/// Ack-deadline-fired reset: fault back to WAITING, vehicle back to
/// AVAILABLE, *unless* the vehicle is WORKING with an active fault — spec
/// §4.12/§9 Open Question #3: that edge case is a logged no-op, the sweeper
/// is the long-term authority for reconciling it.
pub async fn reset_on_ack_timeout(
    store: &Store,
    events: &EventBus,
    fault_id: Id,
    anomaly_counter: &std::sync::atomic::AtomicU64,
) -> Result<(), DispatchError> {
    let fault = store.get_fault(fault_id)?;
    if fault.status != FaultStatus::PendingConfirmation {
        return Ok(());
    }
    let vehicle_id = match fault.assigned_vehicle_id {
        Some(v) => v,
        None => return Ok(()),
    };
    let vehicle = store.get_vehicle(vehicle_id)?;

    if vehicle.status == VehicleStatus::Working {
        warn!(?fault_id, ?vehicle_id, "ack timeout fired while vehicle is WORKING; no-op per policy");
        anomaly_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return Ok(());
    }

    store.force_fault_status(fault_id, FaultStatus::Waiting)?;
    store.set_fault_assigned_vehicle(fault_id, None)?;
    store.force_vehicle_status(vehicle_id, VehicleStatus::Available)?;

    emit_fault_updated(events, fault_id, FaultStatus::Waiting);
    emit_vehicle_status_change(events, vehicle_id, VehicleStatus::Available, false);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultCategory, FaultRecord, VehicleRecord};

    fn fault(status: FaultStatus, assigned: Option<Id>) -> FaultRecord {
        FaultRecord {
            fault_type: "Power".into(),
            location: "GulshanBlock3".into(),
            category: FaultCategory::High,
            lat: 24.90,
            lon: 67.05,
            detail: None,
            reported_at: Utc::now(),
            status,
            assigned_vehicle_id: assigned,
        }
    }

    fn vehicle(status: VehicleStatus) -> VehicleRecord {
        VehicleRecord { number: "V1".into(), status, driver_id: None, device_id: None }
    }

    #[tokio::test]
    async fn confirm_moves_fault_to_assigned_and_creates_trip() {
        let store = Store::new();
        let events = EventBus::new();
        let ack_timers: TimerFamily<Id> = TimerFamily::new("ack");

        let v = store.create_vehicle(vehicle(VehicleStatus::OnRoute));
        let f = store.create_fault(fault(FaultStatus::PendingConfirmation, Some(v)));

        confirm_fault(&store, &events, &ack_timers, f).await.unwrap();

        assert_eq!(store.get_fault(f).unwrap().status, FaultStatus::Assigned);
        assert!(store.get_ongoing_trip_for_vehicle(v).is_some());
    }

    #[tokio::test]
    async fn resolve_completes_trip_and_frees_vehicle() {
        let store = Store::new();
        let events = EventBus::new();
        let ack_timers: TimerFamily<Id> = TimerFamily::new("ack");
        let auto_timers: TimerFamily<Id> = TimerFamily::new("auto");

        let v = store.create_vehicle(vehicle(VehicleStatus::OnRoute));
        let f = store.create_fault(fault(FaultStatus::PendingConfirmation, Some(v)));
        confirm_fault(&store, &events, &ack_timers, f).await.unwrap();
        let (trip_id, _) = store.get_ongoing_trip_for_vehicle(v).unwrap();

        resolve_fault(&store, &events, &auto_timers, f).await.unwrap();

        assert_eq!(store.get_fault(f).unwrap().status, FaultStatus::Resolved);
        assert_eq!(store.get_vehicle(v).unwrap().status, VehicleStatus::Available);
        assert!(store.get_ongoing_trip_for_vehicle(v).is_none());
        let _ = trip_id;
    }

    #[tokio::test]
    async fn ack_timeout_noop_when_vehicle_working() {
        let store = Store::new();
        let events = EventBus::new();
        let anomaly = std::sync::atomic::AtomicU64::new(0);

        let v = store.create_vehicle(vehicle(VehicleStatus::Working));
        let f = store.create_fault(fault(FaultStatus::PendingConfirmation, Some(v)));

        reset_on_ack_timeout(&store, &events, f, &anomaly).await.unwrap();

        assert_eq!(store.get_fault(f).unwrap().status, FaultStatus::PendingConfirmation);
        assert_eq!(anomaly.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
