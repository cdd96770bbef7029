//! Dispatch engine (C9): selects the best eligible vehicle for a fault,
//! reserves it, arms the acknowledgement deadline (or auto-confirms in
//! prototype mode), and persists the initial route + alert.
//!
//! New module — no direct teacher counterpart — orchestrating C2/C4/C5/C6/
//! C7/C8/C12 per spec §4.9. The per-fault/per-vehicle lock acquisition
//! follows the canonical order from `store::canonical_order` (spec §5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::DispatchCore;
use crate::error::DispatchError;
use crate::ml_client::Features;
use crate::scorer::{self, ScoringInputs};
use crate::store::{
    AlertRecord, FaultCategory, FaultStatus, Id, RouteRecord, RouteSource, RouteStatus,
    VehicleRecord, VehicleStatus,
};

/// Outcome of a single `dispatch_fault` call that is not itself an error —
/// `NoCandidate` and the reserved vehicle both leave the fault in a defined
/// state, so they're reported rather than only logged (spec §C "Structured
/// dispatch-result summaries").
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched { vehicle_id: Id, vehicle_number: String },
    NoCandidate,
}

fn distance_cat(distance_m: f64) -> u8 {
    if distance_m < 5_000.0 {
        0
    } else if distance_m < 10_000.0 {
        1
    } else {
        2
    }
}

fn severity_of(category: FaultCategory) -> u8 {
    match category {
        FaultCategory::Low => 1,
        FaultCategory::Medium => 2,
        FaultCategory::High => 3,
    }
}

/// `dispatchFault` (spec §4.9). Requires the fault to be WAITING; leaves it
/// untouched on `NoCandidate`, `WrongState`, or `Contended`.
#[instrument(skip(core))]
pub async fn dispatch_fault(core: &Arc<DispatchCore>, fault_id: Id) -> Result<DispatchOutcome, DispatchError> {
    let fault = core.store.get_fault(fault_id)?;
    if fault.status != FaultStatus::Waiting {
        return Err(DispatchError::WrongState {
            entity: "fault".into(),
            expected: "WAITING".into(),
            actual: format!("{:?}", fault.status),
        });
    }

    let strict = !core.config.prototype_mode;
    let candidates: Vec<(Id, VehicleRecord)> = core
        .store
        .list_vehicles_by_status(VehicleStatus::Available)
        .into_iter()
        .filter(|(_, v)| !strict || v.device_id.is_some())
        .filter(|(id, _)| !core.is_timed_out(fault_id, *id))
        .collect();

    if candidates.is_empty() {
        return Ok(DispatchOutcome::NoCandidate);
    }

    let chosen = select_vehicle(core, &fault, &candidates).await;

    let (vehicle_id, vehicle) = chosen;

    {
        let (first, second) = crate::store::canonical_order(vehicle_id, fault_id);
        let _guards = core.locks.lock_two(&first, &second).await;

        match core.store.reserve(vehicle_id, fault_id) {
            Ok(()) => {}
            Err(_) => {
                // one retry, per spec §4.4/§7 "Contended" policy
                match core.store.reserve(vehicle_id, fault_id) {
                    Ok(()) => {}
                    Err(err) => return Err(DispatchError::from(err)),
                }
            }
        }
    }

    core.cache.delete_by_prefix("vehicle:");
    core.cache.delete_by_prefix("fault:");

    let origin = core
        .store
        .latest_telemetry(vehicle_id)
        .map(|t| (t.lat, t.lon))
        .unwrap_or(core.config.routing.default_location);
    let destination = (fault.lat, fault.lon);
    let route_result = core.routing.compute_route(origin, destination).await;
    core.store.create_route(RouteRecord {
        vehicle_id,
        fault_id,
        waypoints: route_result.waypoints.clone(),
        distance_m: route_result.distance_m,
        duration_s: route_result.duration_s,
        source: if route_result.is_fallback { RouteSource::Fallback } else { RouteSource::External },
        is_fallback: route_result.is_fallback,
        calculated_at: Utc::now(),
        route_start_at: Utc::now(),
        status: RouteStatus::Active,
    });

    core.store.create_alert(AlertRecord {
        fault_id,
        vehicle_id,
        priority: fault.category.into(),
        solved: false,
        acknowledged_by: None,
        timestamp: Utc::now(),
    });

    let device = core.store.get_device_for_vehicle(vehicle_id);
    if let Some(device) = &device {
        core.device
            .dispatch_command(
                &device.external_device_id,
                crate::store::id_to_external(fault_id).to_string(),
                json!({
                    "type": fault.fault_type,
                    "location": fault.location,
                    "category": format!("{:?}", fault.category).to_uppercase(),
                    "lat": fault.lat,
                    "lon": fault.lon,
                    "detail": fault.detail,
                }),
            )
            .await;
    }

    info!(?fault_id, ?vehicle_id, "fault dispatched");

    // Emit the reservation's own event block before any downstream FSM call
    // (the prototype-mode auto-confirm below) so a single fault's event
    // sequence is always a prefix of `fault:created, fault:dispatched,
    // vehicle:confirmation, ...` (spec §8 property 8) — at this point the
    // fault is still PENDING_CONFIRMATION regardless of what happens next.
    core.events.publish(
        "fault:dispatched",
        json!({
            "faultId": crate::store::id_to_external(fault_id),
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "vehicleNumber": vehicle.number,
            "status": "PENDING_CONFIRMATION",
            "faultLat": fault.lat,
            "faultLon": fault.lon,
            "vehicleLat": origin.0,
            "vehicleLon": origin.1,
        }),
    );
    core.events.publish(
        "vehicle:status-change",
        json!({
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "status": "ON_ROUTE",
            "updatedFields": { "clearRoute": false },
        }),
    );
    core.events.publish(
        "fault:updated",
        json!({ "fault": { "id": crate::store::id_to_external(fault_id), "status": "PENDING_CONFIRMATION" } }),
    );
    core.events.publish(
        "dispatch:complete",
        json!({
            "faultId": crate::store::id_to_external(fault_id),
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "vehicleNumber": vehicle.number,
            "dispatchResult": "DISPATCHED",
        }),
    );

    if device.is_some() {
        arm_ack_deadline(core, fault_id, vehicle_id, core.config.timers.ack_deadline);
    } else {
        // prototype-mode, device-less vehicle: auto-confirm immediately,
        // no ack deadline (spec §4.9 step 11, Open Question #2).
        if let Err(err) = crate::fsm::confirm_fault(&core.store, &core.events, &core.ack_timers, fault_id).await {
            warn!(?err, ?fault_id, "auto-confirm after device-less dispatch failed");
        }
    }

    Ok(DispatchOutcome::Dispatched { vehicle_id, vehicle_number: vehicle.number })
}

async fn select_vehicle(
    core: &Arc<DispatchCore>,
    fault: &crate::store::FaultRecord,
    candidates: &[(Id, VehicleRecord)],
) -> (Id, VehicleRecord) {
    if let Some(ml) = &core.ml {
        if core.config.dispatch_engine == crate::config::DispatchEngine::Ml {
            let features: Vec<Features> = candidates
                .iter()
                .map(|(id, _)| build_ml_features(core, *id, fault))
                .collect();
            match ml.predict(&features).await {
                Ok(best_index) => {
                    return candidates[best_index].clone();
                }
                Err(err) => {
                    warn!(?err, "ML scorer unavailable, falling back to rule-based");
                }
            }
        }
    }

    rule_based_select(core, fault, candidates)
}

fn rule_based_select(
    core: &Arc<DispatchCore>,
    fault: &crate::store::FaultRecord,
    candidates: &[(Id, VehicleRecord)],
) -> (Id, VehicleRecord) {
    let mut inputs = ScoringInputs::default();
    for (id, _) in candidates {
        let history = core.store.faults_assigned_to(*id);
        scorer::precompute_for_vehicle(*id, &history, fault, &mut inputs);
    }
    let ids: Vec<Id> = candidates.iter().map(|(id, _)| *id).collect();
    let best = scorer::choose_best(&ids, fault.category, &inputs).expect("candidates is non-empty");
    candidates.iter().find(|(id, _)| *id == best).cloned().unwrap()
}

fn build_ml_features(core: &Arc<DispatchCore>, vehicle_id: Id, fault: &crate::store::FaultRecord) -> Features {
    let history = core.store.faults_assigned_to(vehicle_id);
    let assigned = history.len() as f64;
    let resolved = history.iter().filter(|f| f.status == FaultStatus::Resolved).count() as f64;
    let ratio = if assigned == 0.0 { 0.5 } else { resolved / assigned };
    let past_perf = (ratio * 9.0 + 1.0).clamp(1.0, 10.0);

    let fault_history =
        history.iter().filter(|f| f.status == FaultStatus::Resolved && f.fault_type == fault.fault_type).count() as u32;

    let midnight_today = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
    let fatigue_h = (history.iter().filter(|f| f.reported_at >= midnight_today).count() as f64).min(24.0);

    let origin = core
        .store
        .latest_telemetry(vehicle_id)
        .map(|t| (t.lat, t.lon))
        .unwrap_or(core.config.routing.default_location);
    let distance_m = crate::geo::distance(origin, (fault.lat, fault.lon)).unwrap_or(0.0);

    Features {
        distance_m,
        distance_cat: distance_cat(distance_m),
        past_perf,
        fault_history,
        fatigue_h,
        fault_severity: severity_of(fault.category),
    }
}

pub(crate) fn arm_ack_deadline(core: &Arc<DispatchCore>, fault_id: Id, vehicle_id: Id, duration: Duration) {
    let core2 = Arc::clone(core);
    core.ack_timers.arm(fault_id, duration, move || {
        Box::pin(async move {
            core2.mark_timed_out(fault_id, vehicle_id);
            if let Err(err) =
                crate::fsm::reset_on_ack_timeout(&core2.store, &core2.events, fault_id, &core2.anomaly_counter).await
            {
                warn!(?err, ?fault_id, "ack-timeout reset failed");
            }
            core2.cache.delete_by_prefix("vehicle:");
            core2.cache.delete_by_prefix("fault:");
            match dispatch_fault(&core2, fault_id).await {
                Ok(_) | Err(DispatchError::NoCandidate) | Err(DispatchError::WrongState { .. }) => {}
                Err(err) => warn!(?err, ?fault_id, "re-dispatch after ack timeout failed"),
            }
        })
    });
}

/// `runBatch` (spec §4.9): drains WAITING faults oldest-first, stopping
/// after a safety cap of 100 iterations per invocation.
const BATCH_CAP: usize = 100;

#[derive(Debug, Default)]
pub struct BatchResult {
    pub dispatched: u32,
    pub failed: u32,
    pub results: Vec<(Id, Result<DispatchOutcome, DispatchError>)>,
}

#[instrument(skip(core))]
pub async fn run_batch(core: &Arc<DispatchCore>) -> BatchResult {
    let mut result = BatchResult::default();
    // Faults already hit with `NoCandidate` this invocation, so the next
    // iteration's "oldest WAITING fault" pick advances past them instead of
    // re-selecting the same one forever.
    let mut skipped: std::collections::HashSet<Id> = std::collections::HashSet::new();

    for _ in 0..BATCH_CAP {
        let waiting = core.store.list_faults_by_status(FaultStatus::Waiting);
        let Some((fault_id, _)) = waiting.into_iter().find(|(id, _)| !skipped.contains(id)) else { break };

        let outcome = dispatch_fault(core, fault_id).await;
        let is_no_candidate = matches!(outcome, Ok(DispatchOutcome::NoCandidate));
        match &outcome {
            Ok(DispatchOutcome::Dispatched { .. }) => result.dispatched += 1,
            Ok(DispatchOutcome::NoCandidate) => {}
            Err(_) => result.failed += 1,
        }
        result.results.push((fault_id, outcome));

        if is_no_candidate {
            // Stop only on a genuine lack of global availability (spec
            // §4.9); a fault excluded only by its own timed-out set should
            // not abort faults further down the WAITING queue.
            if core.store.list_vehicles_by_status(VehicleStatus::Available).is_empty() {
                break;
            }
            skipped.insert(fault_id);
        }
    }

    result
}
