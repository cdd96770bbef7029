//! Telemetry handler (C11): ingests position samples, detects arrival, and
//! triggers deviation-driven route recalculation.
//!
//! Generalizes the teacher's telemetry-driven system shape
//! (`systems/pickup_eta_updated.rs`/`movement.rs`: a handler reacting to a
//! position update) off the ECS schedule into a plain async function called
//! directly from the HTTP/device ingress path, since there is no simulation
//! tick driving it here.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::DispatchCore;
use crate::error::DispatchError;
use crate::geo::{deviation_from_route, distance};
use crate::store::{Id, RouteRecord, RouteSource, RouteStatus, TelemetrySample, VehicleStatus};

/// A raw `{vehicleId, lat, lon, speed, timestamp}` sample as it arrives at
/// the HTTP/device boundary (spec §3, §6 `/gps`).
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub vehicle_id: Id,
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
}

/// `onTelemetry` (spec §4.11).
#[instrument(skip(core))]
pub async fn on_telemetry(core: &Arc<DispatchCore>, sample: RawSample) -> Result<(), DispatchError> {
    if !sample.lat.is_finite() {
        return Err(DispatchError::BadCoordinate { field: "lat".into(), value: sample.lat });
    }
    if !sample.lon.is_finite() {
        return Err(DispatchError::BadCoordinate { field: "lon".into(), value: sample.lon });
    }

    let timestamp = Utc::now();
    core.store.append_telemetry(TelemetrySample {
        vehicle_id: sample.vehicle_id,
        lat: sample.lat,
        lon: sample.lon,
        speed: sample.speed,
        timestamp,
    });
    core.cache.delete(&format!("telemetry:{}", crate::store::id_to_external(sample.vehicle_id)));

    core.events.publish(
        "vehicle:gps-update",
        json!({
            "vehicleId": crate::store::id_to_external(sample.vehicle_id),
            "lat": sample.lat,
            "lon": sample.lon,
            "speed": sample.speed,
            "timestamp": timestamp.to_rfc3339(),
        }),
    );

    let vehicle = core.store.get_vehicle(sample.vehicle_id)?;
    if !matches!(vehicle.status, VehicleStatus::OnRoute | VehicleStatus::Working) {
        return Ok(());
    }

    let pos = (sample.lat, sample.lon);

    if let Some((fault_id, fault)) = core.store.assigned_active_fault_for_vehicle(sample.vehicle_id) {
        let d = distance(pos, (fault.lat, fault.lon)).map_err(DispatchError::from)?;
        if d <= core.config.telemetry.arrival_threshold_m {
            handle_arrival(core, sample.vehicle_id, fault_id, d).await?;
            return Ok(());
        }
    }

    // Still en route (either no fault match yet or not within arrival
    // range): check for deviation against the active route, if any.
    if vehicle.status == VehicleStatus::OnRoute {
        if let Some((route_id, route)) = core.store.get_active_route_for_vehicle(sample.vehicle_id) {
            maybe_recalculate_route(core, sample.vehicle_id, route_id, &route, pos).await;
        }
    }

    Ok(())
}

async fn handle_arrival(
    core: &Arc<DispatchCore>,
    vehicle_id: Id,
    fault_id: Id,
    distance_m: f64,
) -> Result<(), DispatchError> {
    // idempotent: promoting an already-WORKING vehicle is a no-op
    let _ = core.store.cas_vehicle_status(vehicle_id, VehicleStatus::OnRoute, VehicleStatus::Working);

    if let Some((route_id, _)) = core.store.get_active_route_for_vehicle(vehicle_id) {
        let _ = core.store.set_route_status(route_id, RouteStatus::Completed);
    }

    if core.config.prototype_mode && !core.auto_resolve_timers.is_armed(&vehicle_id) {
        arm_auto_resolve(core, vehicle_id, fault_id, core.config.timers.auto_resolve);
    }

    info!(?vehicle_id, ?fault_id, distance_m, "vehicle arrived at fault");
    core.events.publish(
        "vehicle:arrived",
        json!({
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "faultId": crate::store::id_to_external(fault_id),
            "distance": distance_m,
        }),
    );
    Ok(())
}

async fn maybe_recalculate_route(
    core: &Arc<DispatchCore>,
    vehicle_id: Id,
    route_id: Id,
    route: &crate::store::RouteRecord,
    pos: (f64, f64),
) {
    let Some(destination) = route.waypoints.last().copied() else { return };
    let Ok(dev) = deviation_from_route(pos, &route.waypoints) else { return };
    let Ok(dist_to_dest) = distance(pos, destination) else { return };

    if dev <= core.config.telemetry.deviation_threshold_m
        || dist_to_dest <= core.config.telemetry.min_dist_to_dest_for_recalc_m
    {
        return;
    }

    let _ = core.store.set_route_status(route_id, RouteStatus::Superseded);

    let new_route = core.routing.compute_route(pos, destination).await;
    let now = Utc::now();
    core.store.create_route(RouteRecord {
        vehicle_id,
        fault_id: route.fault_id,
        waypoints: new_route.waypoints.clone(),
        distance_m: new_route.distance_m,
        duration_s: new_route.duration_s,
        source: if new_route.is_fallback { RouteSource::Fallback } else { RouteSource::External },
        is_fallback: new_route.is_fallback,
        calculated_at: now,
        route_start_at: now,
        status: RouteStatus::Active,
    });

    warn!(?vehicle_id, deviation_m = dev, "route deviation exceeded threshold, recalculated");
    core.events.publish(
        "route:updated",
        json!({
            "vehicleId": crate::store::id_to_external(vehicle_id),
            "faultId": crate::store::id_to_external(route.fault_id),
            "route": {
                "waypoints": new_route.waypoints,
                "distanceM": new_route.distance_m,
                "durationS": new_route.duration_s,
                "source": new_route.source,
                "isFallback": new_route.is_fallback,
                "calculatedAt": now.to_rfc3339(),
                "routeStartAt": now.to_rfc3339(),
            },
        }),
    );
}

pub(crate) fn arm_auto_resolve(core: &Arc<DispatchCore>, vehicle_id: Id, fault_id: Id, duration: std::time::Duration) {
    let core2 = Arc::clone(core);
    core.auto_resolve_timers.arm(vehicle_id, duration, move || {
        Box::pin(async move {
            let vehicle = match core2.store.get_vehicle(vehicle_id) {
                Ok(v) => v,
                Err(_) => return,
            };
            if vehicle.status != VehicleStatus::Working {
                // spec §4.12: "auto-cancel if vehicle status changes away
                // from WORKING" — nothing to do, the timer firing here
                // means that never happened through the cancel path.
                return;
            }
            if let Err(err) =
                crate::fsm::resolve_fault(&core2.store, &core2.events, &core2.auto_resolve_timers, fault_id).await
            {
                warn!(?err, ?fault_id, "auto-resolve failed");
            }
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::routing::RouteBackend;
    use crate::store::{FaultCategory, FaultRecord, FaultStatus, RouteSource, VehicleRecord};
    use async_trait::async_trait;
    use serde_json::Value;

    struct StraightLineBackend;
    #[async_trait]
    impl RouteBackend for StraightLineBackend {
        async fn route(&self, from: (f64, f64), to: (f64, f64)) -> Result<crate::routing::RouteResult, crate::error::RoutingError> {
            let d = distance(from, to).unwrap();
            Ok(crate::routing::RouteResult { waypoints: vec![from, to], distance_m: d, duration_s: d / 13.89, source: "EXTERNAL", is_fallback: false })
        }
    }

    struct NullTransport;
    #[async_trait]
    impl crate::device_channel::DeviceTransport for NullTransport {
        async fn publish(&self, _topic: &str, _payload: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn connect(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn make_core(cfg: Config) -> Arc<DispatchCore> {
        DispatchCore::new(cfg, Box::new(StraightLineBackend), Box::new(NullTransport))
    }

    #[tokio::test]
    async fn arrival_within_threshold_promotes_to_working() {
        let core = make_core(Config { prototype_mode: true, ..Default::default() });
        let v = core.store.create_vehicle(VehicleRecord {
            number: "V1".into(),
            status: VehicleStatus::OnRoute,
            driver_id: None,
            device_id: None,
        });
        let f = core.store.create_fault(FaultRecord {
            fault_type: "Power".into(),
            location: "GulshanBlock3".into(),
            category: FaultCategory::High,
            lat: 24.90,
            lon: 67.05,
            detail: None,
            reported_at: Utc::now(),
            status: FaultStatus::PendingConfirmation,
            assigned_vehicle_id: Some(v),
        });

        on_telemetry(&core, RawSample { vehicle_id: v, lat: 24.90001, lon: 67.05001, speed: 5.0 })
            .await
            .unwrap();

        assert_eq!(core.store.get_vehicle(v).unwrap().status, VehicleStatus::Working);
        assert!(core.auto_resolve_timers.is_armed(&v));
        let _ = f;
    }

    #[tokio::test]
    async fn deviation_beyond_threshold_triggers_recalculation() {
        let core = make_core(Config::default());
        let v = core.store.create_vehicle(VehicleRecord {
            number: "V1".into(),
            status: VehicleStatus::OnRoute,
            driver_id: None,
            device_id: None,
        });
        let route_id = core.store.create_route(RouteRecord {
            vehicle_id: v,
            fault_id: core.store.create_fault(FaultRecord {
                fault_type: "Power".into(),
                location: "X".into(),
                category: FaultCategory::Low,
                lat: 0.0,
                lon: 0.02,
                detail: None,
                reported_at: Utc::now(),
                status: FaultStatus::Assigned,
                assigned_vehicle_id: Some(v),
            }),
            waypoints: vec![(0.0, 0.0), (0.0, 0.02)],
            distance_m: 2224.0,
            duration_s: 160.0,
            source: RouteSource::External,
            is_fallback: false,
            calculated_at: Utc::now(),
            route_start_at: Utc::now(),
            status: RouteStatus::Active,
        });

        // 0.003 deg off latitude at mid-route longitude is ~333m, over the 200m default
        on_telemetry(&core, RawSample { vehicle_id: v, lat: 0.003, lon: 0.01, speed: 10.0 })
            .await
            .unwrap();

        assert_eq!(core.store.get_route(route_id).unwrap().status, RouteStatus::Superseded);
        assert!(core.store.get_active_route_for_vehicle(v).is_some());
    }

    #[tokio::test]
    async fn rejects_non_finite_coordinate() {
        let core = make_core(Config::default());
        let v = core.store.create_vehicle(VehicleRecord {
            number: "V1".into(),
            status: VehicleStatus::Available,
            driver_id: None,
            device_id: None,
        });
        let err = on_telemetry(&core, RawSample { vehicle_id: v, lat: f64::NAN, lon: 0.0, speed: 0.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::BadCoordinate { .. }));
    }
}
