//! Stuck-vehicle sweeper (C13): periodic reconciliation of vehicle status
//! against active work, the long-term backstop for invariant **I4** (no
//! orphan dispatch).
//!
//! Loop shape grounded on `mavkit::event_loop`'s periodic
//! `tokio::select! { _ = interval.tick() => ..., _ = cancel.cancelled() => break }`
//! pattern.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::core::DispatchCore;
use crate::store::VehicleStatus;

/// One sweeper pass (spec §4.13). Exposed standalone so both the background
/// loop and the startup reconciliation pass (spec §5) can call it.
#[instrument(skip(core))]
pub async fn sweep_once(core: &Arc<DispatchCore>) {
    let stuck_candidates: Vec<_> = core
        .store
        .list_vehicles_by_status(VehicleStatus::OnRoute)
        .into_iter()
        .chain(core.store.list_vehicles_by_status(VehicleStatus::Working))
        .collect();

    let mut swept = 0u32;
    for (vehicle_id, _) in stuck_candidates {
        let assigned_fault = core.store.assigned_active_fault_for_vehicle(vehicle_id);
        let has_live_ack = assigned_fault
            .as_ref()
            .map(|(fault_id, _)| core.ack_timers.is_armed(fault_id))
            .unwrap_or(false);

        if assigned_fault.is_some() || has_live_ack {
            continue;
        }

        let _ = core.store.force_vehicle_status(vehicle_id, VehicleStatus::Available);
        core.store.cancel_active_routes_for_vehicle(vehicle_id);
        core.auto_resolve_timers.cancel(&vehicle_id);
        core.cache.delete_by_prefix("vehicle:");
        swept += 1;

        core.events.publish(
            "vehicle:status-change",
            json!({
                "vehicleId": crate::store::id_to_external(vehicle_id),
                "status": "AVAILABLE",
                "updatedFields": { "clearRoute": true },
            }),
        );
    }

    if swept > 0 {
        info!(swept, "sweeper reconciled stuck vehicles");
    }
}

/// Spawns the background sweeper loop, ticking every
/// `config.timers.sweeper_interval` until `cancel` fires.
pub fn spawn_loop(core: Arc<DispatchCore>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let interval_dur: Duration = core.config.timers.sweeper_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval_dur);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_once(&core).await;
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::routing::RouteBackend;
    use crate::store::VehicleRecord;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NullRouteBackend;
    #[async_trait]
    impl RouteBackend for NullRouteBackend {
        async fn route(&self, from: (f64, f64), to: (f64, f64)) -> Result<crate::routing::RouteResult, crate::error::RoutingError> {
            Ok(crate::routing::RouteResult { waypoints: vec![from, to], distance_m: 0.0, duration_s: 0.0, source: "EXTERNAL", is_fallback: false })
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

    fn make_core() -> Arc<DispatchCore> {
        DispatchCore::new(Config::default(), Box::new(NullRouteBackend), Box::new(NullTransport))
    }

    #[tokio::test]
    async fn s6_orphaned_working_vehicle_returns_to_available() {
        let core = make_core();
        let v = core.store.create_vehicle(VehicleRecord {
            number: "V4".into(),
            status: VehicleStatus::Working,
            driver_id: None,
            device_id: None,
        });

        sweep_once(&core).await;

        assert_eq!(core.store.get_vehicle(v).unwrap().status, VehicleStatus::Available);
    }

    #[tokio::test]
    async fn vehicle_with_assigned_fault_is_left_alone() {
        let core = make_core();
        let v = core.store.create_vehicle(VehicleRecord {
            number: "V1".into(),
            status: VehicleStatus::OnRoute,
            driver_id: None,
            device_id: None,
        });
        core.store.create_fault(crate::store::FaultRecord {
            fault_type: "Power".into(),
            location: "X".into(),
            category: crate::store::FaultCategory::Low,
            lat: 0.0,
            lon: 0.0,
            detail: None,
            reported_at: chrono::Utc::now(),
            status: crate::store::FaultStatus::Assigned,
            assigned_vehicle_id: Some(v),
        });

        sweep_once(&core).await;

        assert_eq!(core.store.get_vehicle(v).unwrap().status, VehicleStatus::OnRoute);
    }
}
