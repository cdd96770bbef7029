//! `DispatchCore` (spec §9): the single context value that replaces the
//! source's global mutable singletons — timer maps, timed-out sets, the
//! circuit breaker — with explicit, passed-around state guarded by
//! fine-grained locks.
//!
//! Owns every collaborator C2-C8/C12 and exposes the handful of entry
//! points the HTTP boundary and device-protocol layer call into
//! (`dispatch_fault`, `run_batch`, `on_telemetry`, `on_confirmation`,
//! `on_resolution`). Must be held behind an `Arc` since armed timers
//! capture a clone of it for their `on_fire` callback.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, instrument};

use crate::cache::Cache;
use crate::config::Config;
use crate::device_channel::{DeviceChannel, DeviceTransport};
use crate::dispatch::{self, BatchResult, DispatchOutcome};
use crate::error::DispatchError;
use crate::events::EventBus;
use crate::locks::KeyedMutexMap;
use crate::ml_client::MlClient;
use crate::routing::{RouteBackend, RoutingClient};
use crate::store::{FaultStatus, Id, Store, VehicleStatus};
use crate::telemetry::{self, RawSample};
use crate::timers::TimerFamily;

pub struct DispatchCore {
    pub config: Config,
    pub store: Store,
    pub events: EventBus,
    pub cache: Cache,
    pub routing: RoutingClient,
    pub ml: Option<MlClient>,
    pub device: DeviceChannel,
    pub ack_timers: TimerFamily<Id>,
    pub auto_resolve_timers: TimerFamily<Id>,
    pub locks: KeyedMutexMap<Id>,
    pub anomaly_counter: AtomicU64,
    timed_out: DashMap<Id, HashSet<Id>>,
}

impl DispatchCore {
    pub fn new(
        config: Config,
        routing_backend: Box<dyn RouteBackend>,
        device_transport: Box<dyn DeviceTransport>,
    ) -> Arc<Self> {
        let ml = if config.ml.enabled { Some(MlClient::new(config.ml.clone())) } else { None };
        let routing = RoutingClient::new(routing_backend, &config.routing);
        let device = DeviceChannel::new(device_transport);

        Arc::new(Self {
            store: Store::new(),
            events: EventBus::new(),
            cache: Cache::new(),
            routing,
            ml,
            device,
            ack_timers: TimerFamily::new("ack-deadline"),
            auto_resolve_timers: TimerFamily::new("auto-resolve"),
            locks: KeyedMutexMap::new(),
            anomaly_counter: AtomicU64::new(0),
            timed_out: DashMap::new(),
            config,
        })
    }

    pub fn is_timed_out(&self, fault_id: Id, vehicle_id: Id) -> bool {
        self.timed_out.get(&fault_id).map(|set| set.contains(&vehicle_id)).unwrap_or(false)
    }

    pub fn mark_timed_out(&self, fault_id: Id, vehicle_id: Id) {
        self.timed_out.entry(fault_id).or_default().insert(vehicle_id);
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_counter.load(Ordering::Relaxed)
    }

    // ---- public entry points, spec §6 ---------------------------------

    #[instrument(skip(self_arc))]
    pub async fn dispatch_fault(self_arc: &Arc<Self>, fault_id: Id) -> Result<DispatchOutcome, DispatchError> {
        dispatch::dispatch_fault(self_arc, fault_id).await
    }

    #[instrument(skip(self_arc))]
    pub async fn run_batch(self_arc: &Arc<Self>) -> BatchResult {
        dispatch::run_batch(self_arc).await
    }

    #[instrument(skip(self_arc))]
    pub async fn on_telemetry(self_arc: &Arc<Self>, sample: RawSample) -> Result<(), DispatchError> {
        telemetry::on_telemetry(self_arc, sample).await
    }

    pub async fn on_confirmation(&self, fault_id: Id) -> Result<(), DispatchError> {
        crate::fsm::confirm_fault(&self.store, &self.events, &self.ack_timers, fault_id).await
    }

    pub async fn on_resolution(&self, fault_id: Id) -> Result<(), DispatchError> {
        crate::fsm::resolve_fault(&self.store, &self.events, &self.auto_resolve_timers, fault_id).await
    }

    /// Crash-safety timer rebuild (spec §5): scans for faults in
    /// `PENDING_CONFIRMATION` (re-arm the ack deadline with an immediate
    /// fire) and vehicles `WORKING` with an `ASSIGNED` fault in prototype
    /// mode (re-arm the auto-resolve deadline with its full duration — see
    /// `DESIGN.md` §D.4). Call once at process startup, before serving
    /// traffic; the first sweeper tick after that reconciles anything this
    /// pass doesn't cover.
    #[instrument(skip(self_arc))]
    pub async fn rebuild_timers_on_startup(self_arc: &Arc<Self>) {
        let pending = self_arc.store.list_faults_by_status(FaultStatus::PendingConfirmation);
        for (fault_id, fault) in pending {
            let Some(vehicle_id) = fault.assigned_vehicle_id else { continue };
            info!(?fault_id, ?vehicle_id, "rebuilding ack deadline with immediate fire");
            dispatch::arm_ack_deadline(self_arc, fault_id, vehicle_id, std::time::Duration::ZERO);
        }

        if self_arc.config.prototype_mode {
            let working = self_arc.store.list_vehicles_by_status(VehicleStatus::Working);
            for (vehicle_id, _) in working {
                let Some((fault_id, _)) = self_arc.store.assigned_active_fault_for_vehicle(vehicle_id) else {
                    continue;
                };
                info!(?fault_id, ?vehicle_id, "rebuilding auto-resolve deadline at full duration");
                telemetry::arm_auto_resolve(self_arc, vehicle_id, fault_id, self_arc.config.timers.auto_resolve);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
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
    impl DeviceTransport for NullTransport {
        async fn publish(&self, _topic: &str, _payload: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn connect(&self) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn startup_rebuild_immediately_fires_pending_ack_deadline() {
        let core = DispatchCore::new(Config::default(), Box::new(NullRouteBackend), Box::new(NullTransport));
        let v = core.store.create_vehicle(crate::store::VehicleRecord {
            number: "V1".into(),
            status: VehicleStatus::OnRoute,
            driver_id: None,
            device_id: None,
        });
        let f = core.store.create_fault(crate::store::FaultRecord {
            fault_type: "Power".into(),
            location: "X".into(),
            category: crate::store::FaultCategory::Low,
            lat: 0.0,
            lon: 0.0,
            detail: None,
            reported_at: chrono::Utc::now(),
            status: FaultStatus::PendingConfirmation,
            assigned_vehicle_id: Some(v),
        });

        DispatchCore::rebuild_timers_on_startup(&core).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(core.store.get_fault(f).unwrap().status, FaultStatus::Waiting);
    }
}
