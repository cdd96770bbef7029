//! HTTP surface (spec §6): fault ingress, the dispatch trigger, telemetry
//! ingress, and the route-query endpoint. Authentication/authorization,
//! the transport framing itself, and device-broker plumbing are out of
//! scope (spec §1) — these handlers are a thin translation layer onto
//! `DispatchCore`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use dispatch_core::core::DispatchCore;
use dispatch_core::error::DispatchError;
use dispatch_core::store::{external_to_id, id_to_external, FaultCategory, FaultRecord, FaultStatus};
use dispatch_core::telemetry::RawSample;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

pub type AppState = Arc<DispatchCore>;

fn error_response(err: DispatchError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        DispatchError::Contended { .. } => StatusCode::CONFLICT,
        DispatchError::WrongState { .. } | DispatchError::NoCandidate | DispatchError::BadCoordinate { .. } => {
            StatusCode::BAD_REQUEST
        }
        DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

// ---- POST /faults --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateFaultRequest {
    #[serde(rename = "type")]
    pub fault_type: String,
    pub location: String,
    pub category: FaultCategoryWire,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultCategoryWire {
    High,
    Medium,
    Low,
}

impl From<FaultCategoryWire> for FaultCategory {
    fn from(w: FaultCategoryWire) -> Self {
        match w {
            FaultCategoryWire::High => FaultCategory::High,
            FaultCategoryWire::Medium => FaultCategory::Medium,
            FaultCategoryWire::Low => FaultCategory::Low,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateFaultResponse {
    #[serde(rename = "faultId")]
    pub fault_id: u64,
    pub status: &'static str,
}

pub async fn create_fault(
    State(core): State<AppState>,
    Json(body): Json<CreateFaultRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let (lat, lon) = match (body.lat, body.lon) {
        (Some(lat), Some(lon)) => {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(error_response(DispatchError::BadCoordinate { field: "lat".into(), value: lat }));
            }
            if !(-180.0..=180.0).contains(&lon) {
                return Err(error_response(DispatchError::BadCoordinate { field: "lon".into(), value: lon }));
            }
            (lat, lon)
        }
        _ => core.config.routing.default_location,
    };

    let category: FaultCategory = body.category.into();
    let fault_type = body.fault_type.clone();
    let location = body.location.clone();
    let reported_at = Utc::now();

    let fault_id = core.store.create_fault(FaultRecord {
        fault_type: body.fault_type,
        location: body.location,
        category,
        lat,
        lon,
        detail: body.detail,
        reported_at,
        status: FaultStatus::Waiting,
        assigned_vehicle_id: None,
    });

    core.events.publish(
        "fault:created",
        json!({
            "fault": {
                "id": id_to_external(fault_id),
                "type": fault_type,
                "location": location,
                "category": format!("{:?}", category).to_uppercase(),
                "lat": lat,
                "lon": lon,
                "status": "WAITING",
                "reportedAt": reported_at.to_rfc3339(),
            }
        }),
    );

    let core_for_dispatch = core.clone();
    tokio::spawn(async move {
        if let Err(err) = DispatchCore::dispatch_fault(&core_for_dispatch, fault_id).await {
            warn!(?err, ?fault_id, "asynchronous dispatch after fault ingress did not complete");
        }
    });

    Ok((StatusCode::CREATED, Json(CreateFaultResponse { fault_id: id_to_external(fault_id), status: "WAITING" })))
}

// ---- POST /dispatch/run --------------------------------------------------

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub dispatched: u32,
    pub failed: u32,
    pub results: Vec<BatchResultItem>,
}

#[derive(Debug, Serialize)]
pub struct BatchResultItem {
    #[serde(rename = "faultId")]
    pub fault_id: u64,
    pub outcome: String,
}

pub async fn run_dispatch(State(core): State<AppState>) -> Json<BatchResponse> {
    let result = DispatchCore::run_batch(&core).await;
    Json(BatchResponse {
        dispatched: result.dispatched,
        failed: result.failed,
        results: result
            .results
            .into_iter()
            .map(|(fault_id, outcome)| BatchResultItem {
                fault_id: id_to_external(fault_id),
                outcome: match outcome {
                    Ok(o) => format!("{o:?}"),
                    Err(err) => err.to_string(),
                },
            })
            .collect(),
    })
}

// ---- POST /gps ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GpsRequest {
    #[serde(rename = "vehicleId")]
    pub vehicle_id: u64,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
}

pub async fn post_gps(
    State(core): State<AppState>,
    Json(body): Json<GpsRequest>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let sample = RawSample {
        vehicle_id: external_to_id(body.vehicle_id),
        lat: body.lat,
        lon: body.lon,
        speed: body.speed.unwrap_or(0.0),
    };
    DispatchCore::on_telemetry(&core, sample).await.map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

// ---- GET /routes/calculate ------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    #[serde(rename = "fromLat")]
    pub from_lat: f64,
    #[serde(rename = "fromLng")]
    pub from_lng: f64,
    #[serde(rename = "toLat")]
    pub to_lat: f64,
    #[serde(rename = "toLng")]
    pub to_lng: f64,
}

pub async fn calculate_route(State(core): State<AppState>, Query(q): Query<RouteQuery>) -> Json<serde_json::Value> {
    let result = core.routing.compute_route((q.from_lat, q.from_lng), (q.to_lat, q.to_lng)).await;
    Json(json!({
        "waypoints": result.waypoints,
        "distanceM": result.distance_m,
        "durationS": result.duration_s,
        "source": result.source,
        "isFallback": result.is_fallback,
        "calculatedAt": Utc::now().to_rfc3339(),
    }))
}

// ---- GET /healthz -----------------------------------------------------

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
