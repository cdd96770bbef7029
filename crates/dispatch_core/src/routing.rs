//! Routing collaborator client (C2).
//!
//! Keeps the teacher's pluggable-backend shape (`RouteProvider` trait +
//! `Box<dyn RouteProvider>`, see the old H3/OSRM/precomputed providers this
//! module replaces) but generalizes it to plain lat/lon coordinates, swaps
//! the blocking `reqwest::blocking::Client` for an async one, and adds the
//! circuit breaker and TTL cache the spec requires in front of it. The
//! breaker's state machine is grounded on
//! `seanchatmangpt-knhk/.../connectors/resilience.rs`'s `CircuitBreaker`
//! (atomic state + failure counter), trimmed to the CLOSED/OPEN/HALF_OPEN
//! states and single-trial half-open spec §4.2 specifies.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::RoutingConfig;
use crate::geo::{distance, LatLon};

/// Result of a route query between two points, matching the `Route` shape
/// spec §3/§6 describes (store persistence of the full `Route` entity is
/// layered on top by `dispatch.rs`/`telemetry.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub waypoints: Vec<LatLon>,
    pub distance_m: f64,
    pub duration_s: f64,
    pub source: &'static str,
    pub is_fallback: bool,
}

/// Pluggable routing backend. Implementations must be `Send + Sync` so the
/// client can hold one behind a trait object, same shape as the teacher's
/// `RouteProvider`.
#[async_trait::async_trait]
pub trait RouteBackend: Send + Sync {
    async fn route(&self, from: LatLon, to: LatLon) -> Result<RouteResult, crate::error::RoutingError>;
}

/// Calls an external HTTP driving-routing provider.
pub struct HttpRouteBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouteBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self { client, base_url: base_url.into() }
    }
}

#[derive(Deserialize)]
struct ProviderResponse {
    waypoints: Vec<(f64, f64)>,
    distance_m: f64,
    duration_s: f64,
}

#[async_trait::async_trait]
impl RouteBackend for HttpRouteBackend {
    async fn route(&self, from: LatLon, to: LatLon) -> Result<RouteResult, crate::error::RoutingError> {
        let url = format!(
            "{}/route?from_lat={}&from_lon={}&to_lat={}&to_lon={}",
            self.base_url.trim_end_matches('/'),
            from.0,
            from.1,
            to.0,
            to.1
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(crate::error::RoutingError::BadResponse(format!(
                "status {}",
                resp.status()
            )));
        }
        let body: ProviderResponse = resp.json().await?;
        Ok(RouteResult {
            waypoints: body.waypoints,
            distance_m: body.distance_m,
            duration_s: body.duration_s,
            source: "EXTERNAL",
            is_fallback: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(v: u8) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// CLOSED -> (N consecutive failures) -> OPEN for `open_duration` -> one
/// HALF_OPEN trial -> CLOSED on success or back to OPEN on failure. Spec
/// §4.2 has no "half-open allows K calls" provision like the teacher's
/// `resilience.rs` source does — it is a single trial, modeled here as
/// "the first call after the open window elapses".
struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    opened_at_epoch_ms: AtomicU64,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: AtomicU8::new(BreakerState::Closed as u8),
            failure_count: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicU64::new(0),
            failure_threshold,
            open_duration,
        }
    }

    fn allow(&self) -> bool {
        match BreakerState::from(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = self.opened_at_epoch_ms.load(Ordering::Acquire);
                let now = Utc::now().timestamp_millis() as u64;
                if now.saturating_sub(opened_at) >= self.open_duration.as_millis() as u64 {
                    self.state
                        .store(BreakerState::HalfOpen as u8, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.state.store(BreakerState::Closed as u8, Ordering::Release);
    }

    fn on_failure(&self) {
        match BreakerState::from(self.state.load(Ordering::Acquire)) {
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self) {
        warn!("routing circuit breaker opening");
        self.opened_at_epoch_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
        self.state.store(BreakerState::Open as u8, Ordering::Release);
    }
}

fn round_coord(v: f64) -> i64 {
    (v * 10_000.0).round() as i64
}

fn cache_key(from: LatLon, to: LatLon) -> String {
    format!(
        "route:{}:{}:{}:{}",
        round_coord(from.0),
        round_coord(from.1),
        round_coord(to.0),
        round_coord(to.1)
    )
}

/// The routing collaborator client: cache + circuit breaker in front of a
/// pluggable `RouteBackend`, degrading to the straight-line fallback on any
/// failure (never surfaces an error to its caller, spec §4.2).
pub struct RoutingClient {
    backend: Box<dyn RouteBackend>,
    breaker: CircuitBreaker,
    cache: Cache,
    cache_ttl: Duration,
}

impl RoutingClient {
    pub fn new(backend: Box<dyn RouteBackend>, cfg: &RoutingConfig) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(cfg.breaker_fails, cfg.breaker_open),
            cache: Cache::new(),
            cache_ttl: cfg.cache_ttl,
        }
    }

    fn fallback(from: LatLon, to: LatLon) -> RouteResult {
        let distance_m = distance(from, to).unwrap_or(0.0);
        RouteResult {
            waypoints: vec![from, to],
            distance_m,
            duration_s: distance_m / 13.89,
            source: "FALLBACK",
            is_fallback: true,
        }
    }

    pub async fn compute_route(&self, from: LatLon, to: LatLon) -> RouteResult {
        let key = cache_key(from, to);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(result) = serde_json::from_str::<RouteResult>(&cached) {
                return result;
            }
        }

        if !self.breaker.allow() {
            debug!("routing breaker open, short-circuiting to fallback");
            return Self::fallback(from, to);
        }

        match self.backend.route(from, to).await {
            Ok(result) => {
                self.breaker.on_success();
                if let Ok(serialized) = serde_json::to_string(&result) {
                    self.cache.set(key, serialized, self.cache_ttl);
                }
                result
            }
            Err(err) => {
                warn!(error = %err, "routing collaborator failed, degrading to fallback");
                self.breaker.on_failure();
                Self::fallback(from, to)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl RouteBackend for AlwaysFails {
        async fn route(&self, _from: LatLon, _to: LatLon) -> Result<RouteResult, crate::error::RoutingError> {
            Err(crate::error::RoutingError::BadResponse("boom".into()))
        }
    }

    struct CountingBackend(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl RouteBackend for CountingBackend {
        async fn route(&self, from: LatLon, to: LatLon) -> Result<RouteResult, crate::error::RoutingError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RouteResult {
                waypoints: vec![from, to],
                distance_m: 1000.0,
                duration_s: 60.0,
                source: "EXTERNAL",
                is_fallback: false,
            })
        }
    }

    #[tokio::test]
    async fn degrades_to_fallback_after_repeated_failures() {
        let cfg = RoutingConfig { breaker_fails: 3, ..Default::default() };
        let client = RoutingClient::new(Box::new(AlwaysFails), &cfg);

        for _ in 0..3 {
            let r = client.compute_route((0.0, 0.0), (0.0, 1.0)).await;
            assert_eq!(r.source, "FALLBACK");
            assert!(r.is_fallback);
        }

        // breaker now open; still degrades without calling the backend
        let r = client.compute_route((0.0, 0.0), (0.0, 1.0)).await;
        assert_eq!(r.source, "FALLBACK");
    }

    #[tokio::test]
    async fn cache_hit_skips_backend_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cfg = RoutingConfig::default();
        let client = RoutingClient::new(Box::new(CountingBackend(calls.clone())), &cfg);

        let from = (24.9, 67.05);
        let to = (24.91, 67.06);
        client.compute_route(from, to).await;
        client.compute_route(from, to).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_distance_matches_haversine() {
        let cfg = RoutingConfig::default();
        let client = RoutingClient::new(Box::new(AlwaysFails), &cfg);
        let from = (0.0, 0.0);
        let to = (0.0, 1.0);
        let r = client.compute_route(from, to).await;
        let expected = distance(from, to).unwrap();
        assert!((r.distance_m - expected).abs() < 1e-6);
        assert!((r.duration_s - expected / 13.89).abs() < 1e-6);
    }
}
