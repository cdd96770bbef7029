//! Runtime configuration, read from environment variables.
//!
//! Mirrors the teacher's `scenario::params` shape: one small struct per
//! concern, each with `impl Default`, assembled into a top-level struct. The
//! difference from the teacher is the source: these are read from the process
//! environment (optionally loaded from a local `.env` via `dotenvy`) rather
//! than constructed in test code.

use std::env;
use std::time::Duration;

/// Which scorer `dispatch_fault` prefers when healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEngine {
    Rule,
    Ml,
}

impl Default for DispatchEngine {
    fn default() -> Self {
        DispatchEngine::Rule
    }
}

/// ML collaborator configuration (C7).
#[derive(Debug, Clone)]
pub struct MlConfig {
    pub enabled: bool,
    pub service_url: String,
    pub timeout: Duration,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_url: String::new(),
            timeout: Duration::from_millis(5_000),
        }
    }
}

/// Timer durations (C12).
#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub ack_deadline: Duration,
    pub auto_resolve: Duration,
    pub sweeper_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            ack_deadline: Duration::from_millis(60_000),
            auto_resolve: Duration::from_millis(30_000),
            sweeper_interval: Duration::from_millis(30_000),
        }
    }
}

/// Telemetry/route-recalculation thresholds (C11).
#[derive(Debug, Clone, Copy)]
pub struct TelemetryConfig {
    pub arrival_threshold_m: f64,
    pub deviation_threshold_m: f64,
    pub min_dist_to_dest_for_recalc_m: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            arrival_threshold_m: 50.0,
            deviation_threshold_m: 200.0,
            min_dist_to_dest_for_recalc_m: 500.0,
        }
    }
}

/// Routing collaborator configuration (C2).
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub service_url: Option<String>,
    pub cache_ttl: Duration,
    pub breaker_fails: u32,
    pub breaker_open: Duration,
    pub default_location: (f64, f64),
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            cache_ttl: Duration::from_millis(300_000),
            breaker_fails: 3,
            breaker_open: Duration::from_millis(60_000),
            default_location: (0.0, 0.0),
        }
    }
}

/// Top-level configuration, assembled from the sub-structs above.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub dispatch_engine: DispatchEngine,
    pub ml: MlConfig,
    pub timers: TimerConfig,
    pub telemetry: TelemetryConfig,
    pub routing: RoutingConfig,
    pub prototype_mode: bool,
}

impl Config {
    /// Load from the process environment. Attempts to load a local `.env`
    /// first (ignored if absent, same as `dotenvy::dotenv().ok()`).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut cfg = Config::default();

        cfg.dispatch_engine = match env_str("DISPATCH_ENGINE").as_deref() {
            Some("ML") => DispatchEngine::Ml,
            _ => DispatchEngine::Rule,
        };

        cfg.ml.enabled = env_bool("ML_SERVICE_ENABLED", cfg.ml.enabled);
        cfg.ml.service_url = env_str("ML_SERVICE_URL").unwrap_or(cfg.ml.service_url);
        cfg.ml.timeout = env_duration_ms("ML_SERVICE_TIMEOUT_MS", cfg.ml.timeout);

        cfg.prototype_mode = env_bool("PROTOTYPE_MODE", cfg.prototype_mode);

        cfg.timers.ack_deadline = env_duration_ms("ACK_DEADLINE_MS", cfg.timers.ack_deadline);
        cfg.timers.auto_resolve = env_duration_ms("AUTO_RESOLVE_MS", cfg.timers.auto_resolve);
        cfg.timers.sweeper_interval =
            env_duration_ms("SWEEPER_INTERVAL_MS", cfg.timers.sweeper_interval);

        cfg.telemetry.arrival_threshold_m =
            env_f64("ARRIVAL_THRESHOLD_M", cfg.telemetry.arrival_threshold_m);
        cfg.telemetry.deviation_threshold_m =
            env_f64("DEVIATION_THRESHOLD_M", cfg.telemetry.deviation_threshold_m);
        cfg.telemetry.min_dist_to_dest_for_recalc_m = env_f64(
            "MIN_DIST_TO_DEST_FOR_RECALC_M",
            cfg.telemetry.min_dist_to_dest_for_recalc_m,
        );

        cfg.routing.service_url = env_str("ROUTING_SERVICE_URL");
        cfg.routing.cache_ttl = env_duration_ms("ROUTE_CACHE_TTL_MS", cfg.routing.cache_ttl);
        cfg.routing.breaker_fails =
            env_u32("ROUTE_BREAKER_FAILS", cfg.routing.breaker_fails);
        cfg.routing.breaker_open =
            env_duration_ms("ROUTE_BREAKER_OPEN_MS", cfg.routing.breaker_open);

        if let (Some(lat), Some(lon)) = (env_f64_opt("DEFAULT_LOCATION_LAT"), env_f64_opt("DEFAULT_LOCATION_LON")) {
            cfg.routing.default_location = (lat, lon);
        }

        cfg
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => v.eq_ignore_ascii_case("true") || v == "1",
        None => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64_opt(key: &str) -> Option<f64> {
    env_str(key).and_then(|v| v.parse().ok())
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    env_str(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.timers.ack_deadline, Duration::from_millis(60_000));
        assert_eq!(cfg.timers.auto_resolve, Duration::from_millis(30_000));
        assert_eq!(cfg.timers.sweeper_interval, Duration::from_millis(30_000));
        assert_eq!(cfg.telemetry.arrival_threshold_m, 50.0);
        assert_eq!(cfg.telemetry.deviation_threshold_m, 200.0);
        assert_eq!(cfg.telemetry.min_dist_to_dest_for_recalc_m, 500.0);
        assert_eq!(cfg.routing.breaker_fails, 3);
        assert_eq!(cfg.routing.breaker_open, Duration::from_millis(60_000));
        assert_eq!(cfg.routing.cache_ttl, Duration::from_millis(300_000));
        assert!(!cfg.prototype_mode);
    }
}
