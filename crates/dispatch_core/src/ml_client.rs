//! ML client (C7): optional external scorer with a cached health check,
//! timeout, and validation of its response.
//!
//! HTTP shape grounded on `routing/osrm_spawn/client.rs` (a small typed
//! client around one external HTTP collaborator); failure handling follows
//! the "absorb, never propagate" policy the routing client (C2) also uses —
//! `dispatch.rs` treats any `MlError` as "fall back to the rule-based
//! scorer", never as a caller-visible error (spec §4.7/§7).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::MlConfig;
use crate::error::MlError;

/// One candidate's numeric features, validated ranges per spec §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub distance_m: f64,
    pub distance_cat: u8,
    pub past_perf: f64,
    pub fault_history: u32,
    pub fatigue_h: f64,
    pub fault_severity: u8,
}

impl Features {
    fn validate(&self) -> Result<(), MlError> {
        if self.distance_m < 0.0 {
            return Err(MlError::OutOfRange { field: "distance_m", value: self.distance_m });
        }
        if !(0..=2).contains(&self.distance_cat) {
            return Err(MlError::OutOfRange { field: "distance_cat", value: self.distance_cat as f64 });
        }
        if !(1.0..=10.0).contains(&self.past_perf) {
            return Err(MlError::OutOfRange { field: "past_perf", value: self.past_perf });
        }
        if !(0.0..=24.0).contains(&self.fatigue_h) {
            return Err(MlError::OutOfRange { field: "fatigue_h", value: self.fatigue_h });
        }
        if !(1..=3).contains(&self.fault_severity) {
            return Err(MlError::OutOfRange { field: "fault_severity", value: self.fault_severity as f64 });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    candidates: &'a [Features],
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictResponse {
    pub best_index: usize,
    pub scores: Vec<f64>,
}

/// A healthy probe result is cached for this long so every dispatch doesn't
/// re-probe the collaborator.
const HEALTH_CACHE_WINDOW: Duration = Duration::from_secs(10);

pub struct MlClient {
    client: reqwest::Client,
    cfg: MlConfig,
    last_health_ok: AtomicBool,
    last_health_check_epoch_ms: AtomicI64,
}

impl MlClient {
    pub fn new(cfg: MlConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            cfg,
            last_health_ok: AtomicBool::new(false),
            last_health_check_epoch_ms: AtomicI64::new(0),
        }
    }

    async fn healthy(&self) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let now = Utc::now().timestamp_millis();
        let last = self.last_health_check_epoch_ms.load(Ordering::Acquire);
        if now - last < HEALTH_CACHE_WINDOW.as_millis() as i64 {
            return self.last_health_ok.load(Ordering::Acquire);
        }

        let url = format!("{}/health", self.cfg.service_url.trim_end_matches('/'));
        let ok = self
            .client
            .get(&url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);

        self.last_health_ok.store(ok, Ordering::Release);
        self.last_health_check_epoch_ms.store(now, Ordering::Release);
        ok
    }

    /// `predict`: returns the winning candidate index, or an `MlError` the
    /// caller must treat as "use the rule-based scorer instead".
    pub async fn predict(&self, candidates: &[Features]) -> Result<usize, MlError> {
        if !self.cfg.enabled {
            return Err(MlError::Disabled);
        }
        for f in candidates {
            f.validate()?;
        }
        if !self.healthy().await {
            return Err(MlError::Timeout);
        }

        let url = format!("{}/predict", self.cfg.service_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&PredictRequest { candidates })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(MlError::SchemaViolation(format!("status {}", resp.status())));
        }

        let body: PredictResponse = resp.json().await?;
        if body.best_index >= candidates.len() {
            return Err(MlError::SchemaViolation("best_index out of bounds".into()));
        }
        if body.scores.len() != candidates.len() {
            return Err(MlError::SchemaViolation("scores length mismatch".into()));
        }
        Ok(body.best_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature() -> Features {
        Features {
            distance_m: 100.0,
            distance_cat: 0,
            past_perf: 5.5,
            fault_history: 0,
            fatigue_h: 0.0,
            fault_severity: 3,
        }
    }

    #[tokio::test]
    async fn disabled_client_always_errors() {
        let client = MlClient::new(MlConfig { enabled: false, ..Default::default() });
        let err = client.predict(&[feature()]).await.unwrap_err();
        assert!(matches!(err, MlError::Disabled));
    }

    #[test]
    fn validation_rejects_out_of_range_past_perf() {
        let mut f = feature();
        f.past_perf = 0.5;
        assert!(f.validate().is_err());
    }
}
