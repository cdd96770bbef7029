//! Pluggable collaborator backends wired at process startup.
//!
//! The routing provider's HTTP transport and the device message-broker
//! client are both explicitly out of scope (spec §1) — `dispatch_core`
//! only specifies the `RouteBackend`/`DeviceTransport` trait contracts.
//! This module supplies the concrete, minimal implementations the
//! standalone process needs: a real HTTP call to the configured routing
//! collaborator (or an always-failing stand-in when none is configured,
//! which simply means every route degrades to the straight-line fallback),
//! and a logging device transport standing in for the broker client.

use async_trait::async_trait;
use dispatch_core::config::RoutingConfig;
use dispatch_core::device_channel::DeviceTransport;
use dispatch_core::error::RoutingError;
use dispatch_core::routing::{HttpRouteBackend, RouteBackend, RouteResult};
use serde_json::Value;
use tracing::info;

/// Used when `ROUTING_SERVICE_URL` is unset: the routing client's circuit
/// breaker and fallback already handle this case, so every call simply
/// reports an immediate failure.
pub struct UnconfiguredRouteBackend;

#[async_trait]
impl RouteBackend for UnconfiguredRouteBackend {
    async fn route(&self, _from: (f64, f64), _to: (f64, f64)) -> Result<RouteResult, RoutingError> {
        Err(RoutingError::BadResponse("no routing collaborator configured".into()))
    }
}

pub fn build_route_backend(cfg: &RoutingConfig) -> Box<dyn RouteBackend> {
    match &cfg.service_url {
        Some(url) => Box::new(HttpRouteBackend::new(url.clone())),
        None => Box::new(UnconfiguredRouteBackend),
    }
}

/// Logs publishes instead of handing them to a real broker client. Always
/// reports success so the dispatch reservation protocol proceeds exactly
/// as it would with a live device in the loop; a real deployment swaps
/// this for an MQTT/broker-backed `DeviceTransport`.
pub struct LoggingDeviceTransport;

#[async_trait]
impl DeviceTransport for LoggingDeviceTransport {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), String> {
        info!(topic, %payload, "device command published");
        Ok(())
    }

    async fn connect(&self) -> Result<(), String> {
        Ok(())
    }
}
