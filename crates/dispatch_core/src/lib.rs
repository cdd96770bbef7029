//! # Dispatch Core
//!
//! The fault-dispatch scheduler of a fleet-management backend: it decides
//! which vehicle services which fault, drives the fault/trip/vehicle
//! lifecycle, tracks vehicle movement along assigned routes, and recovers
//! from partial failures (unacknowledged dispatches, stuck vehicles, route
//! deviations, missing resolutions).
//!
//! ## Overview
//!
//! - **Geo utilities** ([`geo`]): great-circle distance, route
//!   interpolation, deviation measurement.
//! - **Store gateway** ([`store`]): typed access to the seven core
//!   entities, with CAS transitions and the at-most-one-ongoing-trip
//!   invariant.
//! - **Routing** ([`routing`]) and **ML** ([`ml_client`]) collaborator
//!   clients: external calls that never fail to their caller, degrading to
//!   a fallback route / the rule-based scorer instead.
//! - **Scorer** ([`scorer`]): deterministic multi-factor candidate ranking.
//! - **Dispatch engine** ([`dispatch`]): reserves a vehicle for a fault and
//!   drives the reservation protocol end to end.
//! - **FSMs** ([`fsm`]): fault confirmation/resolution/timeout transitions.
//! - **Telemetry handler** ([`telemetry`]): arrival detection and
//!   deviation-triggered route recalculation.
//! - **Timer service** ([`timers`]) and **sweeper** ([`sweeper`]): the
//!   soft-real-time backstops that keep the fleet from getting stuck.
//! - **Device channel** ([`device_channel`]) and **protocol handlers**
//!   ([`device_protocol`]): the device-in-the-loop confirmation/resolution
//!   path.
//! - [`core::DispatchCore`] wires all of the above into the single context
//!   value the HTTP boundary and device-protocol layer call into.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dispatch_core::config::Config;
//! use dispatch_core::core::DispatchCore;
//!
//! # struct NullRouteBackend;
//! # #[async_trait::async_trait]
//! # impl dispatch_core::routing::RouteBackend for NullRouteBackend {
//! #     async fn route(&self, from: (f64, f64), to: (f64, f64)) -> Result<dispatch_core::routing::RouteResult, dispatch_core::error::RoutingError> {
//! #         Ok(dispatch_core::routing::RouteResult { waypoints: vec![from, to], distance_m: 0.0, duration_s: 0.0, source: "EXTERNAL", is_fallback: false })
//! #     }
//! # }
//! # struct NullTransport;
//! # #[async_trait::async_trait]
//! # impl dispatch_core::device_channel::DeviceTransport for NullTransport {
//! #     async fn publish(&self, _topic: &str, _payload: &serde_json::Value) -> Result<(), String> { Ok(()) }
//! #     async fn connect(&self) -> Result<(), String> { Ok(()) }
//! # }
//! # async fn example() {
//! let core = DispatchCore::new(Config::from_env(), Box::new(NullRouteBackend), Box::new(NullTransport));
//! DispatchCore::rebuild_timers_on_startup(&core).await;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod device_channel;
pub mod device_protocol;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fsm;
pub mod geo;
pub mod locks;
pub mod ml_client;
pub mod routing;
pub mod scorer;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod timers;
