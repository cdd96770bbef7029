//! Error kinds surfaced by the dispatch core, and the ones kept internal.
//!
//! Follows the teacher's own idiom (`routing/osrm_spawn/error.rs`): plain
//! `#[derive(Debug)]` enums with hand-written `Display`/`Error`/`From` impls,
//! no `thiserror`.

use std::fmt;

/// Errors returned by `dispatch_fault`, `run_batch`, and the HTTP boundary.
///
/// Maps to HTTP status per spec §7: `WrongState`/`NoCandidate`/`BadCoordinate`
/// are 4xx, `Contended` is 409.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Fault or vehicle was not in the state a transition requires.
    WrongState { entity: String, expected: String, actual: String },
    /// No eligible vehicle for a fault; it remains WAITING.
    NoCandidate,
    /// A compare-and-swap on store state conflicted and the single retry
    /// also failed.
    Contended { entity: String },
    /// A telemetry sample or fault coordinate failed validation.
    BadCoordinate { field: String, value: f64 },
    /// The referenced entity does not exist in the store.
    NotFound { entity: String, id: String },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::WrongState { entity, expected, actual } => write!(
                f,
                "{entity} in unexpected state: expected {expected}, was {actual}"
            ),
            DispatchError::NoCandidate => write!(f, "no eligible vehicle available"),
            DispatchError::Contended { entity } => {
                write!(f, "concurrent mutation of {entity}, retry exhausted")
            }
            DispatchError::BadCoordinate { field, value } => {
                write!(f, "invalid coordinate {field}={value}")
            }
            DispatchError::NotFound { entity, id } => write!(f, "{entity} {id} not found"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Geo utility failures (C1). Never crosses the dispatch boundary on its
/// own — callers map it into `DispatchError::BadCoordinate`.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoError {
    NonFinite { field: &'static str, value: f64 },
    EmptyWaypoints,
}

impl fmt::Display for GeoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoError::NonFinite { field, value } => {
                write!(f, "non-finite coordinate: {field}={value}")
            }
            GeoError::EmptyWaypoints => write!(f, "route has no waypoints"),
        }
    }
}

impl std::error::Error for GeoError {}

/// Store-gateway failures (C4).
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound { entity: &'static str, id: String },
    Cas { entity: &'static str, id: String },
    Constraint(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { entity, id } => write!(f, "{entity} {id} not found"),
            StoreError::Cas { entity, id } => {
                write!(f, "compare-and-swap failed for {entity} {id}")
            }
            StoreError::Constraint(msg) => write!(f, "store constraint violated: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => {
                DispatchError::NotFound { entity: entity.to_string(), id }
            }
            StoreError::Cas { entity, .. } => DispatchError::Contended { entity: entity.to_string() },
            StoreError::Constraint(msg) => DispatchError::Contended { entity: msg },
        }
    }
}

impl From<GeoError> for DispatchError {
    fn from(err: GeoError) -> Self {
        match err {
            GeoError::NonFinite { field, value } => {
                DispatchError::BadCoordinate { field: field.to_string(), value }
            }
            GeoError::EmptyWaypoints => {
                DispatchError::BadCoordinate { field: "waypoints".to_string(), value: f64::NAN }
            }
        }
    }
}

/// Routing-collaborator failures (C2). Internal only: `routing.rs` never lets
/// this escape, it always degrades to the fallback route (spec §4.2).
#[derive(Debug)]
pub enum RoutingError {
    Http(reqwest::Error),
    BreakerOpen,
    BadResponse(String),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::Http(e) => write!(f, "routing collaborator HTTP error: {e}"),
            RoutingError::BreakerOpen => write!(f, "routing circuit breaker open"),
            RoutingError::BadResponse(msg) => write!(f, "routing collaborator bad response: {msg}"),
        }
    }
}

impl std::error::Error for RoutingError {}

impl From<reqwest::Error> for RoutingError {
    fn from(err: reqwest::Error) -> Self {
        RoutingError::Http(err)
    }
}

/// ML-collaborator failures (C7). Internal only: `dispatch.rs` always falls
/// back to the rule-based scorer on any of these.
#[derive(Debug)]
pub enum MlError {
    Http(reqwest::Error),
    Timeout,
    SchemaViolation(String),
    OutOfRange { field: &'static str, value: f64 },
    Disabled,
}

impl fmt::Display for MlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlError::Http(e) => write!(f, "ML collaborator HTTP error: {e}"),
            MlError::Timeout => write!(f, "ML collaborator timed out"),
            MlError::SchemaViolation(msg) => write!(f, "ML collaborator schema violation: {msg}"),
            MlError::OutOfRange { field, value } => {
                write!(f, "ML collaborator result out of range: {field}={value}")
            }
            MlError::Disabled => write!(f, "ML collaborator disabled by configuration"),
        }
    }
}

impl std::error::Error for MlError {}

impl From<reqwest::Error> for MlError {
    fn from(err: reqwest::Error) -> Self {
        MlError::Http(err)
    }
}
