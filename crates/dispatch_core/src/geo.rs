//! Geo utilities (C1): great-circle distance, route interpolation and
//! deviation measurement over plain lat/lon waypoints.
//!
//! Adapted from the teacher's H3-cell Haversine math in the old `spatial.rs`:
//! same formula, but operating directly on `(lat, lon)` pairs instead of
//! snapping through an `h3o::CellIndex` grid, since the core has no spatial
//! index of its own.

use crate::error::GeoError;

/// Mean Earth radius in meters, per spec §4.1.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A point, in degrees.
pub type LatLon = (f64, f64);

fn validate(field: &'static str, value: f64) -> Result<f64, GeoError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(GeoError::NonFinite { field, value })
    }
}

/// Great-circle distance between two points, in meters.
pub fn distance(a: LatLon, b: LatLon) -> Result<f64, GeoError> {
    let (lat1, lon1) = (validate("a.lat", a.0)?, validate("a.lon", a.1)?);
    let (lat2, lon2) = (validate("b.lat", b.0)?, validate("b.lon", b.1)?);
    Ok(distance_unchecked((lat1, lon1), (lat2, lon2)))
}

fn distance_unchecked(a: LatLon, b: LatLon) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Result of interpolating a position along a route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionAlongRoute {
    At(LatLon),
    Done,
}

/// Interpolate the position `speed_mps * elapsed_s` meters along `waypoints`,
/// treating each consecutive pair as a straight segment. Clamps to the final
/// waypoint once the traveled distance reaches the total route distance.
pub fn position_along_route(
    waypoints: &[LatLon],
    elapsed_s: f64,
    total_distance_m: f64,
    speed_mps: f64,
) -> Result<PositionAlongRoute, GeoError> {
    if waypoints.is_empty() {
        return Err(GeoError::EmptyWaypoints);
    }
    for (i, p) in waypoints.iter().enumerate() {
        validate("waypoint.lat", p.0)?;
        let _ = i;
        validate("waypoint.lon", p.1)?;
    }
    validate("elapsed_s", elapsed_s)?;
    validate("total_distance_m", total_distance_m)?;
    validate("speed_mps", speed_mps)?;

    if waypoints.len() == 1 {
        return Ok(PositionAlongRoute::At(waypoints[0]));
    }

    let traveled = (elapsed_s.max(0.0)) * speed_mps;
    if traveled >= total_distance_m {
        return Ok(PositionAlongRoute::Done);
    }

    let mut remaining = traveled;
    for pair in waypoints.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        let seg_len = distance_unchecked(from, to);
        if seg_len <= f64::EPSILON {
            continue;
        }
        if remaining <= seg_len {
            let t = remaining / seg_len;
            let lat = from.0 + (to.0 - from.0) * t;
            let lon = from.1 + (to.1 - from.1) * t;
            return Ok(PositionAlongRoute::At((lat, lon)));
        }
        remaining -= seg_len;
    }

    Ok(PositionAlongRoute::At(*waypoints.last().unwrap()))
}

/// Minimum distance from `point` to any segment of `waypoints`, meters.
/// Point-to-segment projection is done on a local tangent (equirectangular)
/// plane, acceptable given neighborhood-scale distances (spec §4.1).
pub fn deviation_from_route(point: LatLon, waypoints: &[LatLon]) -> Result<f64, GeoError> {
    if waypoints.is_empty() {
        return Err(GeoError::EmptyWaypoints);
    }
    validate("point.lat", point.0)?;
    validate("point.lon", point.1)?;
    for p in waypoints {
        validate("waypoint.lat", p.0)?;
        validate("waypoint.lon", p.1)?;
    }

    if waypoints.len() == 1 {
        return distance(point, waypoints[0]);
    }

    // local tangent-plane projection, centered on the point of interest
    let lat0 = point.0.to_radians();
    let to_xy = |p: LatLon| -> (f64, f64) {
        let x = (p.1 - point.1).to_radians() * lat0.cos() * EARTH_RADIUS_M;
        let y = (p.0 - point.0).to_radians() * EARTH_RADIUS_M;
        (x, y)
    };

    let origin = (0.0, 0.0);
    let mut best = f64::INFINITY;
    for pair in waypoints.windows(2) {
        let a = to_xy(pair[0]);
        let b = to_xy(pair[1]);
        let d = point_segment_distance(origin, a, b);
        if d < best {
            best = d;
        }
    }
    Ok(best)
}

fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (ax, ay) = a;
    let (bx, by) = b;
    let (px, py) = p;
    let (abx, aby) = (bx - ax, by - ay);
    let len_sq = abx * abx + aby * aby;
    if len_sq <= f64::EPSILON {
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }
    let t = (((px - ax) * abx + (py - ay) * aby) / len_sq).clamp(0.0, 1.0);
    let (cx, cy) = (ax + abx * t, ay + aby * t);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_same_point_is_zero() {
        let d = distance((24.90, 67.05), (24.90, 67.05)).unwrap();
        assert!(d < 1e-6);
    }

    #[test]
    fn distance_rejects_non_finite() {
        let err = distance((f64::NAN, 0.0), (1.0, 1.0)).unwrap_err();
        assert!(matches!(err, GeoError::NonFinite { field: "a.lat", .. }));
    }

    #[test]
    fn distance_one_degree_latitude_is_about_111km() {
        let d = distance((0.0, 0.0), (1.0, 0.0)).unwrap();
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn position_along_route_clamps_at_end() {
        let wp = vec![(0.0, 0.0), (0.0, 1.0)];
        let total = distance(wp[0], wp[1]).unwrap();
        let pos = position_along_route(&wp, 1_000_000.0, total, 10.0).unwrap();
        assert_eq!(pos, PositionAlongRoute::Done);
    }

    #[test]
    fn position_along_route_interpolates_midpoint() {
        let wp = vec![(0.0, 0.0), (0.0, 1.0)];
        let total = distance(wp[0], wp[1]).unwrap();
        let half_time = (total / 2.0) / 10.0;
        let pos = position_along_route(&wp, half_time, total, 10.0).unwrap();
        match pos {
            PositionAlongRoute::At((lat, lon)) => {
                assert!((lat - 0.0).abs() < 1e-6);
                assert!((lon - 0.5).abs() < 0.01);
            }
            PositionAlongRoute::Done => panic!("expected midpoint"),
        }
    }

    #[test]
    fn deviation_from_route_on_segment_is_small() {
        let wp = vec![(0.0, 0.0), (0.0, 1.0)];
        let d = deviation_from_route((0.0, 0.5), &wp).unwrap();
        assert!(d < 1.0, "got {d}");
    }

    #[test]
    fn deviation_from_route_off_segment_matches_approx() {
        let wp = vec![(0.0, 0.0), (0.0, 1.0)];
        // ~0.002 degrees latitude offset is roughly 222m
        let d = deviation_from_route((0.002, 0.5), &wp).unwrap();
        assert!((d - 222.0).abs() < 50.0, "got {d}");
    }
}
