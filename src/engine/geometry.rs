//! Route geometry index: per-route stop sequences with cumulative distances
//! and nearest-point projection of raw GPS coordinates.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_DEG_LAT: f64 = 110.574;
const KM_PER_DEG_LON_EQUATOR: f64 = 111.320;

/// How much closer a later segment must be before we accept that the bus
/// skipped ahead instead of assuming forward progress on the earlier one.
const SKIP_AHEAD_RATIO: f64 = 2.0;

#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("Invalid route {route_id}: {reason}")]
    InvalidRoute { route_id: i64, reason: String },
}

/// A stop as provided by the route directory.
#[derive(Debug, Clone)]
pub struct RouteStop {
    pub stop_id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// One entry of a route's ordered stop sequence. `order` is a dense 0-based
/// sequence and `distance_from_start_km` is non-decreasing.
#[derive(Debug, Clone)]
pub struct RoutePoint {
    pub stop_id: i64,
    pub order: usize,
    pub distance_from_start_km: f64,
}

/// Result of projecting a raw coordinate onto a route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Index i of the segment between stop i and stop i+1
    pub segment_index: usize,
    pub distance_along_km: f64,
    pub perpendicular_offset_km: f64,
}

/// Immutable geometry snapshot for one route. Shared behind an `Arc`;
/// readers never observe a half-built route.
#[derive(Debug)]
pub struct RouteGeometry {
    pub route_id: i64,
    pub name: String,
    stops: Vec<RouteStop>,
    points: Vec<RoutePoint>,
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Planar offsets in km of (lat, lon) relative to a reference point.
/// Good enough at stop-to-stop scale; avoids spherical segment math.
fn planar_km(ref_lat: f64, ref_lon: f64, lat: f64, lon: f64) -> (f64, f64) {
    let x = (lon - ref_lon) * KM_PER_DEG_LON_EQUATOR * ref_lat.to_radians().cos();
    let y = (lat - ref_lat) * KM_PER_DEG_LAT;
    (x, y)
}

impl RouteGeometry {
    /// Build cumulative distances for an ordered stop sequence. Fails when
    /// fewer than two stops are given or a stop id repeats.
    pub fn build(
        route_id: i64,
        name: String,
        stops: Vec<RouteStop>,
    ) -> Result<Self, GeometryError> {
        if stops.len() < 2 {
            return Err(GeometryError::InvalidRoute {
                route_id,
                reason: format!("route needs at least 2 stops, got {}", stops.len()),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for stop in &stops {
            if !seen.insert(stop.stop_id) {
                return Err(GeometryError::InvalidRoute {
                    route_id,
                    reason: format!("duplicate stop id {}", stop.stop_id),
                });
            }
        }

        let mut points = Vec::with_capacity(stops.len());
        let mut cumulative_km = 0.0;
        for (order, stop) in stops.iter().enumerate() {
            if order > 0 {
                let prev = &stops[order - 1];
                cumulative_km += haversine_km(prev.lat, prev.lon, stop.lat, stop.lon);
            }
            points.push(RoutePoint {
                stop_id: stop.stop_id,
                order,
                distance_from_start_km: cumulative_km,
            });
        }

        Ok(Self {
            route_id,
            name,
            stops,
            points,
        })
    }

    pub fn stops(&self) -> &[RouteStop] {
        &self.stops
    }

    pub fn points(&self) -> &[RoutePoint] {
        &self.points
    }

    pub fn total_length_km(&self) -> f64 {
        self.points
            .last()
            .map(|p| p.distance_from_start_km)
            .unwrap_or(0.0)
    }

    pub fn distance_of_stop(&self, stop_id: i64) -> Option<f64> {
        self.points
            .iter()
            .find(|p| p.stop_id == stop_id)
            .map(|p| p.distance_from_start_km)
    }

    /// Index of the stop the bus is heading toward at the given progress.
    /// Clamped to the final stop once the route is fully traversed.
    pub fn next_stop_index(&self, distance_along_km: f64) -> usize {
        self.points
            .iter()
            .position(|p| p.distance_from_start_km >= distance_along_km - 1e-9)
            .unwrap_or(self.points.len() - 1)
    }

    /// Project a raw coordinate onto the nearest route segment.
    ///
    /// Earlier segments win ties: a later segment is only chosen when its
    /// perpendicular offset is more than `SKIP_AHEAD_RATIO` times smaller,
    /// which signals the bus legitimately skipped ahead rather than GPS
    /// noise pulling it onto a nearby return leg.
    pub fn project(&self, lat: f64, lon: f64) -> Projection {
        let mut best: Option<Projection> = None;

        for i in 0..self.stops.len() - 1 {
            let a = &self.stops[i];
            let b = &self.stops[i + 1];

            let (ax, ay) = (0.0, 0.0);
            let (bx, by) = planar_km(a.lat, a.lon, b.lat, b.lon);
            let (px, py) = planar_km(a.lat, a.lon, lat, lon);

            let seg_len_sq = (bx - ax).powi(2) + (by - ay).powi(2);
            let t = if seg_len_sq <= f64::EPSILON {
                0.0
            } else {
                (((px - ax) * (bx - ax) + (py - ay) * (by - ay)) / seg_len_sq).clamp(0.0, 1.0)
            };

            let cx = ax + t * (bx - ax);
            let cy = ay + t * (by - ay);
            let offset_km = ((px - cx).powi(2) + (py - cy).powi(2)).sqrt();

            let seg_start_km = self.points[i].distance_from_start_km;
            let seg_len_km = self.points[i + 1].distance_from_start_km - seg_start_km;
            let candidate = Projection {
                segment_index: i,
                distance_along_km: seg_start_km + t * seg_len_km,
                perpendicular_offset_km: offset_km,
            };

            match &best {
                None => best = Some(candidate),
                Some(current) => {
                    if candidate.perpendicular_offset_km * SKIP_AHEAD_RATIO
                        < current.perpendicular_offset_km
                    {
                        best = Some(candidate);
                    }
                }
            }
        }

        // stops.len() >= 2 is enforced in build, so one segment always exists
        best.unwrap_or(Projection {
            segment_index: 0,
            distance_along_km: 0.0,
            perpendicular_offset_km: 0.0,
        })
    }
}

/// Shared registry of per-route geometry snapshots. Rebuilds swap in a new
/// immutable `Arc<RouteGeometry>` under a short write lock; readers clone the
/// Arc and work lock-free from there.
#[derive(Clone, Default)]
pub struct RouteIndex {
    inner: Arc<RwLock<HashMap<i64, Arc<RouteGeometry>>>>,
}

impl RouteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rebuild(
        &self,
        route_id: i64,
        name: String,
        stops: Vec<RouteStop>,
    ) -> Result<(), GeometryError> {
        let geometry = Arc::new(RouteGeometry::build(route_id, name, stops)?);
        let mut inner = self.inner.write().await;
        inner.insert(route_id, geometry);
        Ok(())
    }

    pub async fn get(&self, route_id: i64) -> Option<Arc<RouteGeometry>> {
        let inner = self.inner.read().await;
        inner.get(&route_id).cloned()
    }

    pub async fn remove(&self, route_id: i64) {
        let mut inner = self.inner.write().await;
        inner.remove(&route_id);
    }

    /// Routes whose stop sequence contains the given stop.
    pub async fn routes_serving(&self, stop_id: i64) -> Vec<Arc<RouteGeometry>> {
        let inner = self.inner.read().await;
        inner
            .values()
            .filter(|g| g.distance_of_stop(stop_id).is_some())
            .cloned()
            .collect()
    }

    pub async fn route_ids(&self) -> Vec<i64> {
        let inner = self.inner.read().await;
        inner.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: i64, lat: f64, lon: f64) -> RouteStop {
        RouteStop {
            stop_id: id,
            name: format!("Stop {}", id),
            lat,
            lon,
        }
    }

    /// Straight route along the equator: ~11.1 km per 0.1 degree longitude.
    fn equator_route() -> RouteGeometry {
        RouteGeometry::build(
            7,
            "Eastbound".into(),
            vec![stop(1, 0.0, 0.0), stop(2, 0.0, 0.05), stop(3, 0.0, 0.12)],
        )
        .unwrap()
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Augsburg Hbf to Königsplatz is roughly 0.9 km
        let d = haversine_km(48.3654, 10.8856, 48.3668, 10.8975);
        assert!((d - 0.89).abs() < 0.05, "got {}", d);
    }

    #[test]
    fn build_rejects_single_stop() {
        let err = RouteGeometry::build(1, "Short".into(), vec![stop(1, 0.0, 0.0)]).unwrap_err();
        assert!(matches!(err, GeometryError::InvalidRoute { route_id: 1, .. }));
    }

    #[test]
    fn build_rejects_duplicate_stop_ids() {
        let err = RouteGeometry::build(
            1,
            "Loop".into(),
            vec![stop(1, 0.0, 0.0), stop(2, 0.0, 0.1), stop(1, 0.0, 0.2)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate stop id 1"));
    }

    #[test]
    fn cumulative_distances_are_non_decreasing() {
        let geometry = equator_route();
        let points = geometry.points();
        assert_eq!(points[0].distance_from_start_km, 0.0);
        for pair in points.windows(2) {
            assert!(pair[1].distance_from_start_km >= pair[0].distance_from_start_km);
            assert_eq!(pair[1].order, pair[0].order + 1);
        }
        // 0.12 degrees of longitude at the equator
        assert!((geometry.total_length_km() - 13.36).abs() < 0.1);
    }

    #[test]
    fn projects_onto_mid_segment() {
        let geometry = equator_route();
        // Slightly north of the line, 60% into the first segment
        let projection = geometry.project(0.001, 0.03);
        assert_eq!(projection.segment_index, 0);
        assert!((projection.distance_along_km - 3.34).abs() < 0.1);
        assert!(projection.perpendicular_offset_km < 0.2);
    }

    #[test]
    fn projection_prefers_earlier_segment_on_near_tie() {
        // Out-and-back: the return leg passes close to the outbound leg
        let geometry = RouteGeometry::build(
            9,
            "Out and back".into(),
            vec![stop(1, 0.0, 0.0), stop(2, 0.0, 0.1), stop(3, 0.0012, 0.0)],
        )
        .unwrap();

        // Between the legs, a bit nearer the return: not 2x closer, keep outbound
        let near_tie = geometry.project(0.00035, 0.05);
        assert_eq!(near_tie.segment_index, 0);

        // Hugging the return leg: materially closer, accept the skip ahead
        let skipped = geometry.project(0.00115, 0.05);
        assert_eq!(skipped.segment_index, 1);
    }

    #[test]
    fn projection_clamps_before_first_stop() {
        let geometry = equator_route();
        let projection = geometry.project(0.0, -0.01);
        assert_eq!(projection.segment_index, 0);
        assert_eq!(projection.distance_along_km, 0.0);
    }

    #[test]
    fn next_stop_index_walks_the_sequence() {
        let geometry = equator_route();
        assert_eq!(geometry.next_stop_index(0.0), 0);
        assert_eq!(geometry.next_stop_index(2.0), 1);
        assert_eq!(geometry.next_stop_index(6.0), 2);
        // Past the terminus it stays clamped
        assert_eq!(geometry.next_stop_index(99.0), 2);
    }

    #[tokio::test]
    async fn index_swaps_snapshots_and_finds_serving_routes() {
        let index = RouteIndex::new();
        index
            .rebuild(7, "Eastbound".into(), equator_route().stops().to_vec())
            .await
            .unwrap();

        let before = index.get(7).await.unwrap();

        // Rebuild with an extended stop sequence
        let mut stops = equator_route().stops().to_vec();
        stops.push(stop(4, 0.0, 0.2));
        index.rebuild(7, "Eastbound".into(), stops).await.unwrap();

        let after = index.get(7).await.unwrap();
        assert_eq!(before.points().len(), 3);
        assert_eq!(after.points().len(), 4);

        let serving = index.routes_serving(4).await;
        assert_eq!(serving.len(), 1);
        assert_eq!(serving[0].route_id, 7);
        assert!(index.routes_serving(999).await.is_empty());
    }
}
