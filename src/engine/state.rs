//! Authoritative per-bus progress records and the pure state-transition
//! helpers that keep them well-behaved under noisy telemetry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::config::EngineConfig;
use crate::engine::geometry::{Projection, RouteGeometry};
use crate::engine::ingest::GpsFix;

/// Rolling window of fixes kept per bus for smoothing and volatility checks.
pub const FIX_WINDOW: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Active,
    Idle,
    Offline,
}

impl BusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusStatus::Active => "active",
            BusStatus::Idle => "idle",
            BusStatus::Offline => "offline",
        }
    }
}

/// Live progress of one bus along its assigned route. Mutated only through
/// the owning bus worker; readers get cloned snapshots.
#[derive(Debug, Clone)]
pub struct BusProgress {
    pub route_id: i64,
    pub recent_fixes: VecDeque<GpsFix>,
    pub projected_distance_km: f64,
    pub projected_stop_index: usize,
    pub smoothed_speed_kmh: f64,
    pub last_updated_at: DateTime<Utc>,
    pub status: BusStatus,
}

impl BusProgress {
    pub fn last_fix(&self) -> Option<&GpsFix> {
        self.recent_fixes.back()
    }

    /// Number of fixes received within the given window before `now`.
    pub fn fixes_within(&self, window: Duration, now: DateTime<Utc>) -> usize {
        self.recent_fixes
            .iter()
            .filter(|f| now - f.received_at <= window)
            .count()
    }

    /// Spread between the fastest and slowest recent speed readings.
    pub fn speed_spread_kmh(&self) -> f64 {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for fix in &self.recent_fixes {
            min = min.min(fix.speed_kmh);
            max = max.max(fix.speed_kmh);
        }
        if min.is_finite() && max.is_finite() {
            max - min
        } else {
            0.0
        }
    }

    pub fn signal_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_updated_at
    }
}

/// Exponentially weighted moving average with weight `alpha` on the new
/// observation. Dampens instantaneous GPS speed noise.
pub fn ewma(previous: f64, observed: f64, alpha: f64) -> f64 {
    alpha * observed + (1.0 - alpha) * previous
}

/// Merge an accepted fix into the previous progress record.
///
/// Route progress only moves forward: a projection behind the current
/// position is treated as noise and the previous progress is kept, unless
/// the bus has been silent or offline long enough that a genuine jump is
/// plausible.
pub fn advance(
    config: &EngineConfig,
    previous: Option<&BusProgress>,
    route_id: i64,
    fix: &GpsFix,
    projection: &Projection,
    geometry: &RouteGeometry,
) -> BusProgress {
    let status = if fix.speed_kmh > config.idle_speed_kmh {
        BusStatus::Active
    } else {
        BusStatus::Idle
    };

    let Some(previous) = previous else {
        return BusProgress {
            route_id,
            recent_fixes: VecDeque::from([fix.clone()]),
            projected_distance_km: projection.distance_along_km,
            projected_stop_index: geometry.next_stop_index(projection.distance_along_km),
            smoothed_speed_kmh: fix.speed_kmh,
            last_updated_at: fix.received_at,
            status,
        };
    };

    let mut recent_fixes = previous.recent_fixes.clone();
    recent_fixes.push_back(fix.clone());
    while recent_fixes.len() > FIX_WINDOW {
        recent_fixes.pop_front();
    }

    let regressed = projection.distance_along_km + 1e-9 < previous.projected_distance_km;
    let silence = fix.received_at - previous.last_updated_at;
    let jump_plausible = previous.status == BusStatus::Offline
        || silence >= Duration::seconds(config.offline_after_secs as i64);

    let projected_distance_km = if regressed && !jump_plausible {
        previous.projected_distance_km
    } else {
        projection.distance_along_km
    };

    BusProgress {
        route_id,
        recent_fixes,
        projected_distance_km,
        projected_stop_index: geometry.next_stop_index(projected_distance_km),
        smoothed_speed_kmh: ewma(
            previous.smoothed_speed_kmh,
            fix.speed_kmh,
            config.ewma_alpha,
        ),
        last_updated_at: fix.received_at,
        status,
    }
}

/// Staleness-driven demotion for the periodic sweep. Fresh fixes promote a
/// bus back to active elsewhere; this only ever moves toward offline.
pub fn staleness_transition(
    config: &EngineConfig,
    status: BusStatus,
    age: Duration,
) -> Option<BusStatus> {
    match status {
        BusStatus::Offline => None,
        _ if age >= Duration::seconds(config.offline_after_secs as i64) => {
            Some(BusStatus::Offline)
        }
        BusStatus::Active if age >= Duration::seconds(config.idle_after_secs as i64) => {
            Some(BusStatus::Idle)
        }
        _ => None,
    }
}

/// Shared store of per-bus progress records. Writes for one bus are
/// serialized by its worker task; the lock only guards map consistency so
/// readers always observe complete records.
#[derive(Clone, Default)]
pub struct BusStateStore {
    inner: Arc<RwLock<HashMap<i64, BusProgress>>>,
}

impl BusStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, bus_id: i64) -> Option<BusProgress> {
        let inner = self.inner.read().await;
        inner.get(&bus_id).cloned()
    }

    pub async fn last_fix(&self, bus_id: i64) -> Option<GpsFix> {
        let inner = self.inner.read().await;
        inner.get(&bus_id).and_then(|p| p.last_fix().cloned())
    }

    pub async fn upsert(&self, bus_id: i64, progress: BusProgress) {
        let mut inner = self.inner.write().await;
        inner.insert(bus_id, progress);
    }

    /// Mark a bus offline, keeping its last known position for display.
    /// Returns false when the bus is unknown or already offline.
    pub async fn mark_offline(&self, bus_id: i64) -> bool {
        self.set_status(bus_id, BusStatus::Offline).await
    }

    pub async fn set_status(&self, bus_id: i64, status: BusStatus) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(&bus_id) {
            Some(progress) if progress.status != status => {
                progress.status = status;
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, bus_id: i64) -> Option<BusProgress> {
        let mut inner = self.inner.write().await;
        inner.remove(&bus_id)
    }

    pub async fn snapshot(&self) -> Vec<(i64, BusProgress)> {
        let inner = self.inner.read().await;
        inner.iter().map(|(id, p)| (*id, p.clone())).collect()
    }

    pub async fn buses_on_route(&self, route_id: i64) -> Vec<i64> {
        let inner = self.inner.read().await;
        let mut buses: Vec<i64> = inner
            .iter()
            .filter(|(_, p)| p.route_id == route_id)
            .map(|(id, _)| *id)
            .collect();
        buses.sort_unstable();
        buses
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::geometry::RouteStop;
    use chrono::TimeZone;

    fn fix_at(ts_secs: i64, speed_kmh: f64) -> GpsFix {
        let ts = Utc.timestamp_opt(1_700_000_000 + ts_secs, 0).unwrap();
        GpsFix {
            bus_id: 42,
            lat: 0.0,
            lon: 0.0,
            speed_kmh,
            heading_deg: 90.0,
            accuracy_m: 8.0,
            client_timestamp: ts,
            received_at: ts,
        }
    }

    fn geometry() -> RouteGeometry {
        let stop = |id, lon| RouteStop {
            stop_id: id,
            name: format!("Stop {}", id),
            lat: 0.0,
            lon,
        };
        RouteGeometry::build(7, "Eastbound".into(), vec![stop(1, 0.0), stop(2, 0.05), stop(3, 0.12)])
            .unwrap()
    }

    fn projection_at(km: f64) -> Projection {
        Projection {
            segment_index: 0,
            distance_along_km: km,
            perpendicular_offset_km: 0.01,
        }
    }

    #[test]
    fn ewma_weighs_recent_readings() {
        let smoothed = ewma(30.0, 40.0, 0.3);
        assert!((smoothed - 33.0).abs() < 1e-9);
    }

    #[test]
    fn first_fix_seeds_progress() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let fix = fix_at(0, 30.0);
        let progress = advance(&config, None, 7, &fix, &projection_at(3.0), &geometry);

        assert_eq!(progress.route_id, 7);
        assert_eq!(progress.smoothed_speed_kmh, 30.0);
        assert_eq!(progress.projected_distance_km, 3.0);
        assert_eq!(progress.projected_stop_index, 1);
        assert_eq!(progress.status, BusStatus::Active);
        assert_eq!(progress.recent_fixes.len(), 1);
    }

    #[test]
    fn noisy_backward_projection_does_not_regress() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let first = advance(&config, None, 7, &fix_at(0, 30.0), &projection_at(3.0), &geometry);

        // 10 seconds later a noisy fix projects 400 m behind
        let progress = advance(
            &config,
            Some(&first),
            7,
            &fix_at(10, 28.0),
            &projection_at(2.6),
            &geometry,
        );

        assert_eq!(progress.projected_distance_km, 3.0);
        // The fix itself is still recorded and smoothing continues
        assert_eq!(progress.recent_fixes.len(), 2);
        assert!((progress.smoothed_speed_kmh - 29.4).abs() < 1e-9);
    }

    #[test]
    fn jump_is_accepted_after_long_silence() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let mut first = advance(&config, None, 7, &fix_at(0, 30.0), &projection_at(9.0), &geometry);
        first.status = BusStatus::Offline;

        // The bus resurfaces near the start of the route
        let progress = advance(
            &config,
            Some(&first),
            7,
            &fix_at(60, 20.0),
            &projection_at(0.5),
            &geometry,
        );
        assert_eq!(progress.projected_distance_km, 0.5);
        assert_eq!(progress.projected_stop_index, 1);
    }

    #[test]
    fn slow_fix_marks_bus_idle() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let progress = advance(&config, None, 7, &fix_at(0, 1.0), &projection_at(3.0), &geometry);
        assert_eq!(progress.status, BusStatus::Idle);
    }

    #[test]
    fn fix_window_is_bounded() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let mut progress = advance(&config, None, 7, &fix_at(0, 30.0), &projection_at(0.1), &geometry);
        for i in 1..20 {
            progress = advance(
                &config,
                Some(&progress),
                7,
                &fix_at(i * 10, 30.0),
                &projection_at(0.1 + i as f64 * 0.1),
                &geometry,
            );
        }
        assert_eq!(progress.recent_fixes.len(), FIX_WINDOW);
    }

    #[test]
    fn staleness_demotes_in_steps() {
        let config = EngineConfig::default();
        assert_eq!(
            staleness_transition(&config, BusStatus::Active, Duration::seconds(30)),
            None
        );
        assert_eq!(
            staleness_transition(&config, BusStatus::Active, Duration::seconds(100)),
            Some(BusStatus::Idle)
        );
        assert_eq!(
            staleness_transition(&config, BusStatus::Idle, Duration::seconds(100)),
            None
        );
        assert_eq!(
            staleness_transition(&config, BusStatus::Idle, Duration::seconds(200)),
            Some(BusStatus::Offline)
        );
        assert_eq!(
            staleness_transition(&config, BusStatus::Offline, Duration::seconds(500)),
            None
        );
    }

    #[test]
    fn speed_spread_reflects_volatility() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let mut progress = advance(&config, None, 7, &fix_at(0, 10.0), &projection_at(0.1), &geometry);
        progress = advance(
            &config,
            Some(&progress),
            7,
            &fix_at(10, 45.0),
            &projection_at(0.2),
            &geometry,
        );
        assert!((progress.speed_spread_kmh() - 35.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn store_round_trip_and_status_changes() {
        let config = EngineConfig::default();
        let geometry = geometry();
        let store = BusStateStore::new();

        let progress = advance(&config, None, 7, &fix_at(0, 30.0), &projection_at(3.0), &geometry);
        store.upsert(42, progress).await;

        assert_eq!(store.len().await, 1);
        assert_eq!(store.buses_on_route(7).await, vec![42]);
        assert!(store.buses_on_route(8).await.is_empty());

        assert!(store.mark_offline(42).await);
        // Second mark is a no-op
        assert!(!store.mark_offline(42).await);

        let stored = store.get(42).await.unwrap();
        assert_eq!(stored.status, BusStatus::Offline);
        // Last known position survives for display
        assert_eq!(stored.projected_distance_km, 3.0);

        assert!(store.remove(42).await.is_some());
        assert_eq!(store.len().await, 0);
    }
}
