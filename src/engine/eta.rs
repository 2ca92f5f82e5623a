//! Arrival-time estimation for every stop still ahead of a bus.
//!
//! All stops of one bus are estimated from a single state snapshot so they
//! share one method/confidence basis; a GPS update never makes the same bus
//! `gps_based` for one stop and `historical` for the next in one response.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::EngineConfig;
use crate::engine::geometry::RouteGeometry;
use crate::engine::state::{BusProgress, BusStatus};
use crate::providers::directory::RouteSchedule;

/// Confidence assigned to purely schedule-derived estimates.
const HISTORICAL_CONFIDENCE: f64 = 0.4;

#[derive(Debug, thiserror::Error)]
pub enum EtaError {
    #[error("no route geometry for route {0}")]
    NoRouteData(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EtaMethod {
    GpsBased,
    Hybrid,
    Historical,
}

/// Predicted arrival of one bus at one stop. Derived data, recomputed on
/// demand and cached for a few seconds at most.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Eta {
    pub bus_id: i64,
    pub stop_id: i64,
    /// Predicted arrival instant (RFC 3339)
    #[schema(value_type = String)]
    pub estimated_arrival: DateTime<Utc>,
    pub eta_minutes: f64,
    /// Remaining distance along the route in km
    pub distance_km: f64,
    /// Estimate reliability in [0, 1]
    pub confidence: f64,
    pub method: EtaMethod,
    /// True when the bus is within the arrival radius of this stop
    pub arriving_now: bool,
    #[schema(value_type = String)]
    pub computed_at: DateTime<Utc>,
}

/// Pick the estimation basis for a bus-state snapshot.
///
/// `active`/`idle` with fresh signal uses GPS; the speed floor plus the
/// confidence scale-down already cover a bus stopped in traffic. Stale or
/// volatile signal blends in the schedule, and offline or signal-less buses
/// fall back to it entirely.
pub fn select_method(
    config: &EngineConfig,
    progress: &BusProgress,
    now: DateTime<Utc>,
) -> EtaMethod {
    if progress.status == BusStatus::Offline {
        return EtaMethod::Historical;
    }

    let fresh_fixes =
        progress.fixes_within(Duration::seconds(config.fresh_window_secs as i64), now);
    if fresh_fixes < 2 {
        return EtaMethod::Historical;
    }

    let age_secs = progress.signal_age(now).num_seconds();
    let stale = age_secs > config.hybrid_after_secs as i64;
    let volatile = progress.speed_spread_kmh() > config.speed_volatility_kmh;

    if stale || volatile {
        EtaMethod::Hybrid
    } else {
        EtaMethod::GpsBased
    }
}

/// Fraction in [0, 1] describing how far into the hybrid window the signal
/// staleness has progressed. 0 = just turned stale, 1 = about to go
/// schedule-only.
fn staleness_fraction(config: &EngineConfig, progress: &BusProgress, now: DateTime<Utc>) -> f64 {
    let age_secs = progress.signal_age(now).num_seconds() as f64;
    let start = config.hybrid_after_secs as f64;
    let end = config.fresh_window_secs as f64;
    ((age_secs - start) / (end - start)).clamp(0.0, 1.0)
}

/// Confidence of a live-GPS estimate: 0.95 for a crisp fix at cruising
/// speed, scaled toward 0.8 as accuracy worsens and as the smoothed speed
/// approaches the floor (a near-stationary bus has a less reliable ETA).
fn gps_confidence(config: &EngineConfig, progress: &BusProgress) -> f64 {
    let accuracy_m = progress.last_fix().map(|f| f.accuracy_m).unwrap_or(0.0);
    let accuracy_factor = (accuracy_m / config.accuracy_floor_m).clamp(0.0, 1.0);

    let floor = config.min_speed_kmh;
    let floor_factor = if progress.smoothed_speed_kmh <= floor {
        1.0
    } else {
        (1.0 - (progress.smoothed_speed_kmh - floor) / floor).clamp(0.0, 1.0)
    };

    0.95 - 0.075 * accuracy_factor - 0.075 * floor_factor
}

fn hybrid_confidence(staleness: f64) -> f64 {
    0.75 - 0.25 * staleness
}

/// Compute ETAs for every stop still ahead of the bus.
///
/// Returns an empty vector when the chosen basis is schedule-only but the
/// route has no timetable; the bus is then simply absent from ETA output.
pub fn estimate(
    config: &EngineConfig,
    bus_id: i64,
    progress: &BusProgress,
    geometry: &RouteGeometry,
    schedule: Option<&RouteSchedule>,
    now: DateTime<Utc>,
) -> Vec<Eta> {
    let method = select_method(config, progress, now);
    if method == EtaMethod::Historical && schedule.is_none() {
        return Vec::new();
    }

    let staleness = staleness_fraction(config, progress, now);
    let confidence = match method {
        EtaMethod::GpsBased => gps_confidence(config, progress),
        EtaMethod::Hybrid => hybrid_confidence(staleness),
        EtaMethod::Historical => HISTORICAL_CONFIDENCE,
    };

    let effective_speed_kmh = progress.smoothed_speed_kmh.max(config.min_speed_kmh);
    let mut etas = Vec::new();

    for point in geometry.points() {
        let remaining_km = point.distance_from_start_km - progress.projected_distance_km;
        if remaining_km < 0.0 {
            // Already passed this stop
            continue;
        }

        if remaining_km <= config.arriving_radius_km {
            etas.push(Eta {
                bus_id,
                stop_id: point.stop_id,
                estimated_arrival: now,
                eta_minutes: 0.0,
                distance_km: remaining_km,
                confidence,
                method,
                arriving_now: true,
                computed_at: now,
            });
            continue;
        }

        let gps_minutes = remaining_km / effective_speed_kmh * 60.0;
        let scheduled_minutes = schedule
            .and_then(|s| s.next_scheduled_arrival(point.stop_id, now))
            .map(|arrival| (arrival - now).num_seconds() as f64 / 60.0);

        let eta_minutes = match method {
            EtaMethod::GpsBased => gps_minutes,
            EtaMethod::Historical => match scheduled_minutes {
                Some(minutes) => minutes,
                // No timetable entry for this particular stop
                None => continue,
            },
            EtaMethod::Hybrid => {
                let gps_weight = 1.0 - staleness;
                match scheduled_minutes {
                    Some(minutes) => gps_weight * gps_minutes + (1.0 - gps_weight) * minutes,
                    None => gps_minutes,
                }
            }
        };

        etas.push(Eta {
            bus_id,
            stop_id: point.stop_id,
            estimated_arrival: now + Duration::milliseconds((eta_minutes * 60_000.0) as i64),
            eta_minutes,
            distance_km: remaining_km,
            confidence,
            method,
            arriving_now: false,
            computed_at: now,
        });
    }

    etas
}
