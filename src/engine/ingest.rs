//! Telemetry gateway validation: reject physically impossible fixes before
//! they reach the per-bus state pipeline.

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::engine::geometry::haversine_km;

/// A single GPS sample from a driver device. Immutable once recorded;
/// `received_at` is authoritative for staleness, `client_timestamp` for
/// ordering and dedup.
#[derive(Debug, Clone)]
pub struct GpsFix {
    pub bus_id: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub accuracy_m: f64,
    pub client_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Why a fix was not accepted. Duplicates are an expected consequence of
/// client retries and are dropped without alarming the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("coordinates outside valid bounds")]
    OutOfRange,
    #[error("speed implausible for the elapsed time since the previous fix")]
    ImplausibleSpeed,
    #[error("client timestamp at or before the last accepted fix")]
    DuplicateTimestamp,
    #[error("bus has no route assignment")]
    UnknownBus,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::OutOfRange => "out_of_range",
            RejectReason::ImplausibleSpeed => "implausible_speed",
            RejectReason::DuplicateTimestamp => "duplicate_timestamp",
            RejectReason::UnknownBus => "unknown_bus",
        }
    }
}

/// Field-level sanity checks that need no prior state.
pub fn validate_bounds(config: &EngineConfig, fix: &GpsFix) -> Result<(), RejectReason> {
    if !fix.lat.is_finite() || !fix.lon.is_finite() {
        return Err(RejectReason::OutOfRange);
    }
    if !(-90.0..=90.0).contains(&fix.lat) || !(-180.0..=180.0).contains(&fix.lon) {
        return Err(RejectReason::OutOfRange);
    }
    if !fix.accuracy_m.is_finite() || fix.accuracy_m < 0.0 {
        return Err(RejectReason::OutOfRange);
    }
    if !fix.speed_kmh.is_finite() || fix.speed_kmh < 0.0 {
        return Err(RejectReason::OutOfRange);
    }
    if fix.speed_kmh > config.max_plausible_speed_kmh {
        return Err(RejectReason::ImplausibleSpeed);
    }
    Ok(())
}

/// Checks against the previously accepted fix for the same bus: out-of-order
/// or duplicated timestamps are dropped, and a jump that would require
/// implausible travel speed is rejected as a GPS glitch.
pub fn validate_against_previous(
    config: &EngineConfig,
    previous: Option<&GpsFix>,
    fix: &GpsFix,
) -> Result<(), RejectReason> {
    let Some(previous) = previous else {
        return Ok(());
    };

    if fix.client_timestamp <= previous.client_timestamp {
        return Err(RejectReason::DuplicateTimestamp);
    }

    let elapsed_secs = (fix.client_timestamp - previous.client_timestamp)
        .num_milliseconds() as f64
        / 1000.0;
    let travelled_km = haversine_km(previous.lat, previous.lon, fix.lat, fix.lon);
    let implied_speed_kmh = travelled_km / (elapsed_secs / 3600.0);

    if implied_speed_kmh > config.max_plausible_speed_kmh {
        return Err(RejectReason::ImplausibleSpeed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix_at(ts_secs: i64, lat: f64, lon: f64) -> GpsFix {
        let ts = Utc.timestamp_opt(1_700_000_000 + ts_secs, 0).unwrap();
        GpsFix {
            bus_id: 42,
            lat,
            lon,
            speed_kmh: 30.0,
            heading_deg: 90.0,
            accuracy_m: 8.0,
            client_timestamp: ts,
            received_at: ts,
        }
    }

    #[test]
    fn accepts_first_fix_without_previous() {
        let config = EngineConfig::default();
        let fix = fix_at(0, 48.37, 10.89);
        assert!(validate_bounds(&config, &fix).is_ok());
        assert!(validate_against_previous(&config, None, &fix).is_ok());
    }

    #[test]
    fn rejects_coordinates_outside_bounds() {
        let config = EngineConfig::default();
        assert_eq!(
            validate_bounds(&config, &fix_at(0, 91.0, 0.0)),
            Err(RejectReason::OutOfRange)
        );
        assert_eq!(
            validate_bounds(&config, &fix_at(0, 0.0, -181.0)),
            Err(RejectReason::OutOfRange)
        );
        let mut nan_fix = fix_at(0, 48.37, 10.89);
        nan_fix.lat = f64::NAN;
        assert_eq!(
            validate_bounds(&config, &nan_fix),
            Err(RejectReason::OutOfRange)
        );
    }

    #[test]
    fn rejects_reported_speed_above_ceiling() {
        let config = EngineConfig::default();
        let mut fix = fix_at(0, 48.37, 10.89);
        fix.speed_kmh = 400.0;
        assert_eq!(
            validate_bounds(&config, &fix),
            Err(RejectReason::ImplausibleSpeed)
        );
    }

    #[test]
    fn drops_duplicate_and_out_of_order_timestamps() {
        let config = EngineConfig::default();
        let previous = fix_at(10, 48.37, 10.89);

        let duplicate = fix_at(10, 48.37, 10.89);
        assert_eq!(
            validate_against_previous(&config, Some(&previous), &duplicate),
            Err(RejectReason::DuplicateTimestamp)
        );

        let older = fix_at(5, 48.37, 10.89);
        assert_eq!(
            validate_against_previous(&config, Some(&previous), &older),
            Err(RejectReason::DuplicateTimestamp)
        );
    }

    #[test]
    fn rejects_teleport_jump() {
        let config = EngineConfig::default();
        let previous = fix_at(0, 0.0, 0.0);
        // ~5 km east of the previous fix, 2 seconds later
        let jump = fix_at(2, 0.0, 0.045);
        assert_eq!(
            validate_against_previous(&config, Some(&previous), &jump),
            Err(RejectReason::ImplausibleSpeed)
        );
    }

    #[test]
    fn accepts_plausible_movement() {
        let config = EngineConfig::default();
        let previous = fix_at(0, 0.0, 0.0);
        // ~1 km in 2 minutes, a normal city pace
        let next = fix_at(120, 0.0, 0.009);
        assert!(validate_against_previous(&config, Some(&previous), &next).is_ok());
    }
}
