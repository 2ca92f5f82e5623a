//! Route/stop directory loader.
//!
//! The surrounding application manages routes, stops, bus assignments and
//! timetables elsewhere; this module reads the exported YAML snapshot of that
//! data and turns it into the engine's inputs: geometry stop sequences,
//! per-route schedules and bus-to-route assignments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::engine::geometry::RouteStop;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Failed to read route directory: {0}")]
    ReadError(String),
    #[error("Failed to parse route directory: {0}")]
    ParseError(String),
    #[error("Invalid schedule for route {route_id}: {reason}")]
    InvalidSchedule { route_id: i64, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteDirectory {
    pub routes: Vec<RouteDef>,
    /// Which bus is currently driving which route
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteDef {
    pub id: i64,
    pub name: String,
    pub stops: Vec<StopDef>,
    pub schedule: Option<ScheduleDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopDef {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDef {
    /// IANA timezone the departure times are expressed in (default: UTC)
    #[serde(default = "ScheduleDef::default_timezone")]
    pub timezone: String,
    /// Daily departure times from the first stop, "HH:MM" or "HH:MM:SS"
    pub departures: Vec<String>,
    /// Minutes from departure to each stop, aligned with the stop list
    pub offsets_min: Vec<i64>,
}

impl ScheduleDef {
    fn default_timezone() -> String {
        "UTC".to_string()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Assignment {
    pub bus_id: i64,
    pub route_id: i64,
}

impl RouteDirectory {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DirectoryError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| DirectoryError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| DirectoryError::ParseError(e.to_string()))
    }
}

impl RouteDef {
    pub fn geometry_stops(&self) -> Vec<RouteStop> {
        self.stops
            .iter()
            .map(|s| RouteStop {
                stop_id: s.id,
                name: s.name.clone(),
                lat: s.lat,
                lon: s.lon,
            })
            .collect()
    }

    /// Resolve the schedule definition into concrete departure times and
    /// per-stop offsets. Routes without a timetable return Ok(None).
    pub fn build_schedule(&self) -> Result<Option<RouteSchedule>, DirectoryError> {
        let Some(def) = &self.schedule else {
            return Ok(None);
        };

        if def.offsets_min.len() != self.stops.len() {
            return Err(DirectoryError::InvalidSchedule {
                route_id: self.id,
                reason: format!(
                    "{} offsets for {} stops",
                    def.offsets_min.len(),
                    self.stops.len()
                ),
            });
        }

        let timezone: Tz = def
            .timezone
            .parse()
            .map_err(|_| DirectoryError::InvalidSchedule {
                route_id: self.id,
                reason: format!("unknown timezone '{}'", def.timezone),
            })?;

        let mut departures = Vec::with_capacity(def.departures.len());
        for raw in &def.departures {
            let time = NaiveTime::parse_from_str(raw, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
                .map_err(|_| DirectoryError::InvalidSchedule {
                    route_id: self.id,
                    reason: format!("unparseable departure time '{}'", raw),
                })?;
            departures.push(time);
        }
        departures.sort();

        let stop_offsets = self
            .stops
            .iter()
            .zip(&def.offsets_min)
            .map(|(stop, minutes)| (stop.id, minutes * 60))
            .collect();

        Ok(Some(RouteSchedule {
            route_id: self.id,
            timezone,
            departures,
            stop_offsets,
        }))
    }
}

/// Scheduled timetable of one route, used by the historical and hybrid
/// estimation methods when live signal is missing or stale.
#[derive(Debug, Clone)]
pub struct RouteSchedule {
    pub route_id: i64,
    pub timezone: Tz,
    pub departures: Vec<NaiveTime>,
    /// Seconds from departure to arrival at each stop
    pub stop_offsets: HashMap<i64, i64>,
}

impl RouteSchedule {
    /// Next scheduled arrival of any trip at the given stop, at or after
    /// `now`. Looks one day ahead to cover the end-of-service wrap.
    pub fn next_scheduled_arrival(
        &self,
        stop_id: i64,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let offset_secs = *self.stop_offsets.get(&stop_id)?;
        let local_now = now.with_timezone(&self.timezone);

        for day in 0..=1u64 {
            let date = local_now.date_naive() + chrono::Days::new(day);
            for departure in &self.departures {
                let naive = date.and_time(*departure);
                let Some(local) = self.timezone.from_local_datetime(&naive).single() else {
                    // DST gap, skip this departure
                    continue;
                };
                let arrival = (local + chrono::Duration::seconds(offset_secs)).with_timezone(&Utc);
                if arrival >= now {
                    return Some(arrival);
                }
            }
        }
        None
    }
}

/// Shared registry of per-route schedules, swapped wholesale on directory
/// reload like the geometry snapshots.
#[derive(Clone, Default)]
pub struct ScheduleStore {
    inner: Arc<RwLock<HashMap<i64, Arc<RouteSchedule>>>>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, route_id: i64) -> Option<Arc<RouteSchedule>> {
        let inner = self.inner.read().await;
        inner.get(&route_id).cloned()
    }

    pub async fn insert(&self, schedule: RouteSchedule) {
        let mut inner = self.inner.write().await;
        inner.insert(schedule.route_id, Arc::new(schedule));
    }

    pub async fn replace_all(&self, schedules: Vec<RouteSchedule>) {
        let mut inner = self.inner.write().await;
        inner.clear();
        for schedule in schedules {
            inner.insert(schedule.route_id, Arc::new(schedule));
        }
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.len()
    }
}
