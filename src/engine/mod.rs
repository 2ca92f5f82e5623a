//! Bus position and ETA estimation engine.
//!
//! This module owns the live pipeline:
//! - per-bus worker tasks applying accepted fixes in order
//! - debounced ETA recomputation and delta-gated broadcasting
//! - the periodic staleness sweep demoting silent buses

pub mod eta;
pub mod geometry;
pub mod hub;
pub mod ingest;
pub mod state;

pub use eta::{Eta, EtaError, EtaMethod};
pub use hub::{ClientId, EngineEvent, Hub, SharedHub, Topic};
pub use ingest::{GpsFix, RejectReason};
pub use state::{BusProgress, BusStateStore, BusStatus};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::providers::directory::{DirectoryError, RouteDirectory, ScheduleStore};
use geometry::{GeometryError, RouteIndex};

/// Queue depth per bus worker. Bursts beyond this within one debounce
/// window are coalesced away regardless, so overflow only sheds load.
const WORKER_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Route geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Route directory error: {0}")]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone)]
struct CachedEtas {
    computed_at: DateTime<Utc>,
    etas: Arc<Vec<Eta>>,
}

#[derive(Debug, Clone, Copy)]
struct PublishedEta {
    estimated_arrival: DateTime<Utc>,
    method: EtaMethod,
}

/// Counts reported by `install_directory`.
#[derive(Debug, Clone, Copy)]
pub struct DirectorySummary {
    pub routes: usize,
    pub schedules: usize,
    pub assignments: usize,
}

/// The long-running engine service. One instance per process, shared
/// behind an `Arc` between the HTTP handlers, the WebSocket layer and the
/// background sweep.
pub struct Engine {
    config: EngineConfig,
    index: RouteIndex,
    schedules: ScheduleStore,
    store: BusStateStore,
    hub: SharedHub,
    /// bus_id -> route_id, from the route directory
    assignments: RwLock<HashMap<i64, i64>>,
    /// bus_id -> ordered fix queue of the bus's worker task
    workers: RwLock<HashMap<i64, mpsc::Sender<GpsFix>>>,
    eta_cache: RwLock<HashMap<i64, CachedEtas>>,
    /// (bus_id, stop_id) -> last broadcast ETA, for delta gating
    published_etas: RwLock<HashMap<(i64, i64), PublishedEta>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            index: RouteIndex::new(),
            schedules: ScheduleStore::new(),
            store: BusStateStore::new(),
            hub: Arc::new(Hub::new()),
            assignments: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            eta_cache: RwLock::new(HashMap::new()),
            published_etas: RwLock::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> SharedHub {
        self.hub.clone()
    }

    pub async fn routes_loaded(&self) -> usize {
        self.index.len().await
    }

    pub async fn schedules_loaded(&self) -> usize {
        self.schedules.len().await
    }

    pub async fn tracked_buses(&self) -> usize {
        self.store.len().await
    }

    /// Swap in a freshly loaded route directory: geometry snapshots,
    /// schedules and bus assignments. Synchronous with respect to readers;
    /// in-flight projections keep using the old snapshots they hold.
    pub async fn install_directory(
        &self,
        directory: &RouteDirectory,
    ) -> Result<DirectorySummary, EngineError> {
        let mut schedules = Vec::new();
        for route in &directory.routes {
            self.index
                .rebuild(route.id, route.name.clone(), route.geometry_stops())
                .await?;
            if let Some(schedule) = route.build_schedule()? {
                schedules.push(schedule);
            }
        }

        // Drop routes that disappeared from the directory
        let kept: std::collections::HashSet<i64> =
            directory.routes.iter().map(|r| r.id).collect();
        for route_id in self.index.route_ids().await {
            if !kept.contains(&route_id) {
                self.index.remove(route_id).await;
            }
        }

        let schedule_count = schedules.len();
        self.schedules.replace_all(schedules).await;

        let mut assignments = self.assignments.write().await;
        assignments.clear();
        for assignment in &directory.assignments {
            assignments.insert(assignment.bus_id, assignment.route_id);
        }

        let summary = DirectorySummary {
            routes: directory.routes.len(),
            schedules: schedule_count,
            assignments: assignments.len(),
        };
        info!(
            routes = summary.routes,
            schedules = summary.schedules,
            assignments = summary.assignments,
            "Installed route directory"
        );
        Ok(summary)
    }

    /// Telemetry gateway entry point: validate one fix and hand it to the
    /// bus's worker. Rejections carry the reason; duplicates are expected
    /// client retries and not an error worth alarming the driver about.
    pub async fn ingest(self: &Arc<Self>, fix: GpsFix) -> Result<(), RejectReason> {
        ingest::validate_bounds(&self.config, &fix)?;

        let route_id = {
            let assignments = self.assignments.read().await;
            assignments.get(&fix.bus_id).copied()
        };
        if route_id.is_none() {
            return Err(RejectReason::UnknownBus);
        }

        let previous = self.store.last_fix(fix.bus_id).await;
        ingest::validate_against_previous(&self.config, previous.as_ref(), &fix)?;

        let bus_id = fix.bus_id;
        let sender = self.worker_sender(bus_id).await;
        if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(fix) {
            // The debounce would collapse the burst anyway; shed the excess
            debug!(bus_id, "Fix queue full, shedding burst");
        }
        Ok(())
    }

    async fn worker_sender(self: &Arc<Self>, bus_id: i64) -> mpsc::Sender<GpsFix> {
        {
            let workers = self.workers.read().await;
            if let Some(sender) = workers.get(&bus_id) {
                return sender.clone();
            }
        }

        let mut workers = self.workers.write().await;
        if let Some(sender) = workers.get(&bus_id) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
        workers.insert(bus_id, tx.clone());
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            run_bus_worker(engine, bus_id, rx).await;
        });
        debug!(bus_id, "Spawned bus worker");
        tx
    }

    /// Apply one accepted fix to the bus's progress record. Returns false
    /// when the fix was dropped (stale under the authoritative ordered
    /// check, or no usable route geometry).
    async fn apply_fix(&self, bus_id: i64, fix: GpsFix) -> bool {
        let route_id = {
            let assignments = self.assignments.read().await;
            match assignments.get(&bus_id).copied() {
                Some(route_id) => route_id,
                None => return false,
            }
        };

        let Some(geometry) = self.index.get(route_id).await else {
            debug!(bus_id, route_id, "No geometry for assigned route, dropping fix");
            return false;
        };

        // Reassigned buses start a fresh progress record
        let previous = self
            .store
            .get(bus_id)
            .await
            .filter(|p| p.route_id == route_id);

        // Authoritative ordering check inside the single-writer path
        if let Some(last) = previous.as_ref().and_then(|p| p.last_fix()) {
            if fix.client_timestamp <= last.client_timestamp {
                return false;
            }
        }

        let projection = geometry.project(fix.lat, fix.lon);
        let progress = state::advance(
            &self.config,
            previous.as_ref(),
            route_id,
            &fix,
            &projection,
            &geometry,
        );
        self.store.upsert(bus_id, progress).await;
        true
    }

    /// ETAs for one bus from its current snapshot, served from the sub-TTL
    /// cache when the underlying state has not moved since.
    pub async fn etas_for_bus(&self, bus_id: i64) -> Result<Arc<Vec<Eta>>, EtaError> {
        let Some(progress) = self.store.get(bus_id).await else {
            return Ok(Arc::new(Vec::new()));
        };

        let now = Utc::now();
        {
            let cache = self.eta_cache.read().await;
            if let Some(cached) = cache.get(&bus_id) {
                let fresh = now - cached.computed_at
                    < Duration::seconds(self.config.eta_cache_secs as i64)
                    && cached.computed_at >= progress.last_updated_at;
                if fresh {
                    return Ok(cached.etas.clone());
                }
            }
        }

        let geometry = self
            .index
            .get(progress.route_id)
            .await
            .ok_or(EtaError::NoRouteData(progress.route_id))?;
        let schedule = self.schedules.get(progress.route_id).await;

        let etas = Arc::new(eta::estimate(
            &self.config,
            bus_id,
            &progress,
            &geometry,
            schedule.as_deref(),
            now,
        ));

        let mut cache = self.eta_cache.write().await;
        cache.insert(
            bus_id,
            CachedEtas {
                computed_at: now,
                etas: etas.clone(),
            },
        );
        Ok(etas)
    }

    /// Pull-based snapshot for clients without a live connection. `None`
    /// when no known route serves the stop.
    pub async fn etas_for_stop(&self, stop_id: i64) -> Option<Vec<Eta>> {
        let serving = self.index.routes_serving(stop_id).await;
        if serving.is_empty() {
            return None;
        }

        let mut results = Vec::new();
        for geometry in serving {
            for bus_id in self.store.buses_on_route(geometry.route_id).await {
                match self.etas_for_bus(bus_id).await {
                    Ok(etas) => {
                        results.extend(etas.iter().filter(|e| e.stop_id == stop_id).cloned())
                    }
                    // One bad bus never hides the rest of the fleet
                    Err(e) => debug!(bus_id, error = %e, "Excluding bus from stop ETAs"),
                }
            }
        }

        results.sort_by(|a, b| {
            a.eta_minutes
                .partial_cmp(&b.eta_minutes)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Some(results)
    }

    /// Live progress snapshots for a route. `None` when the route is
    /// unknown to the geometry index.
    pub async fn buses_on_route(&self, route_id: i64) -> Option<Vec<(i64, BusProgress)>> {
        self.index.get(route_id).await?;
        let mut buses = Vec::new();
        for bus_id in self.store.buses_on_route(route_id).await {
            if let Some(progress) = self.store.get(bus_id).await {
                buses.push((bus_id, progress));
            }
        }
        Some(buses)
    }

    /// Recompute the bus's ETAs and fan the results out: the position goes
    /// to the route topic, and each stop whose prediction moved materially
    /// gets an ETA event on its own topic.
    async fn recompute_and_publish(&self, bus_id: i64) {
        let Some(progress) = self.store.get(bus_id).await else {
            return;
        };
        let route_id = progress.route_id;

        let etas = match self.etas_for_bus(bus_id).await {
            Ok(etas) => etas,
            Err(e) => {
                debug!(bus_id, error = %e, "Skipping broadcast");
                return;
            }
        };

        let now = Utc::now();
        if let Some(last) = progress.last_fix() {
            let geometry = self.index.get(route_id).await;
            let next_stop_id = geometry.as_ref().and_then(|g| {
                g.points()
                    .get(progress.projected_stop_index)
                    .map(|p| p.stop_id)
            });
            self.hub
                .publish(
                    Topic::Route(route_id),
                    EngineEvent::Position {
                        bus_id,
                        route_id,
                        lat: last.lat,
                        lon: last.lon,
                        distance_along_km: progress.projected_distance_km,
                        next_stop_id,
                        speed_kmh: progress.smoothed_speed_kmh,
                        status: progress.status,
                        timestamp: now.to_rfc3339(),
                    },
                )
                .await;
        }

        let mut published = self.published_etas.write().await;
        for eta in etas.iter() {
            let key = (bus_id, eta.stop_id);
            let material = match published.get(&key) {
                None => true,
                Some(prev) => {
                    prev.method != eta.method
                        || (eta.estimated_arrival - prev.estimated_arrival)
                            .num_seconds()
                            .abs()
                            > self.config.eta_delta_secs
                }
            };
            if material {
                published.insert(
                    key,
                    PublishedEta {
                        estimated_arrival: eta.estimated_arrival,
                        method: eta.method,
                    },
                );
                self.hub
                    .publish(Topic::Stop(eta.stop_id), EngineEvent::Eta { eta: eta.clone() })
                    .await;
            }
        }
    }

    /// Run the staleness sweep forever. Spawned once at startup.
    pub async fn start(self: Arc<Self>) {
        info!(
            interval_secs = self.config.sweep_interval_secs,
            "Starting staleness monitor"
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            self.sweep(Utc::now()).await;
        }
    }

    /// One staleness pass over all tracked buses: demote silent buses,
    /// broadcast the downgrade, and retire records that stayed offline
    /// beyond the retention window.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        for (bus_id, _) in self.store.snapshot().await {
            // Re-read inside the loop: a fix may have landed meanwhile
            let Some(progress) = self.store.get(bus_id).await else {
                continue;
            };
            let age = progress.signal_age(now);

            if progress.status == BusStatus::Offline
                && age >= Duration::seconds(self.config.retention_secs as i64)
            {
                info!(bus_id, "Retiring bus record after offline retention");
                self.remove_bus(bus_id).await;
                continue;
            }

            let Some(next) = state::staleness_transition(&self.config, progress.status, age)
            else {
                continue;
            };

            let changed = match next {
                BusStatus::Offline => self.store.mark_offline(bus_id).await,
                other => self.store.set_status(bus_id, other).await,
            };
            if changed {
                warn!(
                    bus_id,
                    status = next.as_str(),
                    silent_secs = age.num_seconds(),
                    "Bus demoted by staleness sweep"
                );
                // A demotion changes the estimation basis without a new fix,
                // so the cached ETAs are no longer valid
                {
                    let mut cache = self.eta_cache.write().await;
                    cache.remove(&bus_id);
                }
                self.hub
                    .publish(
                        Topic::Route(progress.route_id),
                        EngineEvent::BusStatus {
                            bus_id,
                            route_id: progress.route_id,
                            status: next,
                            timestamp: now.to_rfc3339(),
                        },
                    )
                    .await;
                // Push the confidence downgrade to stop subscribers promptly
                self.recompute_and_publish(bus_id).await;
            }
        }
    }

    async fn remove_bus(&self, bus_id: i64) {
        self.store.remove(bus_id).await;
        {
            // Dropping the sender ends the worker task
            let mut workers = self.workers.write().await;
            workers.remove(&bus_id);
        }
        {
            let mut cache = self.eta_cache.write().await;
            cache.remove(&bus_id);
        }
        let mut published = self.published_etas.write().await;
        published.retain(|(id, _), _| *id != bus_id);
    }
}

/// Per-bus pipeline: applies fixes strictly in arrival order, coalesces
/// bursts within the debounce window, then recomputes and broadcasts once.
async fn run_bus_worker(engine: Arc<Engine>, bus_id: i64, mut rx: mpsc::Receiver<GpsFix>) {
    let debounce = std::time::Duration::from_millis(engine.config.debounce_ms);

    while let Some(fix) = rx.recv().await {
        let mut applied = engine.apply_fix(bus_id, fix).await;

        let deadline = tokio::time::Instant::now() + debounce;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(next)) => {
                    applied |= engine.apply_fix(bus_id, next).await;
                }
                Ok(None) => return,
                // Window elapsed, flush what we have
                Err(_) => break,
            }
        }

        if applied {
            engine.recompute_and_publish(bus_id).await;
        }
    }
    debug!(bus_id, "Bus worker stopped");
}
