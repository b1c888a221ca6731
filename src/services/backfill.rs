//! Statistics backfill coordinator and hourly energy worker.
//!
//! Every cycle, per home:
//! 1. restore each key's cursor from the sink the first time it is seen (never from zero);
//! 2. request exactly the missing window `[oldest cursor + 1 h, current hour)`, with the
//!    start capped at `now − max_lookback`;
//! 3. reconcile the buckets and append the points.
//!
//! Buckets at or before a cursor are already persisted and are skipped, so re-running over
//! a covered window writes nothing.

use crate::client::{ClientError, HeatingApi};
use crate::models::intuis::{
    HomeId, HomeMeasure, MEASURE_SCALE_HOUR, MeasureHome, MeasureRequest, MeasureRoom, MeasureSeries, RoomId,
};
use crate::services::energy::{Cursor, EnergyBucket, EnergyStatisticPoint, Metric, Reconciler, StatisticKey};
use crate::services::ingest::{SinkError, StatisticsSink};
use crate::services::topology::{Home, Topology};
use crate::state::{CycleOutcome, Shared, Versioned};
use crate::utils::{floor_to_hour, from_unix};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use log::{debug, info, warn};
use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ENERGY_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_LOOKBACK_HOURS: u64 = 720;

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    /// When false only the last complete hour is requested.
    pub enabled: bool,
    pub max_lookback: TimeDelta,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        BackfillSettings {
            enabled: true,
            max_lookback: TimeDelta::hours(DEFAULT_MAX_LOOKBACK_HOURS as i64),
        }
    }
}

/// Measurement request plan for one home.
#[derive(Debug, Clone, PartialEq)]
pub struct HomePlan {
    pub home_id: HomeId,
    pub rooms: Vec<RoomPlan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomPlan {
    pub room: MeasureRoom,
    /// Column order of the response rows.
    pub metrics: Vec<Metric>,
}

impl HomePlan {
    pub fn keys(&self) -> impl Iterator<Item = StatisticKey> + '_ {
        self.rooms.iter().flat_map(move |r| {
            r.metrics
                .iter()
                .map(move |m| StatisticKey::new(self.home_id.clone(), r.room.id.clone(), *m))
        })
    }
}

/// Rooms with a measurement bridge, with heating for rooms that have a heating module and
/// hot water for rooms that have a water heater.
pub fn plan_home(home: &Home) -> HomePlan {
    let mut rooms = Vec::new();
    for room in home.rooms.values() {
        let mut metrics = Vec::new();
        if room.heating_module.is_some() {
            metrics.push(Metric::Heating);
        }
        if room.water_heater_module.is_some() {
            metrics.push(Metric::HotWater);
        }
        if metrics.is_empty() {
            continue;
        }
        let Some(bridge) = home.measurement_bridge(room) else {
            debug!(
                "Energy: room {} in home {} has no bridge to measure through; skipping",
                room.id.0, home.id.0
            );
            continue;
        };
        rooms.push(RoomPlan {
            room: MeasureRoom {
                id: room.id.clone(),
                bridge,
                measure_types: metrics.iter().map(|m| m.measure_type()).collect::<Vec<_>>().join(","),
            },
            metrics,
        });
    }
    HomePlan {
        home_id: home.id.clone(),
        rooms,
    }
}

/// Window `[from, to)` still missing, or `None` when up to date.
///
/// `next_needed` holds, per key, the first hour not yet covered; `None` means the key has
/// no history and everything back to the lookback cap is wanted.
pub fn missing_window(
    next_needed: &[Option<DateTime<Utc>>],
    now: DateTime<Utc>,
    step: TimeDelta,
    settings: &BackfillSettings,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let to = floor_to_hour(now);
    let lower = floor_to_hour(to - settings.max_lookback);
    let mut from = next_needed
        .iter()
        .map(|t| t.map_or(lower, floor_to_hour))
        .min()?
        .max(lower);
    if !settings.enabled {
        from = from.max(to - step);
    }
    (from < to).then_some((from, to))
}

fn format_window(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        "[{}, {})",
        from.to_rfc3339_opts(SecondsFormat::Secs, true),
        to.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Splits a measurement response into per-key buckets, sorted by time.
pub fn extract_buckets(plan: &HomePlan, measure: &HomeMeasure) -> BTreeMap<StatisticKey, Vec<EnergyBucket>> {
    let mut out: BTreeMap<StatisticKey, Vec<EnergyBucket>> = BTreeMap::new();
    for rm in measure.rooms.as_deref().unwrap_or(&[]) {
        let Some(room_id) = rm.id.as_ref() else { continue };
        let Some(room_plan) = plan.rooms.iter().find(|r| &r.room.id == room_id) else {
            debug!("Energy: ignoring measurements for unrequested room {}", room_id.0);
            continue;
        };
        for series in rm.measures.as_deref().unwrap_or(&[]) {
            collect_series(&plan.home_id, room_id, &room_plan.metrics, series, &mut out);
        }
    }
    for buckets in out.values_mut() {
        buckets.sort_by_key(|b| b.start);
    }
    out
}

fn collect_series(
    home_id: &HomeId,
    room_id: &RoomId,
    metrics: &[Metric],
    series: &MeasureSeries,
    out: &mut BTreeMap<StatisticKey, Vec<EnergyBucket>>,
) {
    let Some(begin) = series.beg_time else {
        warn!("Energy: series for room {} has no beg_time; skipping", room_id.0);
        return;
    };
    let step = series.step_time.unwrap_or(3600);
    for (i, row) in series.value.iter().enumerate() {
        let offset = i64::try_from(i).ok().and_then(|i| step.checked_mul(i));
        let Some(start) = offset.and_then(|o| begin.checked_add(o)).and_then(from_unix) else {
            warn!(
                "Energy: series for room {} has an out-of-range timestamp at row {}; skipping",
                room_id.0, i
            );
            continue;
        };
        for (metric, value) in metrics.iter().zip(row.iter()) {
            match value {
                Some(raw) if raw.is_finite() && *raw >= 0.0 => {
                    let key = StatisticKey::new(home_id.clone(), room_id.clone(), *metric);
                    out.entry(key.clone()).or_default().push(EnergyBucket {
                        key,
                        start: floor_to_hour(start),
                        raw_wh: *raw,
                    });
                }
                Some(raw) => warn!(
                    "Energy: room {} {} reported invalid counter {} at {}",
                    room_id.0,
                    metric.as_str(),
                    raw,
                    start.to_rfc3339()
                ),
                None => {}
            }
        }
    }
}

/// Why one home was skipped for a cycle.
#[derive(Debug)]
enum SyncError {
    Upstream(ClientError),
    /// The last persisted point could not be read, so no cursor can be trusted.
    Sink(SinkError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Upstream(e) => write!(f, "{}", e),
            SyncError::Sink(e) => write!(f, "restoring cursors: {}", e),
        }
    }
}

impl From<ClientError> for SyncError {
    fn from(value: ClientError) -> Self {
        SyncError::Upstream(value)
    }
}

impl From<SinkError> for SyncError {
    fn from(value: SinkError) -> Self {
        SyncError::Sink(value)
    }
}

pub struct EnergyWorker<S: StatisticsSink> {
    api: Arc<dyn HeatingApi>,
    topology: Arc<Shared<Topology>>,
    sink: S,
    reconciler: Reconciler,
    settings: BackfillSettings,
    /// Window end already fetched for keys that never produced a bucket.
    covered: BTreeMap<StatisticKey, DateTime<Utc>>,
    topology_version: u64,
}

impl<S: StatisticsSink> EnergyWorker<S> {
    pub fn new(
        api: Arc<dyn HeatingApi>,
        topology: Arc<Shared<Topology>>,
        sink: S,
        reconciler: Reconciler,
        settings: BackfillSettings,
    ) -> Self {
        EnergyWorker {
            api,
            topology,
            sink,
            reconciler,
            settings,
            covered: BTreeMap::new(),
            topology_version: 0,
        }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// One energy cycle over every home. Only an authentication failure is fatal.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, String> {
        let Versioned { version, value: topo } = self.topology.load_versioned();
        if version != self.topology_version {
            let live: BTreeSet<StatisticKey> = topo
                .homes
                .values()
                .flat_map(|h| plan_home(h).keys().collect::<Vec<_>>())
                .collect();
            self.covered.retain(|k, _| live.contains(k));
            info!("Energy: topology version {} in use, {} energy feed(s)", version, live.len());
            self.topology_version = version;
        }
        let mut failures = Vec::new();
        for home in topo.homes.values() {
            match self.sync_home(home, now) {
                Ok(_) => {}
                Err(SyncError::Upstream(ClientError::Auth(e))) => {
                    return Ok(CycleOutcome::Fatal(format!("energy fetch for home {}: {}", home.id.0, e)));
                }
                Err(e) => failures.push(format!("home {}: {}", home.id.0, e)),
            }
        }
        if failures.is_empty() {
            Ok(CycleOutcome::Continue)
        } else {
            Err(failures.join("; "))
        }
    }

    /// Returns the number of points written for the home.
    fn sync_home(&mut self, home: &Home, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let plan = plan_home(home);
        if plan.rooms.is_empty() {
            debug!("Energy: home {} has no measurable rooms", home.id.0);
            return Ok(0);
        }

        let keys: Vec<StatisticKey> = plan.keys().collect();
        for key in &keys {
            self.restore_cursor(key)?;
        }

        let step = self.reconciler.step();
        let next_needed: Vec<Option<DateTime<Utc>>> = keys
            .iter()
            .map(|k| match self.reconciler.cursor(k) {
                Some(c) => Some(c.time + step),
                None => self.covered.get(k).copied(),
            })
            .collect();
        let Some((from, to)) = missing_window(&next_needed, now, step, &self.settings) else {
            debug!("Energy: home {} is up to date", home.id.0);
            return Ok(0);
        };
        if to - from > step {
            info!(
                "Backfill: home {} requesting {} ({} hour(s))",
                home.id.0,
                format_window(from, to),
                (to - from).num_hours()
            );
        }

        let request = MeasureRequest {
            home: MeasureHome {
                id: home.id.clone(),
                rooms: plan.rooms.iter().map(|r| r.room.clone()).collect(),
            },
            scale: MEASURE_SCALE_HOUR.to_string(),
            date_begin: from.timestamp(),
            date_end: to.timestamp(),
            real_time: false,
        };
        let measure = self.api.home_measure(&request)?;
        for key in keys {
            self.covered.insert(key, to);
        }

        let mut written = 0usize;
        for (key, buckets) in extract_buckets(&plan, &measure) {
            let points = self.reconcile_key(&key, &buckets, to);
            if points.is_empty() {
                continue;
            }
            match self.sink.append(&points) {
                Ok(n) => written += n,
                Err(e) => {
                    // Re-read from the sink next cycle so nothing is skipped.
                    warn!("Energy: persisting {} point(s) for {} failed: {}", points.len(), key, e);
                    self.reconciler.forget(&key);
                    self.covered.remove(&key);
                }
            }
        }
        info!(
            "Energy: home {} window {} persisted {} point(s)",
            home.id.0,
            format_window(from, to),
            written
        );
        Ok(written)
    }

    /// A read failure skips the home: starting over from zero would make the total go backwards.
    fn restore_cursor(&mut self, key: &StatisticKey) -> Result<(), SinkError> {
        if self.reconciler.cursor(key).is_some() {
            return Ok(());
        }
        match self.sink.last_point(key)? {
            Some(point) => self.reconciler.restore(key.clone(), Cursor::from(&point)),
            None => debug!("Energy: no persisted point for {}; the first bucket becomes the baseline", key),
        }
        Ok(())
    }

    fn reconcile_key(
        &mut self,
        key: &StatisticKey,
        buckets: &[EnergyBucket],
        to: DateTime<Utc>,
    ) -> Vec<EnergyStatisticPoint> {
        let mut points = Vec::new();
        let mut already_persisted = 0usize;
        for bucket in buckets.iter().filter(|b| b.start < to) {
            // Anything at or before the cursor it started from was persisted earlier.
            if self.reconciler.cursor(key).is_some_and(|c| bucket.start <= c.time) && points.is_empty() {
                already_persisted += 1;
                continue;
            }
            match self.reconciler.reconcile(bucket) {
                Ok(mut p) => points.append(&mut p),
                Err(e) => warn!("Energy: dropping bucket: {}", e),
            }
        }
        if already_persisted > 0 {
            debug!("Energy: {} bucket(s) for {} already persisted", already_persisted, key);
        }
        points
    }
}
