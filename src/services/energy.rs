//! Turns cumulative energy counters into monotonic hourly statistics.
//!
//! Each (home, room, metric) key keeps a cursor: the last raw counter value, its bucket
//! time and the running total. Buckets must arrive strictly after the cursor.
//!
//! - delta ≥ 0 is the increment
//! - delta < 0 is a counter reset; the new raw value is the increment
//! - an increment above `max_power_w × elapsed_hours` is suspect: recorded, kept out of
//!   the total, and the raw cursor still moves forward
//! - skipped hours between the cursor and a newer bucket are emitted as `Unknown` points

use crate::models::intuis::{HomeId, RoomId};
use chrono::{DateTime, TimeDelta, Utc};
use core::fmt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const DEFAULT_MAX_PLAUSIBLE_POWER_W: f64 = 10_000.0;
pub const STATISTIC_PREFIX: &str = "intuis";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Heating,
    HotWater,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::Heating, Metric::HotWater];

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Heating => "heating",
            Metric::HotWater => "hot_water",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Metric::ALL.into_iter().find(|m| m.as_str() == s)
    }

    /// Measurement type requested from `gethomemeasure`.
    pub fn measure_type(self) -> &'static str {
        match self {
            Metric::Heating => "sum_energy_elec_heating",
            Metric::HotWater => "sum_energy_elec_hot_water",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatisticKey {
    pub home_id: HomeId,
    pub room_id: RoomId,
    pub metric: Metric,
}

impl StatisticKey {
    pub fn new(home_id: HomeId, room_id: RoomId, metric: Metric) -> Self {
        StatisticKey {
            home_id,
            room_id,
            metric,
        }
    }

    /// Long-term statistic id, e.g. `intuis:home-1_r-salon_heating`.
    pub fn statistic_id(&self) -> String {
        format!(
            "{}:{}_{}_{}",
            STATISTIC_PREFIX,
            self.home_id.0,
            self.room_id.0,
            self.metric.as_str()
        )
    }
}

impl Display for StatisticKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.statistic_id())
    }
}

/// One raw hourly counter reading. Immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyBucket {
    pub key: StatisticKey,
    pub start: DateTime<Utc>,
    pub raw_wh: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointQuality {
    /// First reading ever seen for the key; no increment.
    Baseline,
    Normal,
    /// The counter went backwards.
    Reset,
    /// Implausibly large increment, excluded from the total.
    Suspect,
    /// No reading for this hour.
    Unknown,
}

impl PointQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            PointQuality::Baseline => "baseline",
            PointQuality::Normal => "normal",
            PointQuality::Reset => "reset",
            PointQuality::Suspect => "suspect",
            PointQuality::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "baseline" => Some(PointQuality::Baseline),
            "normal" => Some(PointQuality::Normal),
            "reset" => Some(PointQuality::Reset),
            "suspect" => Some(PointQuality::Suspect),
            "unknown" => Some(PointQuality::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyStatisticPoint {
    pub key: StatisticKey,
    pub time: DateTime<Utc>,
    pub raw_wh: Option<f64>,
    pub incremental_wh: f64,
    pub cumulative_wh: f64,
    pub quality: PointQuality,
    /// Increment left out of the total; only set on `Suspect` points.
    pub rejected_wh: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub time: DateTime<Utc>,
    pub raw_wh: Option<f64>,
    pub cumulative_wh: f64,
}

impl From<&EnergyStatisticPoint> for Cursor {
    fn from(p: &EnergyStatisticPoint) -> Self {
        Cursor {
            time: p.time,
            raw_wh: p.raw_wh,
            cumulative_wh: p.cumulative_wh,
        }
    }
}

/// A bucket at or before the cursor. Cursor and total are left unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleMeasurementError {
    pub key: StatisticKey,
    pub bucket_time: DateTime<Utc>,
    pub cursor_time: DateTime<Utc>,
}

impl Display for StaleMeasurementError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bucket {} for {} is not after cursor {}",
            self.bucket_time.to_rfc3339(),
            self.key,
            self.cursor_time.to_rfc3339()
        )
    }
}

impl Error for StaleMeasurementError {}

pub struct Reconciler {
    cursors: BTreeMap<StatisticKey, Cursor>,
    max_power_w: f64,
    step: TimeDelta,
}

impl Reconciler {
    pub fn new(max_power_w: f64, step: TimeDelta) -> Self {
        Reconciler {
            cursors: BTreeMap::new(),
            max_power_w,
            step,
        }
    }

    pub fn step(&self) -> TimeDelta {
        self.step
    }

    pub fn cursor(&self, key: &StatisticKey) -> Option<&Cursor> {
        self.cursors.get(key)
    }

    /// Seeds a key from its last persisted point.
    pub fn restore(&mut self, key: StatisticKey, cursor: Cursor) {
        debug!(
            "Energy: restored {} at {} (total {:.1} Wh)",
            key,
            cursor.time.to_rfc3339(),
            cursor.cumulative_wh
        );
        self.cursors.insert(key, cursor);
    }

    /// Drops a key so the next cycle restores it from the sink again.
    pub fn forget(&mut self, key: &StatisticKey) {
        self.cursors.remove(key);
    }

    /// Reconciles one bucket, returning the `Unknown` fillers followed by its own point.
    pub fn reconcile(&mut self, bucket: &EnergyBucket) -> Result<Vec<EnergyStatisticPoint>, StaleMeasurementError> {
        let key = &bucket.key;
        let Some(cursor) = self.cursors.get(key).cloned() else {
            let point = self.point(bucket, Some(bucket.raw_wh), 0.0, 0.0, PointQuality::Baseline);
            info!("Energy: {} baseline {:.1} Wh at {}", key, bucket.raw_wh, bucket.start.to_rfc3339());
            self.advance(key, &point);
            return Ok(vec![point]);
        };

        if bucket.start <= cursor.time {
            return Err(StaleMeasurementError {
                key: key.clone(),
                bucket_time: bucket.start,
                cursor_time: cursor.time,
            });
        }

        let mut points = Vec::new();
        let mut filler = cursor.time + self.step;
        while filler < bucket.start {
            points.push(EnergyStatisticPoint {
                key: key.clone(),
                time: filler,
                raw_wh: None,
                incremental_wh: 0.0,
                cumulative_wh: cursor.cumulative_wh,
                quality: PointQuality::Unknown,
                rejected_wh: None,
            });
            filler += self.step;
        }
        if !points.is_empty() {
            warn!("Energy: {} has {} hour(s) without a reading before {}", key, points.len(), bucket.start.to_rfc3339());
        }

        let Some(previous) = cursor.raw_wh else {
            // Nothing to diff against; start a new baseline on the existing total.
            let point = self.point(bucket, Some(bucket.raw_wh), 0.0, cursor.cumulative_wh, PointQuality::Baseline);
            self.advance(key, &point);
            points.push(point);
            return Ok(points);
        };

        let elapsed_hours = (bucket.start - cursor.time).num_seconds() as f64 / 3600.0;
        let ceiling = self.max_power_w * elapsed_hours;
        let delta = bucket.raw_wh - previous;
        let (increment, quality) = if delta >= 0.0 {
            (delta, PointQuality::Normal)
        } else {
            info!(
                "Energy: {} counter reset at {} ({:.1} → {:.1} Wh)",
                key,
                bucket.start.to_rfc3339(),
                previous,
                bucket.raw_wh
            );
            (bucket.raw_wh, PointQuality::Reset)
        };

        let point = if increment > ceiling {
            warn!(
                "Energy: {} increment {:.1} Wh over {:.1} h exceeds ceiling {:.1} Wh; excluded from total",
                key, increment, elapsed_hours, ceiling
            );
            let mut suspect = self.point(bucket, Some(bucket.raw_wh), 0.0, cursor.cumulative_wh, PointQuality::Suspect);
            suspect.rejected_wh = Some(increment);
            suspect
        } else {
            self.point(
                bucket,
                Some(bucket.raw_wh),
                increment,
                cursor.cumulative_wh + increment,
                quality,
            )
        };
        self.advance(key, &point);
        points.push(point);
        Ok(points)
    }

    fn point(
        &self,
        bucket: &EnergyBucket,
        raw_wh: Option<f64>,
        incremental_wh: f64,
        cumulative_wh: f64,
        quality: PointQuality,
    ) -> EnergyStatisticPoint {
        EnergyStatisticPoint {
            key: bucket.key.clone(),
            time: bucket.start,
            raw_wh,
            incremental_wh,
            cumulative_wh,
            quality,
            rejected_wh: None,
        }
    }

    fn advance(&mut self, key: &StatisticKey, point: &EnergyStatisticPoint) {
        self.cursors.insert(key.clone(), Cursor::from(point));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> StatisticKey {
        StatisticKey::new(HomeId("home-1".into()), RoomId("r-salon".into()), Metric::Heating)
    }

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 11, 14, 22, 0, 0).unwrap() + TimeDelta::hours(h)
    }

    fn bucket(h: i64, raw: f64) -> EnergyBucket {
        EnergyBucket {
            key: key(),
            start: hour(h),
            raw_wh: raw,
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(DEFAULT_MAX_PLAUSIBLE_POWER_W, TimeDelta::hours(1))
    }

    #[test]
    fn statistic_id_format() {
        assert_eq!(key().statistic_id(), "intuis:home-1_r-salon_heating");
        let hw = StatisticKey::new(HomeId("h".into()), RoomId("r".into()), Metric::HotWater);
        assert_eq!(hw.statistic_id(), "intuis:h_r_hot_water");
    }

    #[test]
    fn counter_reset_sequence() {
        let mut r = reconciler();
        let mut points = Vec::new();
        for (h, raw) in [100.0, 140.0, 30.0, 70.0].into_iter().enumerate() {
            points.extend(r.reconcile(&bucket(h as i64, raw)).expect("in order"));
        }
        let qualities: Vec<_> = points.iter().map(|p| p.quality).collect();
        assert_eq!(
            qualities,
            vec![
                PointQuality::Baseline,
                PointQuality::Normal,
                PointQuality::Reset,
                PointQuality::Normal
            ]
        );
        let increments: Vec<_> = points.iter().skip(1).map(|p| p.incremental_wh).collect();
        assert_eq!(increments, vec![40.0, 30.0, 40.0]);
        assert_eq!(points.last().map(|p| p.cumulative_wh), Some(110.0));
    }

    #[test]
    fn totals_never_decrease_and_increments_never_negative() {
        let mut r = reconciler();
        let raws = [5.0, 7.5, 7.5, 2.0, 900.0, 0.0, 0.0, 40_000.0, 40_010.0, 3.0];
        let mut last_total = 0.0;
        for (h, raw) in raws.into_iter().enumerate() {
            for p in r.reconcile(&bucket(h as i64, raw)).expect("in order") {
                assert!(p.incremental_wh >= 0.0, "negative increment at {}", p.time);
                assert!(p.cumulative_wh >= last_total, "total decreased at {}", p.time);
                last_total = p.cumulative_wh;
            }
        }
    }

    #[test]
    fn out_of_order_bucket_is_stale_and_leaves_total_alone() {
        let mut r = reconciler();
        r.reconcile(&bucket(0, 100.0)).expect("baseline");
        r.reconcile(&bucket(1, 150.0)).expect("normal");
        let before = r.cursor(&key()).cloned();

        let err = r.reconcile(&bucket(0, 120.0)).expect_err("stale");
        assert_eq!(err.bucket_time, hour(0));
        assert_eq!(err.cursor_time, hour(1));
        assert!(r.reconcile(&bucket(1, 160.0)).is_err());
        assert_eq!(r.cursor(&key()).cloned(), before);
        assert_eq!(before.map(|c| c.cumulative_wh), Some(50.0));
    }

    #[test]
    fn implausible_jump_is_suspect_and_excluded() {
        let mut r = Reconciler::new(1_000.0, TimeDelta::hours(1));
        r.reconcile(&bucket(0, 100.0)).expect("baseline");
        let points = r.reconcile(&bucket(1, 5_000.0)).expect("suspect");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].quality, PointQuality::Suspect);
        assert_eq!(points[0].cumulative_wh, 0.0);
        assert_eq!(points[0].incremental_wh, 0.0);
        assert_eq!(points[0].rejected_wh, Some(4_900.0));
        // the next reading diffs against the suspect raw value
        let next = r.reconcile(&bucket(2, 5_300.0)).expect("normal");
        assert_eq!(next[0].incremental_wh, 300.0);
        assert_eq!(next[0].cumulative_wh, 300.0);
    }

    #[test]
    fn gaps_become_unknown_points_and_ceiling_scales() {
        let mut r = Reconciler::new(1_000.0, TimeDelta::hours(1));
        r.reconcile(&bucket(0, 100.0)).expect("baseline");
        // 2500 Wh over 3 h is within 3 × 1000 Wh
        let points = r.reconcile(&bucket(3, 2_600.0)).expect("after gap");
        let qualities: Vec<_> = points.iter().map(|p| p.quality).collect();
        assert_eq!(
            qualities,
            vec![PointQuality::Unknown, PointQuality::Unknown, PointQuality::Normal]
        );
        assert_eq!(points[0].time, hour(1));
        assert_eq!(points[1].time, hour(2));
        assert!(points[..2].iter().all(|p| p.incremental_wh == 0.0 && p.raw_wh.is_none()));
        assert_eq!(points[2].incremental_wh, 2_500.0);
        assert_eq!(points[2].cumulative_wh, 2_500.0);
    }

    #[test]
    fn restored_cursor_continues_the_total() {
        let mut r = reconciler();
        r.restore(
            key(),
            Cursor {
                time: hour(3),
                raw_wh: Some(70.0),
                cumulative_wh: 110.0,
            },
        );
        let points = r.reconcile(&bucket(4, 95.0)).expect("continues");
        assert_eq!(points[0].quality, PointQuality::Normal);
        assert_eq!(points[0].cumulative_wh, 135.0);
    }
}
