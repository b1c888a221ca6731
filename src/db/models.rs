//! Diesel model structs for the persisted energy statistics.
//!
//! Important: the migration turns `energy_statistics` into a TimescaleDB hypertable.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::intuis::{HomeId, RoomId};
use crate::schema;
use crate::services::energy::{EnergyStatisticPoint, Metric, PointQuality, StatisticKey};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::energy_statistics)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct EnergyStatistic {
    pub statistic_id: String,
    pub time: DateTime<Utc>,
    pub home_id: String,
    pub room_id: String,
    pub metric: String,
    pub raw_wh: Option<f64>,
    pub incremental_wh: f64,
    pub cumulative_wh: f64,
    pub quality: String,
    pub recorded_at: DateTime<Utc>,
    pub rejected_wh: Option<f64>,
}

impl EnergyStatistic {
    /// Rebuilds the in-memory point, failing on metric or quality names this build
    /// does not know.
    pub fn to_point(&self) -> Result<EnergyStatisticPoint, String> {
        let metric = Metric::parse(&self.metric).ok_or_else(|| format!("unknown metric {:?}", self.metric))?;
        let quality =
            PointQuality::parse(&self.quality).ok_or_else(|| format!("unknown quality {:?}", self.quality))?;
        Ok(EnergyStatisticPoint {
            key: StatisticKey::new(HomeId(self.home_id.clone()), RoomId(self.room_id.clone()), metric),
            time: self.time,
            raw_wh: self.raw_wh,
            incremental_wh: self.incremental_wh,
            cumulative_wh: self.cumulative_wh,
            quality,
            rejected_wh: self.rejected_wh,
        })
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::energy_statistics)]
pub struct NewEnergyStatistic {
    pub statistic_id: String,
    pub time: DateTime<Utc>,
    pub home_id: String,
    pub room_id: String,
    pub metric: String,
    pub raw_wh: Option<f64>,
    pub incremental_wh: f64,
    pub cumulative_wh: f64,
    pub quality: String,
    pub rejected_wh: Option<f64>,
}

impl From<&EnergyStatisticPoint> for NewEnergyStatistic {
    fn from(p: &EnergyStatisticPoint) -> Self {
        NewEnergyStatistic {
            statistic_id: p.key.statistic_id(),
            time: p.time,
            home_id: p.key.home_id.0.clone(),
            room_id: p.key.room_id.0.clone(),
            metric: p.key.metric.as_str().to_string(),
            raw_wh: p.raw_wh,
            incremental_wh: p.incremental_wh,
            cumulative_wh: p.cumulative_wh,
            quality: p.quality.as_str().to_string(),
            rejected_wh: p.rejected_wh,
        }
    }
}
