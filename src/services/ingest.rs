//! Statistics sink: where reconciled energy points are persisted and where cursors are
//! restored from.

use crate::db::models::{EnergyStatistic, NewEnergyStatistic};
use crate::schema;
use crate::services::energy::{EnergyStatisticPoint, StatisticKey, STATISTIC_PREFIX};
use core::fmt;
use diesel::prelude::*;
use diesel::PgConnection;
use std::error::Error;
use std::fmt::{Display, Formatter};

// Keeps each insert well below the Postgres bind-parameter limit.
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    Database(String),
    /// A stored row could not be turned back into a point.
    Corrupt { statistic_id: String, message: String },
}

impl Display for SinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Database(e) => write!(f, "database error: {}", e),
            SinkError::Corrupt { statistic_id, message } => {
                write!(f, "stored statistic {} is unreadable: {}", statistic_id, message)
            }
        }
    }
}

impl Error for SinkError {}

impl From<diesel::result::Error> for SinkError {
    fn from(value: diesel::result::Error) -> Self {
        SinkError::Database(value.to_string())
    }
}

pub trait StatisticsSink: Send {
    /// Latest persisted point for a key, if any.
    fn last_point(&mut self, key: &StatisticKey) -> Result<Option<EnergyStatisticPoint>, SinkError>;

    /// Appends points. Points already stored for the same key and hour are left as is;
    /// returns the number actually written.
    fn append(&mut self, points: &[EnergyStatisticPoint]) -> Result<usize, SinkError>;

    /// Deletes every point of this integration; returns the number of rows removed.
    fn clear(&mut self) -> Result<usize, SinkError>;
}

pub struct PgStatisticsSink {
    conn: PgConnection,
}

impl PgStatisticsSink {
    pub fn new(conn: PgConnection) -> Self {
        PgStatisticsSink { conn }
    }
}

impl StatisticsSink for PgStatisticsSink {
    fn last_point(&mut self, key: &StatisticKey) -> Result<Option<EnergyStatisticPoint>, SinkError> {
        use schema::energy_statistics::dsl as E;

        let statistic_id = key.statistic_id();
        let row: Option<EnergyStatistic> = E::energy_statistics
            .filter(E::statistic_id.eq(&statistic_id))
            .order(E::time.desc())
            .select(EnergyStatistic::as_select())
            .first(&mut self.conn)
            .optional()?;

        row.map(|r| {
            r.to_point()
                .map_err(|message| SinkError::Corrupt { statistic_id, message })
        })
        .transpose()
    }

    fn append(&mut self, points: &[EnergyStatisticPoint]) -> Result<usize, SinkError> {
        if points.is_empty() {
            return Ok(0);
        }

        use schema::energy_statistics::dsl as E;

        let rows: Vec<NewEnergyStatistic> = points.iter().map(NewEnergyStatistic::from).collect();
        let mut inserted = 0usize;
        for chunk in rows.chunks(INSERT_CHUNK) {
            inserted += diesel::insert_into(E::energy_statistics)
                .values(chunk)
                .on_conflict((E::statistic_id, E::time))
                .do_nothing()
                .execute(&mut self.conn)?;
        }
        Ok(inserted)
    }

    fn clear(&mut self) -> Result<usize, SinkError> {
        use schema::energy_statistics::dsl as E;

        let pattern = format!("{}:%", STATISTIC_PREFIX);
        let deleted = diesel::delete(E::energy_statistics.filter(E::statistic_id.like(pattern)))
            .execute(&mut self.conn)?;
        Ok(deleted)
    }
}
