//! Test doubles and fixture loaders shared by the unit tests.

use crate::client::{ClientError, HeatingApi};
use crate::models::intuis::*;
use crate::services::energy::{EnergyStatisticPoint, StatisticKey, STATISTIC_PREFIX};
use crate::services::ingest::{SinkError, StatisticsSink};
use crate::services::topology::{self, Topology};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

fn load<T: serde::de::DeserializeOwned>(path: &str) -> T {
    let json = std::fs::read_to_string(path).expect("fixture present");
    let resp: ApiResponse<T> = serde_json::from_str(&json).expect("fixture parses");
    resp.body.expect("fixture has a body")
}

pub fn fixture_homes() -> HomesData {
    load("tests/data/homesdata.json")
}

pub fn fixture_status() -> HomeStatus {
    load::<HomeStatusBody>("tests/data/homestatus.json")
        .home
        .expect("fixture has a home")
}

pub fn fixture_measure() -> HomeMeasure {
    load::<HomeMeasureBody>("tests/data/homemeasure.json")
        .home
        .expect("fixture has a home")
}

pub fn fixture_topology() -> Topology {
    topology::resolve(&fixture_homes()).expect("fixture resolves")
}

fn not_scripted(what: &str) -> ClientError {
    ClientError::Transport(format!("{} not scripted", what))
}

/// Scriptable stand-in for the cloud API.
///
/// Status answers are taken from the queue first, then from the default.
#[derive(Default)]
pub struct FakeApi {
    homes: Mutex<Option<HomesData>>,
    homes_calls: AtomicUsize,
    status_queue: Mutex<VecDeque<Result<HomeStatus, ClientError>>>,
    status_default: Mutex<Option<HomeStatus>>,
    set_state_error: Mutex<Option<ClientError>>,
    set_state_calls: Mutex<Vec<SetStateRequest>>,
    measure: Mutex<Option<Result<HomeMeasure, ClientError>>>,
    measure_calls: Mutex<Vec<MeasureRequest>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_homes(&self, homes: HomesData) {
        *self.homes.lock().unwrap() = Some(homes);
    }

    pub fn homes_calls(&self) -> usize {
        self.homes_calls.load(Ordering::SeqCst)
    }

    pub fn push_status(&self, status: Result<HomeStatus, ClientError>) {
        self.status_queue.lock().unwrap().push_back(status);
    }

    pub fn set_status(&self, status: HomeStatus) {
        *self.status_default.lock().unwrap() = Some(status);
    }

    pub fn fail_set_state(&self, err: ClientError) {
        *self.set_state_error.lock().unwrap() = Some(err);
    }

    pub fn set_state_calls(&self) -> Vec<SetStateRequest> {
        self.set_state_calls.lock().unwrap().clone()
    }

    pub fn set_measure(&self, measure: HomeMeasure) {
        *self.measure.lock().unwrap() = Some(Ok(measure));
    }

    pub fn fail_measure(&self, err: ClientError) {
        *self.measure.lock().unwrap() = Some(Err(err));
    }

    pub fn measure_calls(&self) -> Vec<MeasureRequest> {
        self.measure_calls.lock().unwrap().clone()
    }
}

impl HeatingApi for FakeApi {
    fn homes_data(&self) -> Result<HomesData, ClientError> {
        self.homes_calls.fetch_add(1, Ordering::SeqCst);
        self.homes.lock().unwrap().clone().ok_or_else(|| not_scripted("homesdata"))
    }

    fn home_status(&self, _home_id: &HomeId) -> Result<HomeStatus, ClientError> {
        if let Some(next) = self.status_queue.lock().unwrap().pop_front() {
            return next;
        }
        self.status_default
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| not_scripted("homestatus"))
    }

    fn set_state(&self, request: &SetStateRequest) -> Result<(), ClientError> {
        self.set_state_calls.lock().unwrap().push(request.clone());
        match self.set_state_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn home_measure(&self, request: &MeasureRequest) -> Result<HomeMeasure, ClientError> {
        self.measure_calls.lock().unwrap().push(request.clone());
        self.measure
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(not_scripted("gethomemeasure")))
    }
}

/// In-memory sink with the same "first write wins" rule as the database.
#[derive(Default)]
pub struct MemorySink {
    points: Mutex<BTreeMap<String, Vec<EnergyStatisticPoint>>>,
    fail_appends: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemorySink {
    pub fn points(&self, key: &StatisticKey) -> Vec<EnergyStatisticPoint> {
        self.points
            .lock()
            .unwrap()
            .get(&key.statistic_id())
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn snapshot(&self) -> BTreeMap<String, Vec<EnergyStatisticPoint>> {
        self.points.lock().unwrap().clone()
    }
}

impl Clone for MemorySink {
    fn clone(&self) -> Self {
        MemorySink {
            points: Mutex::new(self.snapshot()),
            fail_appends: AtomicBool::new(self.fail_appends.load(Ordering::SeqCst)),
            fail_reads: AtomicBool::new(self.fail_reads.load(Ordering::SeqCst)),
        }
    }
}

impl PartialEq for MemorySink {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink").field("points", &self.snapshot()).finish()
    }
}

impl StatisticsSink for MemorySink {
    fn last_point(&mut self, key: &StatisticKey) -> Result<Option<EnergyStatisticPoint>, SinkError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SinkError::Database("statement timeout".into()));
        }
        Ok(self.points(key).into_iter().max_by_key(|p| p.time))
    }

    fn append(&mut self, points: &[EnergyStatisticPoint]) -> Result<usize, SinkError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(SinkError::Database("connection refused".into()));
        }
        let mut stored = self.points.lock().unwrap();
        let mut inserted = 0;
        for p in points {
            let series = stored.entry(p.key.statistic_id()).or_default();
            if series.iter().any(|existing| existing.time == p.time) {
                continue;
            }
            series.push(p.clone());
            series.sort_by_key(|x| x.time);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn clear(&mut self) -> Result<usize, SinkError> {
        let prefix = format!("{}:", STATISTIC_PREFIX);
        let mut stored = self.points.lock().unwrap();
        let removed = stored
            .iter()
            .filter(|(id, _)| id.starts_with(&prefix))
            .map(|(_, series)| series.len())
            .sum();
        stored.retain(|id, _| !id.starts_with(&prefix));
        Ok(removed)
    }
}
