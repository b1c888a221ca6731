//! Fixed-cadence status polling.
//!
//! One `homestatus` call per home per cycle. The board is rebuilt from the previous one
//! and swapped in whole, so readers always see a complete cycle. Failed calls keep the
//! last snapshots; after `stale_after_failures` consecutive failures the home's rooms are
//! flagged stale, values untouched.

use crate::client::{ClientError, HeatingApi};
use crate::models::intuis::{HomeId, HomeStatus, ModuleId, ModuleStatusData, RoomId, RoomStatusData};
use crate::models::modes::{HvacAction, HvacMode, WaterHeaterMode};
use crate::services::topology::{self, Home, Topology};
use crate::state::{CycleOutcome, Shared};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub current_temperature_c: Option<f64>,
    pub target_temperature_c: Option<f64>,
    pub mode: Option<HvacMode>,
    pub action: HvacAction,
    /// Set when the boiler flag contradicts the temperatures.
    pub heating_mismatch: bool,
    pub boiler_on: Option<bool>,
    pub water_heater_mode: Option<WaterHeaterMode>,
    pub reachable: Option<bool>,
    pub open_window: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomStatus {
    pub snapshot: RoomSnapshot,
    pub stale: bool,
    /// The room disappeared from a well-formed payload.
    pub removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HomeHealth {
    pub consecutive_failures: u32,
    pub failing_since: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub alerted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusBoard {
    pub rooms: BTreeMap<(HomeId, RoomId), RoomStatus>,
    pub homes: BTreeMap<HomeId, HomeHealth>,
}

impl StatusBoard {
    pub fn room(&self, home_id: &HomeId, room_id: &RoomId) -> Option<&RoomStatus> {
        self.rooms.get(&(home_id.clone(), room_id.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub stale_after_failures: u32,
    /// Failures lasting this long are escalated from `warn!` to `error!`.
    pub stale_alert_after: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            stale_after_failures: DEFAULT_STALE_AFTER_FAILURES,
            stale_alert_after: Duration::from_secs(900),
        }
    }
}

/// Derives the HVAC action and whether the boiler flag disagrees with the temperatures.
///
/// A boiler reported idle while the room is below target yields `Idle` plus a mismatch,
/// never a guessed `Heating`. Without any boiler flag the temperatures decide.
pub fn derive_action(
    mode: Option<HvacMode>,
    current_c: Option<f64>,
    target_c: Option<f64>,
    boiler_on: Option<bool>,
) -> (HvacAction, bool) {
    if matches!(mode, Some(HvacMode::Off) | Some(HvacMode::FrostProtection)) {
        return (HvacAction::Off, false);
    }
    let (Some(current), Some(target)) = (current_c, target_c) else {
        return (HvacAction::Idle, false);
    };
    if current < target {
        match boiler_on {
            Some(true) | None => (HvacAction::Heating, false),
            Some(false) => (HvacAction::Idle, true),
        }
    } else {
        (HvacAction::Idle, boiler_on == Some(true))
    }
}

pub struct StatusPoller {
    api: Arc<dyn HeatingApi>,
    topology: Arc<Shared<Topology>>,
    board: Arc<Shared<StatusBoard>>,
    settings: PollSettings,
    refresh_requested: bool,
    /// Reported rooms missing from the graph that already triggered one refresh.
    unknown_rooms: BTreeSet<(HomeId, RoomId)>,
}

impl StatusPoller {
    pub fn new(
        api: Arc<dyn HeatingApi>,
        topology: Arc<Shared<Topology>>,
        board: Arc<Shared<StatusBoard>>,
        settings: PollSettings,
    ) -> Self {
        StatusPoller {
            api,
            topology,
            board,
            settings,
            refresh_requested: false,
            unknown_rooms: BTreeSet::new(),
        }
    }

    pub fn refresh_requested(&self) -> bool {
        self.refresh_requested
    }

    /// One polling cycle. Only an authentication failure is fatal.
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome, String> {
        if self.refresh_requested {
            if let Some(fatal) = self.refresh_topology() {
                return Ok(fatal);
            }
        }

        let topo = self.topology.load();
        let mut board = (*self.board.load()).clone();
        board
            .rooms
            .retain(|(home_id, room_id), _| topo.room(home_id, room_id).is_some());

        let mut failed = 0usize;
        for home in topo.homes.values() {
            let result = self.api.home_status(&home.id).and_then(|status| {
                if status.rooms.is_none() && !home.rooms.is_empty() {
                    Err(ClientError::MissingBody("homestatus.rooms"))
                } else {
                    Ok(status)
                }
            });
            match result {
                Ok(status) => {
                    if apply_status(home, &status, &mut board, &mut self.unknown_rooms, now) {
                        self.refresh_requested = true;
                    }
                    let health = board.homes.entry(home.id.clone()).or_default();
                    if health.consecutive_failures > 0 {
                        info!(
                            "Status: home {} recovered after {} failed poll(s)",
                            home.id.0, health.consecutive_failures
                        );
                    }
                    *health = HomeHealth {
                        last_success: Some(now),
                        ..HomeHealth::default()
                    };
                }
                Err(ClientError::Auth(e)) => {
                    return Ok(CycleOutcome::Fatal(format!("status poll for home {}: {}", home.id.0, e)));
                }
                Err(e) => {
                    failed += 1;
                    self.record_failure(home, &mut board, now, &e);
                }
            }
        }

        self.board.replace(board);
        if failed > 0 {
            return Err(format!("{} of {} home status call(s) failed", failed, topo.homes.len()));
        }
        Ok(CycleOutcome::Continue)
    }

    fn record_failure(&self, home: &Home, board: &mut StatusBoard, now: DateTime<Utc>, err: &ClientError) {
        let health = board.homes.entry(home.id.clone()).or_default();
        health.consecutive_failures += 1;
        let since = *health.failing_since.get_or_insert(now);
        let failures = health.consecutive_failures;

        let alert_after = TimeDelta::from_std(self.settings.stale_alert_after).unwrap_or(TimeDelta::MAX);
        if now - since >= alert_after && !health.alerted {
            health.alerted = true;
            error!(
                "Status: home {} has been failing since {} ({} consecutive failures): {}",
                home.id.0,
                since.to_rfc3339(),
                failures,
                err
            );
        } else {
            warn!(
                "Status: poll for home {} failed ({} consecutive): {}",
                home.id.0, failures, err
            );
        }

        if failures > self.settings.stale_after_failures {
            let mut marked = 0usize;
            for ((home_id, _), room) in board.rooms.iter_mut() {
                if home_id == &home.id && !room.stale {
                    room.stale = true;
                    marked += 1;
                }
            }
            if marked > 0 {
                warn!("Status: marked {} room(s) of home {} stale", marked, home.id.0);
            }
        }
    }

    /// Refetches and re-resolves the configuration. Returns a fatal outcome on auth errors.
    fn refresh_topology(&mut self) -> Option<CycleOutcome> {
        info!("Topology: refreshing after a room change was detected");
        let data = match self.api.homes_data() {
            Ok(d) => d,
            Err(ClientError::Auth(e)) => return Some(CycleOutcome::Fatal(format!("homesdata: {}", e))),
            Err(e) => {
                warn!("Topology: refresh failed, keeping the current graph: {}", e);
                return None;
            }
        };
        match topology::resolve(&data) {
            Ok(resolved) => {
                let version = self.topology.replace(resolved);
                info!("Topology: replaced graph (version {})", version);
                self.refresh_requested = false;
            }
            Err(e) => warn!("Topology: refreshed payload rejected, keeping the current graph: {}", e),
        }
        None
    }
}

/// Replaces the snapshots of one home. Returns true when the room set changed: a known
/// room disappeared or a room outside the graph showed up for the first time.
fn apply_status(
    home: &Home,
    status: &HomeStatus,
    board: &mut StatusBoard,
    unknown_rooms: &mut BTreeSet<(HomeId, RoomId)>,
    now: DateTime<Utc>,
) -> bool {
    let modules: BTreeMap<&ModuleId, &ModuleStatusData> = status
        .modules
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter_map(|m| m.id.as_ref().map(|id| (id, m)))
        .collect();

    let mut seen: Vec<&RoomId> = Vec::new();
    let mut changed = false;
    for data in status.rooms.as_deref().unwrap_or(&[]) {
        let Some(room_id) = data.id.as_ref() else { continue };
        let Some(room) = home.rooms.get(room_id) else {
            if unknown_rooms.insert((home.id.clone(), room_id.clone())) {
                info!("Status: home {} reports unknown room {}", home.id.0, room_id.0);
                changed = true;
            }
            continue;
        };
        seen.push(room_id);

        let heating = room.heating_module.as_ref().and_then(|id| modules.get(id));
        let water_heater = room.water_heater_module.as_ref().and_then(|id| modules.get(id));
        let snapshot = build_snapshot(data, heating.copied(), water_heater.copied(), now);
        if snapshot.heating_mismatch {
            debug!(
                "Status: room {} below/above target disagrees with boiler flag {:?}",
                room_id.0, snapshot.boiler_on
            );
        }
        board.rooms.insert(
            (home.id.clone(), room_id.clone()),
            RoomStatus {
                snapshot,
                stale: false,
                removed: false,
            },
        );
    }

    for room_id in home.rooms.keys().filter(|id| !seen.contains(id)) {
        // Rooms never reported have no entry and stay unavailable without a refetch.
        let Some(existing) = board.rooms.get_mut(&(home.id.clone(), room_id.clone())) else {
            continue;
        };
        if !existing.removed {
            warn!(
                "Status: room {} vanished from home {}; marking removed",
                room_id.0, home.id.0
            );
            existing.removed = true;
            changed = true;
        }
    }
    changed
}

fn build_snapshot(
    data: &RoomStatusData,
    heating: Option<&ModuleStatusData>,
    water_heater: Option<&ModuleStatusData>,
    now: DateTime<Utc>,
) -> RoomSnapshot {
    let mode = data.therm_setpoint_mode.as_deref().and_then(HvacMode::from_vendor);
    let boiler_on = heating
        .and_then(|m| m.boiler_status)
        .or_else(|| data.heating_power_request.map(|p| p > 0));
    let (action, heating_mismatch) = derive_action(
        mode,
        data.therm_measured_temperature,
        data.therm_setpoint_temperature,
        boiler_on,
    );
    RoomSnapshot {
        current_temperature_c: data.therm_measured_temperature,
        target_temperature_c: data.therm_setpoint_temperature,
        mode,
        action,
        heating_mismatch,
        boiler_on,
        water_heater_mode: water_heater
            .and_then(|m| m.contactor_mode.as_deref())
            .map(WaterHeaterMode::from_vendor),
        reachable: data.reachable,
        open_window: data.open_window,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::intuis::HomesData;
    use crate::testing::{fixture_homes, fixture_status, fixture_topology, FakeApi};
    use chrono::TimeZone;

    fn hid(s: &str) -> HomeId {
        HomeId(s.into())
    }

    fn rid(s: &str) -> RoomId {
        RoomId(s.into())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap()
    }

    /// Topology limited to home-1 so every home in the graph has a scripted answer.
    fn single_home_topology() -> Topology {
        let mut topo = fixture_topology();
        topo.homes.retain(|id, _| id.0 == "home-1");
        topo
    }

    fn poller(api: Arc<FakeApi>, settings: PollSettings) -> (StatusPoller, Arc<Shared<StatusBoard>>) {
        let board = Arc::new(Shared::new(StatusBoard::default()));
        let topology = Arc::new(Shared::new(single_home_topology()));
        let poller = StatusPoller::new(api, topology, Arc::clone(&board), settings);
        (poller, board)
    }

    #[test]
    fn derives_action_from_temperatures_and_boiler_flag() {
        let heat = Some(HvacMode::Heat);
        assert_eq!(derive_action(heat, Some(19.0), Some(20.5), Some(true)), (HvacAction::Heating, false));
        assert_eq!(derive_action(heat, Some(19.0), Some(20.5), Some(false)), (HvacAction::Idle, true));
        assert_eq!(derive_action(heat, Some(19.0), Some(20.5), None), (HvacAction::Heating, false));
        assert_eq!(derive_action(heat, Some(21.0), Some(20.0), Some(true)), (HvacAction::Idle, true));
        assert_eq!(derive_action(heat, None, Some(20.0), Some(true)), (HvacAction::Idle, false));
        assert_eq!(
            derive_action(Some(HvacMode::Off), Some(15.0), Some(20.0), Some(true)),
            (HvacAction::Off, false)
        );
        assert_eq!(
            derive_action(Some(HvacMode::FrostProtection), Some(5.0), Some(7.0), Some(true)),
            (HvacAction::Off, false)
        );
    }

    #[test]
    fn successful_poll_replaces_snapshots() {
        let api = Arc::new(FakeApi::new());
        api.set_status(fixture_status());
        let (mut poller, board) = poller(Arc::clone(&api), PollSettings::default());

        assert_eq!(poller.poll_once(t0()), Ok(CycleOutcome::Continue));
        let board = board.load();

        let salon = board.room(&hid("home-1"), &rid("r-salon")).expect("salon");
        assert_eq!(salon.snapshot.mode, Some(HvacMode::Heat));
        assert_eq!(salon.snapshot.action, HvacAction::Heating);
        assert!(!salon.stale);

        let cuisine = board.room(&hid("home-1"), &rid("r-cuisine")).expect("cuisine");
        assert_eq!(cuisine.snapshot.action, HvacAction::Idle);
        assert!(cuisine.snapshot.heating_mismatch);

        let buanderie = board.room(&hid("home-1"), &rid("r-buanderie")).expect("buanderie");
        assert_eq!(buanderie.snapshot.action, HvacAction::Off);
        assert_eq!(buanderie.snapshot.water_heater_mode, Some(WaterHeaterMode::ForceOn));

        let sdb = board.room(&hid("home-1"), &rid("r-sdb")).expect("sdb");
        assert_eq!(sdb.snapshot.water_heater_mode, Some(WaterHeaterMode::Auto));
        assert!(!poller.refresh_requested());
    }

    #[test]
    fn fourth_consecutive_failure_marks_stale_without_deleting_values() {
        let api = Arc::new(FakeApi::new());
        api.push_status(Ok(fixture_status()));
        for _ in 0..4 {
            api.push_status(Err(ClientError::Transport("connection reset".into())));
        }
        let (mut poller, board) = poller(Arc::clone(&api), PollSettings::default());

        poller.poll_once(t0()).expect("first poll succeeds");
        let before = board.load().room(&hid("home-1"), &rid("r-salon")).cloned().expect("salon");

        for i in 1..=3 {
            assert!(poller.poll_once(t0() + TimeDelta::seconds(30 * i)).is_err());
            let salon = board.load().room(&hid("home-1"), &rid("r-salon")).cloned().expect("retained");
            assert!(!salon.stale, "stale too early after {} failure(s)", i);
            assert_eq!(salon.snapshot, before.snapshot);
        }

        assert!(poller.poll_once(t0() + TimeDelta::seconds(120)).is_err());
        let board = board.load();
        let salon = board.room(&hid("home-1"), &rid("r-salon")).expect("retained");
        assert!(salon.stale);
        assert_eq!(salon.snapshot, before.snapshot);
        assert_eq!(board.homes.get(&hid("home-1")).map(|h| h.consecutive_failures), Some(4));
    }

    #[test]
    fn long_outage_is_escalated_once() {
        let api = Arc::new(FakeApi::new());
        for _ in 0..3 {
            api.push_status(Err(ClientError::Http {
                status: 503,
                excerpt: "maintenance".into(),
            }));
        }
        let settings = PollSettings {
            stale_after_failures: 3,
            stale_alert_after: Duration::from_secs(60),
        };
        let (mut poller, board) = poller(Arc::clone(&api), settings);

        let _ = poller.poll_once(t0());
        assert!(!board.load().homes[&hid("home-1")].alerted);
        let _ = poller.poll_once(t0() + TimeDelta::seconds(90));
        assert!(board.load().homes[&hid("home-1")].alerted);
        let _ = poller.poll_once(t0() + TimeDelta::seconds(120));
        assert_eq!(board.load().homes[&hid("home-1")].failing_since, Some(t0()));
    }

    #[test]
    fn vanished_room_is_marked_removed_and_refresh_requested() {
        let api = Arc::new(FakeApi::new());
        api.push_status(Ok(fixture_status()));
        let mut without_chambre = fixture_status();
        if let Some(rooms) = without_chambre.rooms.as_mut() {
            rooms.retain(|r| r.id.as_ref().map(|id| id.0.as_str()) != Some("r-chambre"));
        }
        api.push_status(Ok(without_chambre.clone()));
        api.set_status(without_chambre);
        let mut homes = fixture_homes();
        if let Some(all) = homes.homes.as_mut() {
            all.truncate(1);
        }
        if let Some(home) = homes.homes.as_mut().and_then(|h| h.first_mut()) {
            if let Some(rooms) = home.rooms.as_mut() {
                rooms.retain(|r| r.id.as_ref().map(|id| id.0.as_str()) != Some("r-chambre"));
            }
        }
        api.set_homes(homes);
        let (mut poller, board) = poller(Arc::clone(&api), PollSettings::default());

        poller.poll_once(t0()).expect("first poll");
        poller.poll_once(t0() + TimeDelta::seconds(30)).expect("second poll");
        let chambre = board.load().room(&hid("home-1"), &rid("r-chambre")).cloned().expect("kept");
        assert!(chambre.removed);
        assert_eq!(chambre.snapshot.current_temperature_c, Some(17.5));
        assert!(poller.refresh_requested());
        assert_eq!(api.homes_calls(), 0);

        // next cycle refetches the configuration and drops the room
        poller.poll_once(t0() + TimeDelta::seconds(60)).expect("third poll");
        assert_eq!(api.homes_calls(), 1);
        assert!(!poller.refresh_requested());
        assert!(board.load().room(&hid("home-1"), &rid("r-chambre")).is_none());
    }

    fn home_1_only() -> HomesData {
        let mut homes = fixture_homes();
        if let Some(all) = homes.homes.as_mut() {
            all.truncate(1);
        }
        homes
    }

    #[test]
    fn never_reported_room_does_not_trigger_refetches() {
        let api = Arc::new(FakeApi::new());
        let mut without_garage = fixture_status();
        if let Some(rooms) = without_garage.rooms.as_mut() {
            rooms.retain(|r| r.id.as_ref().map(|id| id.0.as_str()) != Some("r-garage"));
        }
        api.set_status(without_garage);
        api.set_homes(home_1_only());
        let (mut poller, board) = poller(Arc::clone(&api), PollSettings::default());

        for i in 0..6 {
            poller.poll_once(t0() + TimeDelta::seconds(30 * i)).expect("poll");
        }
        assert_eq!(api.homes_calls(), 0);
        assert!(!poller.refresh_requested());
        assert!(board.load().room(&hid("home-1"), &rid("r-garage")).is_none());
        assert!(board.load().room(&hid("home-1"), &rid("r-salon")).is_some());
    }

    #[test]
    fn unknown_room_triggers_a_single_refetch() {
        let api = Arc::new(FakeApi::new());
        let mut with_attic = fixture_status();
        if let Some(rooms) = with_attic.rooms.as_mut() {
            let mut attic = rooms[0].clone();
            attic.id = Some(rid("r-grenier"));
            rooms.push(attic);
        }
        api.set_status(with_attic);
        api.set_homes(home_1_only());
        let (mut poller, board) = poller(Arc::clone(&api), PollSettings::default());

        poller.poll_once(t0()).expect("first poll");
        assert!(poller.refresh_requested());
        for i in 1..6 {
            poller.poll_once(t0() + TimeDelta::seconds(30 * i)).expect("poll");
        }
        // the refetched graph still lacks the room; it is not asked for again
        assert_eq!(api.homes_calls(), 1);
        assert!(!poller.refresh_requested());
        assert!(board.load().room(&hid("home-1"), &rid("r-grenier")).is_none());
    }

    #[test]
    fn auth_failure_is_fatal() {
        let api = Arc::new(FakeApi::new());
        api.push_status(Err(ClientError::Auth("invalid_grant".into())));
        let (mut poller, _) = poller(Arc::clone(&api), PollSettings::default());
        assert!(matches!(poller.poll_once(t0()), Ok(CycleOutcome::Fatal(_))));
    }
}
