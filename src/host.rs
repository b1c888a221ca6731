//! Host-facing surface: per-room climate and water-heater entities and energy feeds.
//!
//! Reads come from the shared topology and status board; writes go through the router.

use crate::client::HeatingApi;
use crate::models::intuis::{HomeId, RoomId};
use crate::models::modes::{HvacAction, HvacMode, WaterHeaterMode};
use crate::services::backfill::plan_home;
use crate::services::router::{self, ClimateTarget, CommandEnvelope, CommandError, DesiredState, MAX_SETPOINT_C, MIN_SETPOINT_C};
use crate::services::status::StatusBoard;
use crate::services::topology::Topology;
use crate::state::Shared;
use std::sync::Arc;

/// Setpoint used when switching to heat without any known target.
pub const DEFAULT_MANUAL_SETPOINT_C: f64 = 19.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ClimateView {
    pub home_id: HomeId,
    pub room_id: RoomId,
    pub name: String,
    pub current_temperature_c: Option<f64>,
    pub target_temperature_c: Option<f64>,
    pub mode: Option<HvacMode>,
    pub action: Option<HvacAction>,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    /// False until the first poll for the room, or while stale or removed.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaterHeaterView {
    pub home_id: HomeId,
    pub room_id: RoomId,
    pub name: String,
    pub mode: Option<WaterHeaterMode>,
    pub controllable: bool,
    pub available: bool,
}

pub struct Host {
    api: Arc<dyn HeatingApi>,
    topology: Arc<Shared<Topology>>,
    board: Arc<Shared<StatusBoard>>,
}

impl Host {
    pub fn new(api: Arc<dyn HeatingApi>, topology: Arc<Shared<Topology>>, board: Arc<Shared<StatusBoard>>) -> Self {
        Host { api, topology, board }
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load()
    }

    /// Looks a room up by id or name.
    pub fn resolve_room(&self, query: &str) -> Option<(HomeId, RoomId)> {
        let topo = self.topology.load();
        topo.find_room(query).map(|(h, r)| (h.id.clone(), r.id.clone()))
    }

    /// One entry per room that has a heating module.
    pub fn climates(&self) -> Vec<ClimateView> {
        let topo = self.topology.load();
        let board = self.board.load();
        let mut out = Vec::new();
        for home in topo.homes.values() {
            for room in home.rooms.values().filter(|r| r.heating_module.is_some()) {
                let status = board.room(&home.id, &room.id);
                let snapshot = status.map(|s| &s.snapshot);
                out.push(ClimateView {
                    home_id: home.id.clone(),
                    room_id: room.id.clone(),
                    name: room.display_name().to_string(),
                    current_temperature_c: snapshot.and_then(|s| s.current_temperature_c),
                    target_temperature_c: snapshot.and_then(|s| s.target_temperature_c),
                    mode: snapshot.and_then(|s| s.mode),
                    action: snapshot.map(|s| s.action),
                    min_temperature_c: MIN_SETPOINT_C,
                    max_temperature_c: MAX_SETPOINT_C,
                    available: status.is_some_and(|s| !s.stale && !s.removed),
                });
            }
        }
        out
    }

    pub fn climate(&self, home_id: &HomeId, room_id: &RoomId) -> Option<ClimateView> {
        self.climates()
            .into_iter()
            .find(|c| &c.home_id == home_id && &c.room_id == room_id)
    }

    /// One entry per room that has a water-heater module, controllable or not.
    pub fn water_heaters(&self) -> Vec<WaterHeaterView> {
        let topo = self.topology.load();
        let board = self.board.load();
        let mut out = Vec::new();
        for home in topo.homes.values() {
            for room in home.rooms.values() {
                let Some(module) = room.water_heater_module.as_ref().and_then(|id| home.module(id)) else {
                    continue;
                };
                let status = board.room(&home.id, &room.id);
                out.push(WaterHeaterView {
                    home_id: home.id.clone(),
                    room_id: room.id.clone(),
                    name: room.display_name().to_string(),
                    mode: status.and_then(|s| s.snapshot.water_heater_mode),
                    controllable: module.is_controllable(),
                    available: status.is_some_and(|s| !s.stale && !s.removed),
                });
            }
        }
        out
    }

    pub fn set_target_temperature(
        &self,
        home_id: &HomeId,
        room_id: &RoomId,
        temperature_c: f64,
    ) -> Result<CommandEnvelope, CommandError> {
        self.send(home_id, room_id, DesiredState::Climate(ClimateTarget::Manual { temperature_c }))
    }

    /// Heat re-applies the last known target, or the default setpoint.
    pub fn set_hvac_mode(&self, home_id: &HomeId, room_id: &RoomId, mode: HvacMode) -> Result<CommandEnvelope, CommandError> {
        let target = match mode {
            HvacMode::Heat => {
                let last = self
                    .board
                    .load()
                    .room(home_id, room_id)
                    .and_then(|s| s.snapshot.target_temperature_c);
                ClimateTarget::Manual {
                    temperature_c: last.unwrap_or(DEFAULT_MANUAL_SETPOINT_C),
                }
            }
            HvacMode::Auto => ClimateTarget::Auto,
            HvacMode::FrostProtection => ClimateTarget::FrostProtection,
            HvacMode::Off => ClimateTarget::Off,
        };
        self.send(home_id, room_id, DesiredState::Climate(target))
    }

    pub fn set_frost_protection(&self, home_id: &HomeId, room_id: &RoomId) -> Result<CommandEnvelope, CommandError> {
        self.send(home_id, room_id, DesiredState::Climate(ClimateTarget::FrostProtection))
    }

    pub fn set_water_heater_mode(
        &self,
        home_id: &HomeId,
        room_id: &RoomId,
        mode: WaterHeaterMode,
    ) -> Result<CommandEnvelope, CommandError> {
        self.send(home_id, room_id, DesiredState::WaterHeater(mode))
    }

    /// Statistic ids of every energy feed, e.g. `intuis:home-1_r-salon_heating`.
    pub fn energy_statistic_ids(&self) -> Vec<String> {
        let topo = self.topology.load();
        topo.homes
            .values()
            .flat_map(|home| plan_home(home).keys().map(|k| k.statistic_id()).collect::<Vec<_>>())
            .collect()
    }

    fn send(&self, home_id: &HomeId, room_id: &RoomId, state: DesiredState) -> Result<CommandEnvelope, CommandError> {
        let topo = self.topology.load();
        router::route(self.api.as_ref(), &topo, home_id, room_id, state)
    }
}
