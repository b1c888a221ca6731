//! Builds correctly addressed `setstate` envelopes and submits them.
//!
//! Heating modules are addressed directly by module id. Water-heater modules must carry
//! their bridge id; without one the command is refused before anything is sent.
//! Commands are never retried and never touch the cached status board.

use crate::client::{ClientError, HeatingApi};
use crate::models::intuis::{HomeId, ModuleId, RoomId, SetStateHome, SetStateModule, SetStateRequest, SetStateRoom};
use crate::models::modes::{HvacMode, WaterHeaterMode};
use crate::services::topology::{BridgeLink, Topology};
use core::fmt;
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const MIN_SETPOINT_C: f64 = 7.0;
pub const MAX_SETPOINT_C: f64 = 30.0;
/// Temperature the frost-protection mode holds.
pub const FROST_PROTECTION_C: f64 = 7.0;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ClimateTarget {
    Manual { temperature_c: f64 },
    Auto,
    FrostProtection,
    Off,
}

impl ClimateTarget {
    pub fn mode(&self) -> HvacMode {
        match self {
            ClimateTarget::Manual { .. } => HvacMode::Heat,
            ClimateTarget::Auto => HvacMode::Auto,
            ClimateTarget::FrostProtection => HvacMode::FrostProtection,
            ClimateTarget::Off => HvacMode::Off,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DesiredState {
    Climate(ClimateTarget),
    WaterHeater(WaterHeaterMode),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capability {
    Climate,
    WaterHeater,
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Climate => f.write_str("climate"),
            Capability::WaterHeater => f.write_str("water heater"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Addressing {
    Direct { module_id: ModuleId },
    Bridged { module_id: ModuleId, bridge_id: ModuleId },
}

/// A fully addressed command, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub home_id: HomeId,
    pub room_id: RoomId,
    pub addressing: Addressing,
    pub state: DesiredState,
}

impl CommandEnvelope {
    pub fn to_request(&self) -> SetStateRequest {
        let mut home = SetStateHome {
            id: self.home_id.clone(),
            rooms: Vec::new(),
            modules: Vec::new(),
        };
        match self.state {
            DesiredState::Climate(target) => {
                let temperature = match target {
                    ClimateTarget::Manual { temperature_c } => Some(temperature_c),
                    _ => None,
                };
                home.rooms.push(SetStateRoom {
                    id: self.room_id.clone(),
                    therm_setpoint_mode: target.mode().vendor_name().to_string(),
                    therm_setpoint_temperature: temperature,
                });
            }
            DesiredState::WaterHeater(mode) => {
                let (module_id, bridge) = match &self.addressing {
                    Addressing::Direct { module_id } => (module_id.clone(), None),
                    Addressing::Bridged { module_id, bridge_id } => (module_id.clone(), Some(bridge_id.clone())),
                };
                home.modules.push(SetStateModule {
                    id: module_id,
                    bridge,
                    contactor_mode: mode.vendor_name().to_string(),
                });
            }
        }
        SetStateRequest { home }
    }
}

/// Refused locally; nothing was sent.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingError {
    RoomNotFound {
        home_id: HomeId,
        room_id: RoomId,
    },
    NoModule {
        home_id: HomeId,
        room_id: RoomId,
        capability: Capability,
    },
    MissingBridge {
        home_id: HomeId,
        room_id: RoomId,
        module_id: ModuleId,
    },
    InvalidSetpoint(f64),
}

impl Display for RoutingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::RoomNotFound { home_id, room_id } => {
                write!(f, "room {} not found in home {}", room_id.0, home_id.0)
            }
            RoutingError::NoModule {
                home_id,
                room_id,
                capability,
            } => write!(f, "room {} in home {} has no {} module", room_id.0, home_id.0, capability),
            RoutingError::MissingBridge {
                home_id,
                room_id,
                module_id,
            } => write!(
                f,
                "module {} (room {}, home {}) needs a bridge but none is known",
                module_id.0, room_id.0, home_id.0
            ),
            RoutingError::InvalidSetpoint(t) => write!(f, "setpoint {} is not a number", t),
        }
    }
}

impl Error for RoutingError {}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    Routing(RoutingError),
    /// The upstream answered with an error envelope.
    UpstreamRejected { code: i64, message: String },
    Auth(String),
    Transport(String),
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Routing(e) => write!(f, "routing refused: {}", e),
            CommandError::UpstreamRejected { code, message } => {
                write!(f, "upstream rejected command ({}): {}", code, message)
            }
            CommandError::Auth(e) => write!(f, "auth error: {}", e),
            CommandError::Transport(e) => write!(f, "command not delivered: {}", e),
        }
    }
}

impl Error for CommandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommandError::Routing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RoutingError> for CommandError {
    fn from(value: RoutingError) -> Self {
        CommandError::Routing(value)
    }
}

impl From<ClientError> for CommandError {
    fn from(value: ClientError) -> Self {
        match value {
            ClientError::Api { code, message } => CommandError::UpstreamRejected { code, message },
            ClientError::Auth(e) => CommandError::Auth(e),
            other => CommandError::Transport(other.to_string()),
        }
    }
}

/// Clamps a requested setpoint into the supported range. NaN is refused.
pub fn clamp_setpoint(temperature_c: f64) -> Result<f64, RoutingError> {
    if temperature_c.is_nan() {
        return Err(RoutingError::InvalidSetpoint(temperature_c));
    }
    Ok(temperature_c.clamp(MIN_SETPOINT_C, MAX_SETPOINT_C))
}

/// Resolves the module and bridge a desired state must be sent to.
pub fn build_envelope(
    topology: &Topology,
    home_id: &HomeId,
    room_id: &RoomId,
    state: DesiredState,
) -> Result<CommandEnvelope, RoutingError> {
    let home = topology.home(home_id).ok_or_else(|| RoutingError::RoomNotFound {
        home_id: home_id.clone(),
        room_id: room_id.clone(),
    })?;
    let room = home.rooms.get(room_id).ok_or_else(|| RoutingError::RoomNotFound {
        home_id: home_id.clone(),
        room_id: room_id.clone(),
    })?;

    let no_module = |capability| RoutingError::NoModule {
        home_id: home_id.clone(),
        room_id: room_id.clone(),
        capability,
    };

    let (addressing, state) = match state {
        DesiredState::Climate(target) => {
            let module_id = room.heating_module.clone().ok_or_else(|| no_module(Capability::Climate))?;
            let target = match target {
                ClimateTarget::Manual { temperature_c } => ClimateTarget::Manual {
                    temperature_c: clamp_setpoint(temperature_c)?,
                },
                other => other,
            };
            (Addressing::Direct { module_id }, DesiredState::Climate(target))
        }
        DesiredState::WaterHeater(mode) => {
            let module = room
                .water_heater_module
                .as_ref()
                .and_then(|id| home.module(id))
                .ok_or_else(|| no_module(Capability::WaterHeater))?;
            let bridge_id = match &module.link {
                BridgeLink::Routed(bridge) => bridge.clone(),
                BridgeLink::Direct | BridgeLink::Unresolved(_) => {
                    return Err(RoutingError::MissingBridge {
                        home_id: home_id.clone(),
                        room_id: room_id.clone(),
                        module_id: module.id.clone(),
                    });
                }
            };
            (
                Addressing::Bridged {
                    module_id: module.id.clone(),
                    bridge_id,
                },
                DesiredState::WaterHeater(mode),
            )
        }
    };

    Ok(CommandEnvelope {
        home_id: home_id.clone(),
        room_id: room_id.clone(),
        addressing,
        state,
    })
}

/// Sends an envelope once. Failures are returned, never retried.
pub fn submit(api: &dyn HeatingApi, envelope: &CommandEnvelope) -> Result<(), CommandError> {
    let request = envelope.to_request();
    match api.set_state(&request) {
        Ok(()) => {
            info!(
                "Router: home {} room {} accepted {:?} via {:?}",
                envelope.home_id.0, envelope.room_id.0, envelope.state, envelope.addressing
            );
            Ok(())
        }
        Err(e) => {
            warn!(
                "Router: home {} room {} command {:?} failed: {}",
                envelope.home_id.0, envelope.room_id.0, envelope.state, e
            );
            Err(e.into())
        }
    }
}

/// Builds and submits in one step. Routing errors are raised before any network call.
pub fn route(
    api: &dyn HeatingApi,
    topology: &Topology,
    home_id: &HomeId,
    room_id: &RoomId,
    state: DesiredState,
) -> Result<CommandEnvelope, CommandError> {
    let envelope = build_envelope(topology, home_id, room_id, state).inspect_err(|e| {
        warn!("Router: refused locally: {}", e);
    })?;
    submit(api, &envelope)?;
    Ok(envelope)
}
