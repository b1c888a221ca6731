//! Resolves the one-time `homesdata` payload into the Home → Room → Module graph.
//!
//! The resolved [`Topology`] is immutable. A refetch produces a brand-new value that is
//! swapped into the shared cell as a whole.

use crate::models::intuis::{HomeConfig, HomeId, HomesData, ModuleConfig, ModuleId, RoomId};
use core::fmt;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

const HEATING_TAGS: [&str; 1] = ["NMH"];
const WATER_HEATER_TAGS: [&str; 4] = ["NMW", "NWH", "WH", "WATER_HEATER"];
const BRIDGE_TAGS: [&str; 5] = ["NMG", "NLG", "NLGS", "BRIDGE", "GATEWAY"];

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyError {
    /// The payload carried no home at all.
    NoHomes,
    /// An entity was missing a field the graph cannot do without.
    MissingField {
        entity: &'static str,
        field: &'static str,
        home_id: Option<HomeId>,
    },
    /// A module id appeared twice in one home; the first occurrence wins.
    DuplicateModule { home_id: HomeId, module_id: ModuleId },
    /// A water-heater module has no bridge-capable module to route through.
    NoBridge { home_id: HomeId, module_id: ModuleId },
}

impl Display for TopologyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::NoHomes => write!(f, "configuration payload contains no home"),
            TopologyError::MissingField { entity, field, home_id } => match home_id {
                Some(h) => write!(f, "{} in home {} is missing `{}`", entity, h.0, field),
                None => write!(f, "{} is missing `{}`", entity, field),
            },
            TopologyError::DuplicateModule { home_id, module_id } => {
                write!(f, "module {} listed more than once in home {}", module_id.0, home_id.0)
            }
            TopologyError::NoBridge { home_id, module_id } => write!(
                f,
                "module {} in home {} needs a bridge but none is resolvable",
                module_id.0, home_id.0
            ),
        }
    }
}

impl Error for TopologyError {}

/// Closed classification of the vendor's device-type tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleKind {
    Heating,
    WaterHeater,
    Bridge,
    Unsupported(String),
}

impl ModuleKind {
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim();
        if HEATING_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            ModuleKind::Heating
        } else if WATER_HEATER_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            ModuleKind::WaterHeater
        } else if BRIDGE_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            ModuleKind::Bridge
        } else {
            ModuleKind::Unsupported(tag.to_string())
        }
    }

    /// Modules of this kind can only be addressed through a bridge.
    pub fn requires_bridge(&self) -> bool {
        matches!(self, ModuleKind::WaterHeater)
    }
}

/// How commands reach a module. The bridge is a lookup, never an owner.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeLink {
    Direct,
    Routed(ModuleId),
    /// Present but uncontrollable.
    Unresolved(TopologyError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub id: ModuleId,
    pub name: Option<String>,
    pub tag: String,
    pub kind: ModuleKind,
    pub room_id: Option<RoomId>,
    /// Bridge id as reported by the upstream, before validation.
    pub declared_bridge: Option<ModuleId>,
    pub link: BridgeLink,
}

impl Module {
    pub fn is_controllable(&self) -> bool {
        !matches!(self.link, BridgeLink::Unresolved(_)) && !matches!(self.kind, ModuleKind::Unsupported(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub home_id: HomeId,
    pub name: Option<String>,
    pub room_type: Option<String>,
    pub declared_type: Option<String>,
    pub module_ids: Vec<ModuleId>,
    pub heating_module: Option<ModuleId>,
    pub water_heater_module: Option<ModuleId>,
}

impl Room {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Home {
    pub id: HomeId,
    pub name: Option<String>,
    pub rooms: BTreeMap<RoomId, Room>,
    pub modules: BTreeMap<ModuleId, Module>,
    /// Bridge-capable modules in payload order.
    pub bridges: Vec<ModuleId>,
}

impl Home {
    pub fn module(&self, id: &ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    /// Bridge used to address the room's measurements: the water heater's route,
    /// then the heating module's declared bridge, then the home's first bridge.
    pub fn measurement_bridge(&self, room: &Room) -> Option<ModuleId> {
        let routed = room
            .water_heater_module
            .as_ref()
            .and_then(|id| self.modules.get(id))
            .and_then(|m| match &m.link {
                BridgeLink::Routed(b) => Some(b.clone()),
                _ => None,
            });
        let declared = || {
            room.heating_module
                .as_ref()
                .and_then(|id| self.modules.get(id))
                .and_then(|m| m.declared_bridge.clone())
                .filter(|b| self.bridges.contains(b))
        };
        routed.or_else(declared).or_else(|| self.bridges.first().cloned())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub homes: BTreeMap<HomeId, Home>,
    /// Recoverable problems found while resolving.
    pub issues: Vec<TopologyError>,
}

impl Topology {
    pub fn home(&self, id: &HomeId) -> Option<&Home> {
        self.homes.get(id)
    }

    pub fn room(&self, home_id: &HomeId, room_id: &RoomId) -> Option<&Room> {
        self.homes.get(home_id).and_then(|h| h.rooms.get(room_id))
    }

    /// Finds a room by id, or by case-insensitive name when no id matches.
    pub fn find_room(&self, query: &str) -> Option<(&Home, &Room)> {
        let by_id = self.homes.values().find_map(|h| {
            h.rooms
                .values()
                .find(|r| r.id.0 == query)
                .map(|r| (h, r))
        });
        by_id.or_else(|| {
            self.homes.values().find_map(|h| {
                h.rooms
                    .values()
                    .find(|r| r.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(query)))
                    .map(|r| (h, r))
            })
        })
    }

    pub fn room_count(&self) -> usize {
        self.homes.values().map(|h| h.rooms.len()).sum()
    }

    pub fn module_count(&self) -> usize {
        self.homes.values().map(|h| h.modules.len()).sum()
    }
}

/// Builds the graph. Only a payload without any home is fatal; everything else
/// degrades the affected room or module and is recorded in `Topology::issues`.
pub fn resolve(data: &HomesData) -> Result<Topology, TopologyError> {
    let homes = data.homes.as_deref().unwrap_or(&[]);
    if homes.is_empty() {
        return Err(TopologyError::NoHomes);
    }

    let mut topology = Topology::default();
    for raw in homes {
        let Some(home_id) = raw.id.clone() else {
            warn!("Topology: skipping home without id (name=\"{}\")", raw.name.as_deref().unwrap_or("-"));
            topology.issues.push(TopologyError::MissingField {
                entity: "home",
                field: "id",
                home_id: None,
            });
            continue;
        };
        let home = resolve_home(home_id.clone(), raw, &mut topology.issues);
        if home.rooms.is_empty() || home.modules.is_empty() {
            info!(
                "Topology: home {} has {} room(s) and {} module(s); no controllable entities",
                home_id.0,
                home.rooms.len(),
                home.modules.len()
            );
        }
        topology.homes.insert(home_id, home);
    }

    if topology.homes.is_empty() {
        return Err(TopologyError::NoHomes);
    }

    info!(
        "Topology: resolved {} home(s), {} room(s), {} module(s), {} issue(s)",
        topology.homes.len(),
        topology.room_count(),
        topology.module_count(),
        topology.issues.len()
    );
    Ok(topology)
}

fn resolve_home(home_id: HomeId, raw: &HomeConfig, issues: &mut Vec<TopologyError>) -> Home {
    // Pass 1: modules, keeping payload order for deterministic tie-breaks.
    let mut order: Vec<ModuleId> = Vec::new();
    let mut modules: BTreeMap<ModuleId, Module> = BTreeMap::new();
    for m in raw.modules.as_deref().unwrap_or(&[]) {
        let Some(module) = classify_module(&home_id, m, issues) else {
            continue;
        };
        if modules.contains_key(&module.id) {
            warn!("Topology: home {} lists module {} twice; keeping the first", home_id.0, module.id.0);
            issues.push(TopologyError::DuplicateModule {
                home_id: home_id.clone(),
                module_id: module.id.clone(),
            });
            continue;
        }
        order.push(module.id.clone());
        modules.insert(module.id.clone(), module);
    }

    let bridges: Vec<ModuleId> = order
        .iter()
        .filter(|id| modules.get(*id).is_some_and(|m| m.kind == ModuleKind::Bridge))
        .cloned()
        .collect();

    // Pass 2: bridge links for modules that cannot be addressed directly.
    for id in &order {
        let Some(module) = modules.get_mut(id) else { continue };
        if !module.kind.requires_bridge() {
            continue;
        }
        module.link = match pick_bridge(module.declared_bridge.as_ref(), &bridges) {
            Some(bridge) => {
                if module.declared_bridge.as_ref() != Some(&bridge) {
                    warn!(
                        "Topology: module {} in home {} declared bridge {:?}; routing through {} instead",
                        module.id.0,
                        home_id.0,
                        module.declared_bridge.as_ref().map(|b| b.0.as_str()),
                        bridge.0
                    );
                }
                BridgeLink::Routed(bridge)
            }
            None => {
                let err = TopologyError::NoBridge {
                    home_id: home_id.clone(),
                    module_id: module.id.clone(),
                };
                warn!("Topology: {}; registering it as uncontrollable", err);
                issues.push(err.clone());
                BridgeLink::Unresolved(err)
            }
        };
    }

    // Pass 3: rooms and their active modules.
    let mut rooms: BTreeMap<RoomId, Room> = BTreeMap::new();
    for r in raw.rooms.as_deref().unwrap_or(&[]) {
        let Some(room_id) = r.id.clone() else {
            warn!("Topology: skipping room without id in home {}", home_id.0);
            issues.push(TopologyError::MissingField {
                entity: "room",
                field: "id",
                home_id: Some(home_id.clone()),
            });
            continue;
        };

        let mut member_ids: Vec<ModuleId> = Vec::new();
        for mid in r.module_ids.as_deref().unwrap_or(&[]) {
            if !member_ids.contains(mid) {
                member_ids.push(mid.clone());
            }
        }
        for mid in &order {
            let claims_room = modules.get(mid).is_some_and(|m| m.room_id.as_ref() == Some(&room_id));
            if claims_room && !member_ids.contains(mid) {
                member_ids.push(mid.clone());
            }
        }

        let mut room = Room {
            id: room_id.clone(),
            home_id: home_id.clone(),
            name: r.name.clone(),
            room_type: r.room_type.clone(),
            declared_type: r.muller_type.clone(),
            module_ids: Vec::new(),
            heating_module: None,
            water_heater_module: None,
        };

        for mid in member_ids {
            let Some(module) = modules.get_mut(&mid) else {
                debug!("Topology: room {} references unknown module {}", room_id.0, mid.0);
                continue;
            };
            let owned_elsewhere = module
                .room_id
                .clone()
                .filter(|owner| owner != &room_id && rooms.contains_key(owner));
            if let Some(owner) = owned_elsewhere {
                warn!(
                    "Topology: module {} already belongs to room {}; ignoring it for room {}",
                    mid.0, owner.0, room_id.0
                );
                continue;
            }
            module.room_id = Some(room_id.clone());
            room.module_ids.push(mid);
        }

        room.heating_module = pick_active(&room, &modules, &ModuleKind::Heating);
        room.water_heater_module = pick_active(&room, &modules, &ModuleKind::WaterHeater);
        debug!(
            "Topology: room {} ({}) heating={:?} water_heater={:?}",
            room.id.0,
            room.display_name(),
            room.heating_module.as_ref().map(|m| m.0.as_str()),
            room.water_heater_module.as_ref().map(|m| m.0.as_str())
        );
        rooms.insert(room_id, room);
    }

    Home {
        id: home_id,
        name: raw.name.clone(),
        rooms,
        modules,
        bridges,
    }
}

fn classify_module(home_id: &HomeId, m: &ModuleConfig, issues: &mut Vec<TopologyError>) -> Option<Module> {
    let Some(id) = m.id.clone() else {
        warn!("Topology: skipping module without id in home {}", home_id.0);
        issues.push(TopologyError::MissingField {
            entity: "module",
            field: "id",
            home_id: Some(home_id.clone()),
        });
        return None;
    };
    let tag = m.module_type.clone().unwrap_or_default();
    let kind = ModuleKind::from_tag(&tag);
    if let ModuleKind::Unsupported(t) = &kind {
        info!("Topology: module {} has unsupported type {:?}; no entity will be created", id.0, t);
    }
    Some(Module {
        id,
        name: m.name.clone(),
        tag,
        kind,
        room_id: m.room_id.clone(),
        declared_bridge: m.bridge.clone(),
        link: BridgeLink::Direct,
    })
}

fn pick_bridge(declared: Option<&ModuleId>, bridges: &[ModuleId]) -> Option<ModuleId> {
    match declared {
        Some(d) if bridges.contains(d) => Some(d.clone()),
        _ => bridges.first().cloned(),
    }
}

/// Prefers the candidate whose tag equals the room's declared type, else the first.
fn pick_active(room: &Room, modules: &BTreeMap<ModuleId, Module>, kind: &ModuleKind) -> Option<ModuleId> {
    let candidates: Vec<&Module> = room
        .module_ids
        .iter()
        .filter_map(|id| modules.get(id))
        .filter(|m| &m.kind == kind)
        .collect();

    let chosen = match candidates.as_slice() {
        [] => return None,
        [only] => *only,
        [first, ..] => {
            let exact = room
                .declared_type
                .as_deref()
                .and_then(|t| candidates.iter().find(|m| m.tag.eq_ignore_ascii_case(t)));
            let chosen = exact.copied().unwrap_or(*first);
            warn!(
                "Topology: room {} has {} {:?} modules ({}); using {}",
                room.id.0,
                candidates.len(),
                kind,
                candidates.iter().map(|m| m.id.0.as_str()).collect::<Vec<_>>().join(", "),
                chosen.id.0
            );
            chosen
        }
    };
    Some(chosen.id.clone())
}
