//! Wire models for the Muller Intuitiv cloud API.
//!
//! Scope: types only, no client code.
//!
//! Notes
//! - Nearly every field is optional; the upstream omits keys freely and the resolver
//!   decides what is required.
//! - Timestamps on the wire are unix seconds (`i64`); conversion to `chrono` happens in
//!   the services that consume them.

use serde::{Deserialize, Serialize};

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HomeId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub String);

// =====================
// Response envelope
// =====================

/// Every endpoint answers with this envelope; `error` replaces `body` when the
/// upstream refuses the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub body: Option<T>,
    #[serde(default)]
    pub error: Option<ApiError>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub time_server: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

// Error codes the upstream uses for credential problems on otherwise valid requests.
pub const ERROR_CODE_INVALID_TOKEN: i64 = 2;
pub const ERROR_CODE_TOKEN_EXPIRED: i64 = 3;

// =====================
// homesdata
// =====================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomesData {
    #[serde(default)]
    pub homes: Option<Vec<HomeConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeConfig {
    pub id: Option<HomeId>,
    pub name: Option<String>,
    #[serde(default)]
    pub rooms: Option<Vec<RoomConfig>>,
    #[serde(default)]
    pub modules: Option<Vec<ModuleConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfig {
    pub id: Option<RoomId>,
    pub name: Option<String>,
    /// Room category as shown in the vendor app (e.g. `livingroom`).
    #[serde(rename = "type")]
    pub room_type: Option<String>,
    /// Primary device type tag declared for the room (e.g. `NMH`).
    pub muller_type: Option<String>,
    #[serde(default)]
    pub module_ids: Option<Vec<ModuleId>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub id: Option<ModuleId>,
    #[serde(rename = "type")]
    pub module_type: Option<String>,
    pub name: Option<String>,
    pub room_id: Option<RoomId>,
    /// Bridge the module talks through, when the upstream reports one.
    pub bridge: Option<ModuleId>,
    #[serde(default)]
    pub modules_bridged: Option<Vec<ModuleId>>,
}

// =====================
// homestatus
// =====================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeStatusBody {
    pub home: Option<HomeStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeStatus {
    pub id: Option<HomeId>,
    #[serde(default)]
    pub rooms: Option<Vec<RoomStatusData>>,
    #[serde(default)]
    pub modules: Option<Vec<ModuleStatusData>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomStatusData {
    pub id: Option<RoomId>,
    pub reachable: Option<bool>,
    pub therm_measured_temperature: Option<f64>,
    pub therm_setpoint_temperature: Option<f64>,
    pub therm_setpoint_mode: Option<String>,
    pub open_window: Option<bool>,
    pub boost_status: Option<bool>,
    pub presence: Option<bool>,
    pub heating_power_request: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleStatusData {
    pub id: Option<ModuleId>,
    #[serde(rename = "type")]
    pub module_type: Option<String>,
    pub reachable: Option<bool>,
    pub boiler_status: Option<bool>,
    pub contactor_mode: Option<String>,
    pub bridge: Option<ModuleId>,
}

// =====================
// setstate
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub home: SetStateHome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStateHome {
    pub id: HomeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<SetStateRoom>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<SetStateModule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStateRoom {
    pub id: RoomId,
    pub therm_setpoint_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub therm_setpoint_temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStateModule {
    pub id: ModuleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<ModuleId>,
    pub contactor_mode: String,
}

// =====================
// gethomemeasure
// =====================

pub const MEASURE_SCALE_HOUR: &str = "1hour";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRequest {
    pub home: MeasureHome,
    pub scale: String,
    /// Inclusive window start, unix seconds.
    pub date_begin: i64,
    /// Exclusive window end, unix seconds.
    pub date_end: i64,
    pub real_time: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureHome {
    pub id: HomeId,
    pub rooms: Vec<MeasureRoom>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureRoom {
    pub id: RoomId,
    pub bridge: ModuleId,
    /// Comma separated measurement types; response columns follow this order.
    #[serde(rename = "type")]
    pub measure_types: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeMeasureBody {
    pub home: Option<HomeMeasure>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeMeasure {
    pub id: Option<HomeId>,
    #[serde(default)]
    pub rooms: Option<Vec<RoomMeasure>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomMeasure {
    pub id: Option<RoomId>,
    #[serde(default)]
    pub measures: Option<Vec<MeasureSeries>>,
}

/// A run of equally spaced buckets: row `i` starts at `beg_time + i * step_time`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasureSeries {
    pub beg_time: Option<i64>,
    pub step_time: Option<i64>,
    #[serde(default)]
    pub value: Vec<Vec<Option<f64>>>,
}
