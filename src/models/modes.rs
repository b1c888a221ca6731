//! Operating modes shared by the status poller, the command router and the host surface.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Climate mode as exposed to the host. Exactly one applies at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    /// Manual setpoint.
    Heat,
    /// Follows the schedule.
    Auto,
    /// Holds the frost-protection minimum.
    FrostProtection,
    Off,
}

impl HvacMode {
    /// Maps `therm_setpoint_mode`. Unknown values are `None`.
    pub fn from_vendor(mode: &str) -> Option<Self> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "manual" | "max" => Some(HvacMode::Heat),
            "home" | "auto" | "schedule" => Some(HvacMode::Auto),
            "hg" | "frost_guard" => Some(HvacMode::FrostProtection),
            "off" => Some(HvacMode::Off),
            _ => None,
        }
    }

    pub fn vendor_name(self) -> &'static str {
        match self {
            HvacMode::Heat => "manual",
            HvacMode::Auto => "home",
            HvacMode::FrostProtection => "hg",
            HvacMode::Off => "off",
        }
    }

    /// Parses the names accepted on the command line.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heat" | "manual" => Some(HvacMode::Heat),
            "auto" => Some(HvacMode::Auto),
            "frost" | "frost-protection" | "hg" => Some(HvacMode::FrostProtection),
            "off" => Some(HvacMode::Off),
            _ => None,
        }
    }
}

impl Display for HvacMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HvacMode::Heat => "heat",
            HvacMode::Auto => "auto",
            HvacMode::FrostProtection => "frost-protection",
            HvacMode::Off => "off",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterHeaterMode {
    Off,
    Auto,
    ForceOn,
}

impl WaterHeaterMode {
    /// Maps `contactor_mode`; anything unrecognised reads as off.
    pub fn from_vendor(mode: &str) -> Self {
        match mode.trim().to_ascii_lowercase().as_str() {
            "manual" | "on" | "forced" | "force" | "override" | "temporary_on" => WaterHeaterMode::ForceOn,
            "home" | "auto" | "schedule" => WaterHeaterMode::Auto,
            _ => WaterHeaterMode::Off,
        }
    }

    pub fn vendor_name(self) -> &'static str {
        match self {
            WaterHeaterMode::Off => "off",
            WaterHeaterMode::Auto => "auto",
            WaterHeaterMode::ForceOn => "temporary_on",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Some(WaterHeaterMode::Off),
            "auto" => Some(WaterHeaterMode::Auto),
            "force-on" | "force_on" | "on" => Some(WaterHeaterMode::ForceOn),
            _ => None,
        }
    }
}

impl Display for WaterHeaterMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WaterHeaterMode::Off => "off",
            WaterHeaterMode::Auto => "auto",
            WaterHeaterMode::ForceOn => "force-on",
        };
        f.write_str(s)
    }
}
