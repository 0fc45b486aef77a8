use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Off,
    Heat,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "heat" | "on" => Some(Self::Heat),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Who last powered the physical device on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOnSource {
    Schedule,
    Thermostat,
    Manual,
    Fix,
}

impl TurnOnSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Thermostat => "thermostat",
            Self::Manual => "manual",
            Self::Fix => "fix",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
}

/// Outcome of a state store update. Observers publish a snapshot only on `Changed`.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeResult {
    Changed,
    #[default]
    Unchanged,
}

impl ChangeResult {
    pub fn is_changed(self) -> bool {
        matches!(self, Self::Changed)
    }
}

impl From<bool> for ChangeResult {
    fn from(changed: bool) -> Self {
        if changed {
            Self::Changed
        } else {
            Self::Unchanged
        }
    }
}

impl BitOr for ChangeResult {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        (self.is_changed() || rhs.is_changed()).into()
    }
}

impl BitOrAssign for ChangeResult {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

/// Aggregate published to presentation adapters after every refresh or state change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControllerSnapshot {
    #[serde(rename = "roomTemperature")]
    pub room_temperature: Option<f32>,
    #[serde(rename = "outsideTemperature")]
    pub outside_temperature: Option<f32>,
    #[serde(rename = "estimatedPowerWatts")]
    pub estimated_power_watts: f32,
    #[serde(rename = "virtualSystemOn")]
    pub virtual_system_on: bool,
    #[serde(rename = "physicalDeviceOn")]
    pub physical_device_on: bool,
    #[serde(rename = "deviceSetTemperature")]
    pub device_set_temperature: f32,
    #[serde(rename = "userTargetTemperature")]
    pub user_target_temperature: f32,
    pub preset: Option<String>,
    #[serde(rename = "hvacAction")]
    pub hvac_action: HvacAction,
    #[serde(rename = "inMinimumCycle")]
    pub in_minimum_cycle: bool,
    #[serde(rename = "canChangeState")]
    pub can_change_state: bool,
    #[serde(rename = "cycleStartEpoch")]
    pub cycle_start_epoch: Option<i64>,
    #[serde(rename = "lastCommandEpoch")]
    pub last_command_epoch: Option<i64>,
    #[serde(rename = "lastTurnOnSource")]
    pub last_turn_on_source: Option<TurnOnSource>,
    #[serde(rename = "lastTurnOnEpoch")]
    pub last_turn_on_epoch: Option<i64>,
    #[serde(rename = "scheduleActive")]
    pub schedule_active: bool,
    #[serde(rename = "scheduleNextStartEpoch")]
    pub schedule_next_start_epoch: Option<i64>,
    #[serde(rename = "scheduleAttributes")]
    pub schedule_attributes: ScheduleAttributes,
    #[serde(rename = "scheduleError")]
    pub schedule_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_results_combine() {
        let mut change = ChangeResult::Unchanged;
        change |= ChangeResult::Unchanged;
        assert!(!change.is_changed());
        change |= ChangeResult::Changed;
        assert!(change.is_changed());
        assert_eq!(ChangeResult::from(false), ChangeResult::Unchanged);
    }

    #[test]
    fn hvac_mode_parses_loosely() {
        assert_eq!(HvacMode::parse(" HEAT "), Some(HvacMode::Heat));
        assert_eq!(HvacMode::parse("off"), Some(HvacMode::Off));
        assert_eq!(HvacMode::parse("cool"), None);
    }
}
