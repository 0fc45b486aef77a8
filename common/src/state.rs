use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};

use crate::{
    schedule::ScheduleAttributes,
    sensor::SensorReadings,
    types::{ChangeResult, TurnOnSource},
};

/// Authoritative per-device record. Volatile: a restart begins from configured defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub virtual_system_on: bool,
    pub physical_device_on: bool,
    pub device_set_temperature: f32,
    pub user_target_temperature: f32,
    pub preset: Option<String>,
    pub readings: SensorReadings,
    pub cycle_start_time: Option<DateTime<FixedOffset>>,
    pub last_command_time: Option<DateTime<FixedOffset>>,
    pub last_turn_on_source: Option<TurnOnSource>,
    pub last_turn_on_time: Option<DateTime<FixedOffset>>,
    pub schedule_attribute_overrides: BTreeMap<String, ScheduleAttributes>,
    pub schedule_active: bool,
    pub schedule_attributes: ScheduleAttributes,
    pub schedule_error: Option<String>,
    pub schedule_next_start: Option<DateTime<FixedOffset>>,
    /// The system was switched off while the device could not be; the next ticks
    /// keep trying through the automatic gates.
    pub power_off_pending: bool,
    /// The active schedule switched the system on but has not started the device yet.
    pub schedule_power_on_pending: bool,
}

/// Owns [`ControllerState`] and funnels every mutation through setters that report
/// whether anything observable changed. A change raises a publish request the host
/// drains with [`StateStore::take_publish_request`].
#[derive(Debug, Clone)]
pub struct StateStore {
    state: ControllerState,
    publish_requested: bool,
}

impl StateStore {
    pub fn new(initial_target: f32, initial_device_temp: f32) -> Self {
        Self {
            state: ControllerState {
                virtual_system_on: false,
                physical_device_on: false,
                device_set_temperature: initial_device_temp,
                user_target_temperature: initial_target,
                preset: None,
                readings: SensorReadings::default(),
                cycle_start_time: None,
                last_command_time: None,
                last_turn_on_source: None,
                last_turn_on_time: None,
                schedule_attribute_overrides: BTreeMap::new(),
                schedule_active: false,
                schedule_attributes: ScheduleAttributes::default(),
                schedule_error: None,
                schedule_next_start: None,
                power_off_pending: false,
                schedule_power_on_pending: false,
            },
            // First refresh always publishes.
            publish_requested: true,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn take_publish_request(&mut self) -> bool {
        std::mem::take(&mut self.publish_requested)
    }

    fn mark(&mut self, changed: bool) -> ChangeResult {
        if changed {
            self.publish_requested = true;
        }
        changed.into()
    }

    pub fn set_virtual_system_on(&mut self, on: bool) -> ChangeResult {
        let changed = self.state.virtual_system_on != on;
        self.state.virtual_system_on = on;
        self.mark(changed)
    }

    /// Keeps the cycle timer in step with the power state.
    pub fn set_physical_device_on(
        &mut self,
        on: bool,
        now: DateTime<FixedOffset>,
    ) -> ChangeResult {
        if self.state.physical_device_on == on {
            return ChangeResult::Unchanged;
        }
        self.state.physical_device_on = on;
        self.state.cycle_start_time = on.then_some(now);
        self.mark(true)
    }

    pub fn record_turn_on(&mut self, source: TurnOnSource, now: DateTime<FixedOffset>) {
        self.state.last_turn_on_source = Some(source);
        self.state.last_turn_on_time = Some(now);
        self.publish_requested = true;
    }

    pub fn record_command(&mut self, now: DateTime<FixedOffset>) {
        self.state.last_command_time = Some(now);
        self.publish_requested = true;
    }

    pub fn set_power_off_pending(&mut self, pending: bool) {
        self.state.power_off_pending = pending;
    }

    pub fn set_schedule_power_on_pending(&mut self, pending: bool) {
        self.state.schedule_power_on_pending = pending;
    }

    pub fn set_device_set_temperature(&mut self, temp: f32) -> ChangeResult {
        let changed = (self.state.device_set_temperature - temp).abs() > f32::EPSILON;
        self.state.device_set_temperature = temp;
        self.mark(changed)
    }

    pub fn set_user_target_temperature(&mut self, temp: f32) -> ChangeResult {
        let changed = (self.state.user_target_temperature - temp).abs() > f32::EPSILON;
        self.state.user_target_temperature = temp;
        self.mark(changed)
    }

    pub fn set_preset(&mut self, preset: Option<String>) -> ChangeResult {
        let changed = self.state.preset != preset;
        self.state.preset = preset;
        self.mark(changed)
    }

    pub fn set_readings(&mut self, readings: SensorReadings) -> ChangeResult {
        let changed = self.state.readings != readings;
        self.state.readings = readings;
        self.mark(changed)
    }

    pub fn set_schedule_status(
        &mut self,
        active: bool,
        attributes: ScheduleAttributes,
        error: Option<String>,
        next_start: Option<DateTime<FixedOffset>>,
    ) -> ChangeResult {
        let state = &mut self.state;
        let changed = state.schedule_active != active
            || state.schedule_attributes != attributes
            || state.schedule_error != error
            || state.schedule_next_start != next_start;
        state.schedule_active = active;
        state.schedule_attributes = attributes;
        state.schedule_error = error;
        state.schedule_next_start = next_start;
        self.mark(changed)
    }

    pub fn set_schedule_overrides(
        &mut self,
        schedule_id: &str,
        attributes: ScheduleAttributes,
    ) -> ChangeResult {
        let previous = self
            .state
            .schedule_attribute_overrides
            .insert(schedule_id.to_string(), attributes.clone());
        self.mark(previous.as_ref() != Some(&attributes))
    }

    pub fn schedule_overrides(&self, schedule_id: &str) -> ScheduleAttributes {
        self.state
            .schedule_attribute_overrides
            .get(schedule_id)
            .cloned()
            .unwrap_or_default()
    }
}
