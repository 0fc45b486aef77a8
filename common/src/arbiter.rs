use chrono::{DateTime, Duration, FixedOffset};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::{
    actuator::{ActuatorDiagnostics, ActuatorGateway, CommandTransport, StepDirection},
    config::DeviceConfig,
    error::ConfigError,
    power,
    schedule::{describe, Schedule, ScheduleAttributes},
    sensor::{EntityState, SensorGateway, StateSource},
    state::{ControllerState, StateStore},
    types::{ChangeResult, ControllerSnapshot, HvacAction, HvacMode, TurnOnSource},
};

/// Minimum spacing between two actuator commands.
pub const COMMAND_INTERVAL_SECS: i64 = 5;

/// The reconciliation engine for one device. Owns the state store and both gateways;
/// every mutation goes through it so the cycle and rate-limit invariants hold.
pub struct ControlArbiter<T> {
    config: DeviceConfig,
    store: StateStore,
    actuator: ActuatorGateway<T>,
    sensors: SensorGateway,
    schedule: Option<Schedule>,
}

impl<T: CommandTransport> ControlArbiter<T> {
    pub fn new(mut config: DeviceConfig, transport: T) -> Result<Self, ConfigError> {
        config.sanitize();
        config.validate()?;

        let schedule = Schedule::from_device(&config)?;
        let sensors = SensorGateway::new(
            config.room_temp_sensor.clone(),
            config.weather_entity.clone(),
            config.outside_temp_sensor.clone(),
        );
        let actuator = ActuatorGateway::new(config.actuator.clone(), transport);
        let store = StateStore::new(
            config.control.initial_target_temp,
            config.control.initial_device_temp,
        );

        Ok(Self {
            config,
            store,
            actuator,
            sensors,
            schedule,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> &ControllerState {
        self.store.state()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn set_time_zone(&mut self, zone: Tz) {
        if let Some(schedule) = &mut self.schedule {
            schedule.set_time_zone(zone);
        }
    }

    pub fn transport(&self) -> &T {
        self.actuator.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.actuator.transport_mut()
    }

    pub fn actuator_diagnostics(&self) -> ActuatorDiagnostics {
        self.actuator.diagnostics()
    }

    pub fn take_publish_request(&mut self) -> bool {
        self.store.take_publish_request()
    }

    pub fn virtual_system_on(&self) -> bool {
        self.state().virtual_system_on
    }

    pub fn physical_device_on(&self) -> bool {
        self.state().physical_device_on
    }

    pub fn device_set_temperature(&self) -> f32 {
        self.state().device_set_temperature
    }

    pub fn user_target_temperature(&self) -> f32 {
        self.state().user_target_temperature
    }

    pub fn schedule_active(&self) -> bool {
        self.state().schedule_active
    }

    pub fn schedule_attributes(&self) -> &ScheduleAttributes {
        &self.state().schedule_attributes
    }

    pub fn last_turn_on_source(&self) -> Option<TurnOnSource> {
        self.state().last_turn_on_source
    }

    pub fn estimated_power_watts(&self) -> f32 {
        let state = self.state();
        power::estimate(
            state.physical_device_on,
            state.user_target_temperature,
            state.readings.room_temperature,
            state.readings.outside_temperature,
            self.config.power.min_power_watts,
            self.config.power.cop,
        )
    }

    pub fn is_in_minimum_cycle(&self, now: DateTime<FixedOffset>) -> bool {
        let Some(start) = self.state().cycle_start_time else {
            return false;
        };
        let min_cycle = Duration::seconds(self.config.control.min_cycle_secs as i64);
        now - start < min_cycle
    }

    pub fn can_change_state(&self, now: DateTime<FixedOffset>) -> bool {
        self.state()
            .last_command_time
            .map_or(true, |last| now - last >= Duration::seconds(COMMAND_INTERVAL_SECS))
    }

    /// One refresh cycle: read sensors, run the schedule pass, run the thermostat pass.
    pub fn tick(&mut self, now: DateTime<FixedOffset>, states: &dyn StateSource) -> ControllerSnapshot {
        let readings = self.sensors.read(states);
        let _ = self.store.set_readings(readings);

        self.schedule_pass(now, states);
        self.settle_pending_power_off(now);
        self.thermostat_pass(now, readings.room_temperature);

        self.snapshot(now)
    }

    pub fn snapshot(&self, now: DateTime<FixedOffset>) -> ControllerSnapshot {
        let state = self.state();
        let hvac_action = if !state.virtual_system_on && !state.physical_device_on {
            HvacAction::Off
        } else if state.physical_device_on {
            HvacAction::Heating
        } else {
            HvacAction::Idle
        };

        ControllerSnapshot {
            room_temperature: state.readings.room_temperature,
            outside_temperature: state.readings.outside_temperature,
            estimated_power_watts: self.estimated_power_watts(),
            virtual_system_on: state.virtual_system_on,
            physical_device_on: state.physical_device_on,
            device_set_temperature: state.device_set_temperature,
            user_target_temperature: state.user_target_temperature,
            preset: state.preset.clone(),
            hvac_action,
            in_minimum_cycle: self.is_in_minimum_cycle(now),
            can_change_state: self.can_change_state(now),
            cycle_start_epoch: state.cycle_start_time.map(|at| at.timestamp()),
            last_command_epoch: state.last_command_time.map(|at| at.timestamp()),
            last_turn_on_source: state.last_turn_on_source,
            last_turn_on_epoch: state.last_turn_on_time.map(|at| at.timestamp()),
            schedule_active: state.schedule_active,
            schedule_next_start_epoch: state.schedule_next_start.map(|at| at.timestamp()),
            schedule_attributes: state.schedule_attributes.clone(),
            schedule_error: state.schedule_error.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // User write paths

    pub fn set_user_target_temperature(&mut self, temp: f32) -> ChangeResult {
        if !temp.is_finite() {
            return ChangeResult::Unchanged;
        }
        let clamped = self.config.control.clamp_temp(temp);
        self.store.set_user_target_temperature(clamped)
    }

    /// Toggles the logical thermostat and cascades a power command to the device.
    /// A refused power-off is retried by later ticks once the automatic gates allow it.
    pub fn set_virtual_system_on(&mut self, on: bool, now: DateTime<FixedOffset>) -> ChangeResult {
        let mut change = self.store.set_virtual_system_on(on);
        self.store.set_schedule_power_on_pending(false);
        self.store.set_power_off_pending(false);
        if on && !self.physical_device_on() {
            change |= self.power_on_gated(TurnOnSource::Manual, now);
        } else if !on && self.physical_device_on() {
            let off = self.manual_power_off(now);
            if !off.is_changed() {
                debug!("system switched off; device power-off deferred");
                self.store.set_power_off_pending(true);
            }
            change |= off;
        }
        change
    }

    /// Direct override of the physical device, leaving the virtual system alone.
    pub fn set_physical_power_on(&mut self, on: bool, now: DateTime<FixedOffset>) -> ChangeResult {
        if on {
            self.store.set_power_off_pending(false);
        }
        match (on, self.physical_device_on()) {
            (true, false) => self.power_on_gated(TurnOnSource::Manual, now),
            (false, true) => self.manual_power_off(now),
            _ => ChangeResult::Unchanged,
        }
    }

    /// Moves the device set-point through stepped commands.
    pub fn set_device_set_temperature(
        &mut self,
        temp: f32,
        now: DateTime<FixedOffset>,
    ) -> ChangeResult {
        if !temp.is_finite() {
            return ChangeResult::Unchanged;
        }
        self.step_towards(temp, None, now)
    }

    /// Resynchronises bookkeeping with reality after the device was operated
    /// out-of-band. Sends nothing.
    pub fn fix_sync(
        &mut self,
        inferred_on: bool,
        inferred_target: Option<f32>,
        now: DateTime<FixedOffset>,
    ) -> ChangeResult {
        let mut change = self.store.set_physical_device_on(inferred_on, now);
        change |= self.store.set_virtual_system_on(inferred_on);
        self.store.set_power_off_pending(false);
        self.store.set_schedule_power_on_pending(false);
        if inferred_on && change.is_changed() {
            self.store.record_turn_on(TurnOnSource::Fix, now);
        }
        if let Some(target) = inferred_target.filter(|target| target.is_finite()) {
            let clamped = self.config.control.clamp_temp(target);
            change |= self.store.set_device_set_temperature(clamped);
        }
        info!(
            on = inferred_on,
            target = ?inferred_target,
            "state fixed from observed device"
        );
        change
    }

    /// The fix action: infer from the configured climate entity when possible,
    /// otherwise toggle the recorded power state.
    pub fn fix(&mut self, now: DateTime<FixedOffset>, states: &dyn StateSource) -> ChangeResult {
        let observed = self
            .config
            .climate_entity
            .as_deref()
            .and_then(|id| states.entity(id));

        match observed {
            Some(climate) => {
                let (on, target) = infer_fix_from_climate(&climate);
                self.fix_sync(on, target, now)
            }
            None => {
                let toggled = !self.physical_device_on();
                self.fix_sync(toggled, None, now)
            }
        }
    }

    pub fn set_schedule_attributes(
        &mut self,
        schedule_id: &str,
        attributes: ScheduleAttributes,
    ) -> ChangeResult {
        self.store.set_schedule_overrides(schedule_id, attributes)
    }

    pub fn schedule_overrides(&self, schedule_id: &str) -> ScheduleAttributes {
        self.store.schedule_overrides(schedule_id)
    }

    // ---------------------------------------------------------------------
    // Automatic passes

    fn schedule_pass(&mut self, now: DateTime<FixedOffset>, states: &dyn StateSource) {
        let Some(schedule) = &self.schedule else {
            return;
        };

        let result = schedule.evaluate(now, states);
        debug!(schedule = schedule.id(), result = %describe(&result), "schedule evaluated");
        let stored = self.store.schedule_overrides(schedule.id());
        let merged = ScheduleAttributes::merge(&stored, &result.attributes);
        let next_start = schedule.next_start(now);
        let starts_soon =
            schedule.starts_within(now, self.config.control.schedule_lookahead_minutes);

        let guard = match (&merged.run_if, result.active) {
            (Some(expr), true) => Some(schedule.check_guard(expr, now, states)),
            _ => None,
        };

        let _ = self.store.set_schedule_status(
            result.active,
            merged.clone(),
            result.error,
            next_start,
        );

        if !self.config.control.auto_control {
            return;
        }

        if !result.active {
            self.store.set_schedule_power_on_pending(false);
            self.schedule_end(now, starts_soon, &merged);
            return;
        }

        match guard {
            Some(Ok(false)) => {
                debug!("run_if guard vetoed the active schedule");
                return;
            }
            Some(Err(err)) => {
                warn!(%err, "run_if guard failed; skipping schedule");
                return;
            }
            Some(Ok(true)) | None => {}
        }

        self.apply_schedule(now, &merged);
    }

    fn apply_schedule(&mut self, now: DateTime<FixedOffset>, attributes: &ScheduleAttributes) {
        match attributes.hvac_mode {
            Some(HvacMode::Heat) => {
                if self.store.set_virtual_system_on(true).is_changed() {
                    self.store.set_power_off_pending(false);
                    let pending = !self.physical_device_on();
                    self.store.set_schedule_power_on_pending(pending);
                }
                // Retried on every tick until the rate gate lets it through.
                if self.state().schedule_power_on_pending
                    && (self.physical_device_on()
                        || self.power_on_gated(TurnOnSource::Schedule, now).is_changed())
                {
                    self.store.set_schedule_power_on_pending(false);
                }
            }
            Some(HvacMode::Off) => {
                let _ = self.store.set_virtual_system_on(false);
                self.store.set_schedule_power_on_pending(false);
                if self.physical_device_on() {
                    self.automatic_power_off(now, "schedule hvac_mode off");
                }
            }
            None => {}
        }

        if let Some(requested) = attributes.target_temp {
            let cap = self.config.control.schedule_step_cap;
            let _ = self.step_towards(requested, Some(cap), now);
        }

        if let Some(target) = attributes.target_temperature {
            let _ = self.set_user_target_temperature(target);
        }
        if let Some(preset) = &attributes.mode {
            let _ = self.store.set_preset(Some(preset.clone()));
        }
    }

    fn schedule_end(
        &mut self,
        now: DateTime<FixedOffset>,
        starts_soon: bool,
        attributes: &ScheduleAttributes,
    ) {
        if !self.physical_device_on()
            || self.last_turn_on_source() != Some(TurnOnSource::Schedule)
        {
            return;
        }
        if attributes.keeps_on() {
            debug!("schedule ended but keep_on is set");
            return;
        }
        if starts_soon {
            debug!("schedule ended but another window starts soon");
            return;
        }

        if self.automatic_power_off(now, "schedule ended") {
            let _ = self.store.set_virtual_system_on(false);
        }
    }

    fn settle_pending_power_off(&mut self, now: DateTime<FixedOffset>) {
        if !self.state().power_off_pending {
            return;
        }
        if self.virtual_system_on() || !self.physical_device_on() {
            self.store.set_power_off_pending(false);
            return;
        }
        if self.automatic_power_off(now, "system switched off") {
            self.store.set_power_off_pending(false);
        }
    }

    fn thermostat_pass(&mut self, now: DateTime<FixedOffset>, room: Option<f32>) {
        if !self.virtual_system_on() {
            return;
        }
        if self.is_in_minimum_cycle(now) {
            debug!("thermostat pass skipped: minimum cycle");
            return;
        }
        if !self.can_change_state(now) {
            debug!("thermostat pass skipped: rate limited");
            return;
        }
        let Some(room) = room else {
            return;
        };

        let target = self.user_target_temperature();
        let deficit = target - room;
        let cold_tolerance = self.config.control.cold_tolerance;
        let heat_tolerance = self.config.control.heat_tolerance;

        if deficit > cold_tolerance && !self.physical_device_on() {
            if self.power_on(TurnOnSource::Thermostat, now) {
                info!(room, target, "thermostat turned heat pump on");
            }
        } else if deficit < -heat_tolerance && self.physical_device_on() {
            if self.power_off(now) {
                info!(room, target, "thermostat turned heat pump off");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Command helpers

    fn power_on(&mut self, source: TurnOnSource, now: DateTime<FixedOffset>) -> bool {
        if !self.actuator.power_on() {
            return false;
        }
        self.store.record_command(now);
        let _ = self.store.set_physical_device_on(true, now);
        self.store.record_turn_on(source, now);
        true
    }

    fn power_off(&mut self, now: DateTime<FixedOffset>) -> bool {
        if !self.actuator.power_off() {
            return false;
        }
        self.store.record_command(now);
        let _ = self.store.set_physical_device_on(false, now);
        true
    }

    fn power_on_gated(&mut self, source: TurnOnSource, now: DateTime<FixedOffset>) -> ChangeResult {
        if !self.can_change_state(now) {
            debug!(source = source.as_str(), "power on refused: rate limited");
            return ChangeResult::Unchanged;
        }
        let changed = self.power_on(source, now);
        if changed {
            info!(source = source.as_str(), "heat pump turned on");
        }
        changed.into()
    }

    fn manual_power_off(&mut self, now: DateTime<FixedOffset>) -> ChangeResult {
        if !self.can_change_state(now) {
            debug!("power off refused: rate limited");
            return ChangeResult::Unchanged;
        }
        if self.config.control.manual_off_respects_min_cycle && self.is_in_minimum_cycle(now) {
            debug!("power off refused: minimum cycle");
            return ChangeResult::Unchanged;
        }
        self.power_off(now).into()
    }

    /// Honors both gates unconditionally.
    fn automatic_power_off(&mut self, now: DateTime<FixedOffset>, reason: &str) -> bool {
        if self.is_in_minimum_cycle(now) {
            debug!(reason, "power off deferred: minimum cycle");
            return false;
        }
        if !self.can_change_state(now) {
            debug!(reason, "power off deferred: rate limited");
            return false;
        }
        let done = self.power_off(now);
        if done {
            info!(reason, "heat pump turned off");
        }
        done
    }

    /// Sends `round(|delta|)` steps (optionally capped), stopping at the first failure.
    /// A complete run commits the requested value; a partial run commits the steps that
    /// went out; nothing sent commits nothing.
    fn step_towards(
        &mut self,
        requested: f32,
        cap: Option<u32>,
        now: DateTime<FixedOffset>,
    ) -> ChangeResult {
        let requested = self.config.control.clamp_temp(requested);
        let current = self.device_set_temperature();
        let delta = requested - current;
        if delta.abs() < 0.5 {
            return ChangeResult::Unchanged;
        }
        if !self.actuator.supports_stepping() {
            debug!(requested, "set-point change ignored: actuator has no step commands");
            return ChangeResult::Unchanged;
        }
        if !self.can_change_state(now) {
            debug!(requested, "set-point change refused: rate limited");
            return ChangeResult::Unchanged;
        }

        let direction = if delta > 0.0 {
            StepDirection::Up
        } else {
            StepDirection::Down
        };
        let wanted = delta.abs().round() as u32;
        let batch = cap.map_or(wanted, |cap| wanted.min(cap));

        let mut sent = 0;
        while sent < batch {
            if !self.actuator.send_step(direction) {
                break;
            }
            self.store.record_command(now);
            sent += 1;
        }

        if sent == 0 {
            return ChangeResult::Unchanged;
        }

        let committed = if sent == wanted {
            requested
        } else {
            current + direction.sign() * sent as f32
        };
        debug!(current, requested, committed, sent, "stepped device set-point");
        self.store.set_device_set_temperature(committed)
    }
}

/// Reads an external thermostat: on when it is not `off` and its target is above the
/// current temperature.
pub fn infer_fix_from_climate(climate: &EntityState) -> (bool, Option<f32>) {
    let target = climate.numeric_attribute("temperature");
    let current = climate.numeric_attribute("current_temperature");
    let calling_for_heat = match (target, current) {
        (Some(target), Some(current)) => target > current,
        _ => false,
    };
    (climate.state != "off" && calling_for_heat, target)
}
