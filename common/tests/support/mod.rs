//! Shared fixtures for the integration tests: a recording transport, a fixed clock
//! and a minimal device wired to an infrared remote.

use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use heatpump_common::{
    ActuatorConfig, CommandTarget, CommandTransport, ControlArbiter, DeviceConfig, EntityState,
    TransportError,
};

#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<CommandTarget>,
    pub fail_after: Option<usize>,
}

#[allow(dead_code)]
impl RecordingTransport {
    /// Command names in send order; switch sends are reported as `switch:on`/`switch:off`.
    pub fn commands(&self) -> Vec<String> {
        self.sent
            .iter()
            .map(|target| match target {
                CommandTarget::Remote { command, .. } => command.clone(),
                CommandTarget::Switch { on: true, .. } => "switch:on".to_string(),
                CommandTarget::Switch { on: false, .. } => "switch:off".to_string(),
            })
            .collect()
    }
}

impl CommandTransport for RecordingTransport {
    fn send(&mut self, target: &CommandTarget) -> Result<(), TransportError> {
        if self.fail_after.is_some_and(|limit| self.sent.len() >= limit) {
            return Err(TransportError::Disconnected);
        }
        self.sent.push(target.clone());
        Ok(())
    }
}

/// Monday 2026-01-05 at the given wall-clock time, UTC+1.
pub fn monday(hour: u32, minute: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(3600)
        .unwrap()
        .with_ymd_and_hms(2026, 1, 5, hour, minute, 0)
        .unwrap()
}

#[allow(dead_code)]
pub fn plus_secs(at: DateTime<FixedOffset>, secs: i64) -> DateTime<FixedOffset> {
    at + Duration::seconds(secs)
}

#[allow(dead_code)]
pub fn plus_millis(at: DateTime<FixedOffset>, millis: i64) -> DateTime<FixedOffset> {
    at + Duration::milliseconds(millis)
}

pub fn device() -> DeviceConfig {
    DeviceConfig {
        room_temp_sensor: "sensor.living_room".to_string(),
        outside_temp_sensor: Some("sensor.outside".to_string()),
        actuator: ActuatorConfig::Infrared {
            remote_entity: "remote.living_room_ir".to_string(),
            device: Some("heat_pump".to_string()),
            power_on_command: "power_on".to_string(),
            power_off_command: "power_off".to_string(),
            temp_up_command: Some("temp_up".to_string()),
            temp_down_command: Some("temp_down".to_string()),
        },
        ..DeviceConfig::default()
    }
}

pub fn arbiter(config: DeviceConfig) -> ControlArbiter<RecordingTransport> {
    ControlArbiter::new(config, RecordingTransport::default()).unwrap()
}

pub fn readings(room: &str, outside: &str) -> HashMap<String, EntityState> {
    let mut states = HashMap::new();
    states.insert("sensor.living_room".to_string(), EntityState::new(room));
    states.insert("sensor.outside".to_string(), EntityState::new(outside));
    states
}
