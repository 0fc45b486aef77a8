use chrono::{DateTime, FixedOffset};
use serde_json::{json, Value};

use crate::{
    actuator::CommandTransport,
    arbiter::ControlArbiter,
    config::{is_entity_id, DeviceConfig},
};

/// Config keys that always name an entity or a sub-device.
const REDACTED_KEYS: &[&str] = &[
    "room_temp_sensor",
    "weather_entity",
    "outside_temp_sensor",
    "climate_entity",
    "remote_entity",
    "entity_id",
    "device",
];

/// Expression sources that may reference entities anywhere in their text. Only whether
/// one is set survives, as `<key>_set`.
const MASKED_KEYS: &[&str] = &["template", "run_if"];

/// Configuration with every entity reference removed, plus full state timestamps.
pub fn export<T: CommandTransport>(
    arbiter: &ControlArbiter<T>,
    now: DateTime<FixedOffset>,
) -> Value {
    let state = arbiter.state();
    let timestamp = |at: Option<DateTime<FixedOffset>>| {
        at.map_or(Value::Null, |at| Value::String(at.to_rfc3339()))
    };

    json!({
        "config": redacted_config(arbiter.config()),
        "state": {
            "virtualSystemOn": state.virtual_system_on,
            "physicalDeviceOn": state.physical_device_on,
            "deviceSetTemperature": state.device_set_temperature,
            "userTargetTemperature": state.user_target_temperature,
            "preset": state.preset,
            "roomTemperature": state.readings.room_temperature,
            "outsideTemperature": state.readings.outside_temperature,
            "estimatedPowerWatts": arbiter.estimated_power_watts(),
            "inMinimumCycle": arbiter.is_in_minimum_cycle(now),
            "canChangeState": arbiter.can_change_state(now),
            "cycleStartTime": timestamp(state.cycle_start_time),
            "lastCommandTime": timestamp(state.last_command_time),
            "lastTurnOnSource": state.last_turn_on_source.map(|source| source.as_str()),
            "lastTurnOnTime": timestamp(state.last_turn_on_time),
            "scheduleActive": state.schedule_active,
            "scheduleError": state.schedule_error,
            "scheduleNextStart": timestamp(state.schedule_next_start),
            "scheduleOverrideIds": state.schedule_attribute_overrides.keys().collect::<Vec<_>>(),
        },
        "actuator": arbiter.actuator_diagnostics(),
        "generatedAt": now.to_rfc3339(),
    })
}

pub fn redacted_config(config: &DeviceConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    redact(&mut value);
    value
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in MASKED_KEYS {
                if let Some(source) = map.remove(*key) {
                    map.insert(format!("{key}_set"), Value::Bool(!source.is_null()));
                }
            }
            let keys: Vec<String> = map
                .iter()
                .filter(|(key, value)| {
                    REDACTED_KEYS.contains(&key.as_str())
                        || value.as_str().is_some_and(contains_entity_id)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                map.remove(&key);
            }
            map.values_mut().for_each(redact);
        }
        Value::Array(items) => {
            items.retain(|item| !item.as_str().is_some_and(contains_entity_id));
            items.iter_mut().for_each(redact);
        }
        _ => {}
    }
}

/// True when any word of `text` is shaped like `domain.object_id`.
fn contains_entity_id(text: &str) -> bool {
    text.split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.'))
        .any(|word| word.starts_with(|c: char| c.is_ascii_lowercase()) && is_entity_id(word))
}
