use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::ConfigError,
    schedule::{RuleEntry, ScheduleAttributes},
    template::Template,
};

pub const DEFAULT_SCHEDULE_ID: &str = "schedule";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ActuatorConfig {
    /// Direct on/off toggling of a binary actuator.
    Switch { entity_id: String },
    /// Named commands sent to a remote-control entity.
    Infrared {
        remote_entity: String,
        #[serde(default)]
        device: Option<String>,
        power_on_command: String,
        power_off_command: String,
        #[serde(default)]
        temp_up_command: Option<String>,
        #[serde(default)]
        temp_down_command: Option<String>,
    },
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self::Infrared {
            remote_entity: String::new(),
            device: None,
            power_on_command: String::new(),
            power_off_command: String::new(),
            temp_up_command: None,
            temp_down_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub min_cycle_secs: u64,
    pub cold_tolerance: f32,
    pub heat_tolerance: f32,
    pub min_temp: f32,
    pub max_temp: f32,
    pub initial_target_temp: f32,
    pub initial_device_temp: f32,
    pub auto_control: bool,
    pub manual_off_respects_min_cycle: bool,
    pub schedule_step_cap: u32,
    pub schedule_lookahead_minutes: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            min_cycle_secs: 300,
            cold_tolerance: 0.5,
            heat_tolerance: 0.5,
            min_temp: 10.0,
            max_temp: 30.0,
            initial_target_temp: 20.0,
            initial_device_temp: 20.0,
            auto_control: true,
            manual_off_respects_min_cycle: false,
            schedule_step_cap: 3,
            schedule_lookahead_minutes: 30,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.min_cycle_secs = self.min_cycle_secs.min(3_600);
        self.cold_tolerance = self.cold_tolerance.clamp(0.1, 5.0);
        self.heat_tolerance = self.heat_tolerance.clamp(0.1, 5.0);
        self.schedule_step_cap = self.schedule_step_cap.clamp(1, 10);
        self.schedule_lookahead_minutes = self.schedule_lookahead_minutes.min(240);

        if self.min_temp < self.max_temp {
            self.initial_target_temp = self.clamp_temp(self.initial_target_temp);
            self.initial_device_temp = self.clamp_temp(self.initial_device_temp);
        }
    }

    pub fn clamp_temp(&self, temp: f32) -> f32 {
        temp.clamp(self.min_temp, self.max_temp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub min_power_watts: f32,
    pub cop: f32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            min_power_watts: 1_200.0,
            cop: 3.0,
        }
    }
}

impl PowerConfig {
    pub fn sanitize(&mut self) {
        self.min_power_watts = self.min_power_watts.clamp(0.0, 20_000.0);
        self.cop = self.cop.clamp(0.5, 10.0);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Rules {
        #[serde(default = "default_schedule_id")]
        id: String,
        entries: Vec<RuleEntry>,
        #[serde(default)]
        attributes: ScheduleAttributes,
    },
    Template {
        #[serde(default = "default_schedule_id")]
        id: String,
        /// Falls back to the built-in day/night program when absent.
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        variables: Map<String, Value>,
    },
}

impl ScheduleConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Rules { id, .. } | Self::Template { id, .. } => id,
        }
    }
}

fn default_schedule_id() -> String {
    DEFAULT_SCHEDULE_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub room_temp_sensor: String,
    pub weather_entity: Option<String>,
    pub outside_temp_sensor: Option<String>,
    /// External thermostat used to infer reality when the fix action is pressed.
    pub climate_entity: Option<String>,
    pub actuator: ActuatorConfig,
    pub control: ControlConfig,
    pub power: PowerConfig,
    pub schedule: Option<ScheduleConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Smart Heat Pump".to_string(),
            room_temp_sensor: String::new(),
            weather_entity: None,
            outside_temp_sensor: None,
            climate_entity: None,
            actuator: ActuatorConfig::default(),
            control: ControlConfig::default(),
            power: PowerConfig::default(),
            schedule: None,
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.control.sanitize();
        self.power.sanitize();
        for optional in [
            &mut self.weather_entity,
            &mut self.outside_temp_sensor,
            &mut self.climate_entity,
        ] {
            if optional.as_deref().is_some_and(|id| id.trim().is_empty()) {
                *optional = None;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_temp_sensor.trim().is_empty() {
            return Err(ConfigError::MissingRoomSensor);
        }
        check_entity(&self.room_temp_sensor)?;

        if self.weather_entity.is_none() && self.outside_temp_sensor.is_none() {
            return Err(ConfigError::MissingOutsideTemperature);
        }
        for id in [&self.weather_entity, &self.outside_temp_sensor, &self.climate_entity]
            .into_iter()
            .flatten()
        {
            check_entity(id)?;
        }

        match &self.actuator {
            ActuatorConfig::Switch { entity_id } => {
                if entity_id.trim().is_empty() {
                    return Err(ConfigError::MissingActuator("switch entity"));
                }
                check_entity(entity_id)?;
            }
            ActuatorConfig::Infrared {
                remote_entity,
                power_on_command,
                power_off_command,
                ..
            } => {
                if remote_entity.trim().is_empty() {
                    return Err(ConfigError::MissingActuator("remote entity"));
                }
                check_entity(remote_entity)?;
                if power_on_command.trim().is_empty() {
                    return Err(ConfigError::InvalidCommand("power_on_command"));
                }
                if power_off_command.trim().is_empty() {
                    return Err(ConfigError::InvalidCommand("power_off_command"));
                }
            }
        }

        if !(self.control.min_temp < self.control.max_temp) {
            return Err(ConfigError::InvalidRange("min_temp/max_temp"));
        }
        if !(self.power.cop > 0.0) {
            return Err(ConfigError::InvalidRange("cop"));
        }

        match &self.schedule {
            Some(ScheduleConfig::Rules { entries, .. }) => {
                for entry in entries {
                    entry
                        .validate()
                        .map_err(|err| ConfigError::InvalidSchedule(err.to_string()))?;
                }
            }
            Some(ScheduleConfig::Template { template, .. }) => {
                if let Some(source) = template {
                    Template::compile(source)
                        .map_err(|err| ConfigError::InvalidTemplate(err.to_string()))?;
                }
            }
            None => {}
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            client_id: "heatpump-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub timezone: String,
    pub mqtt: MqttConfig,
    pub http_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            timezone: "Europe/Amsterdam".to_string(),
            mqtt: MqttConfig::default(),
            http_port: 8080,
        }
    }
}

/// `domain.object_id`, both parts lowercase alphanumerics or underscores.
pub fn is_entity_id(value: &str) -> bool {
    let Some((domain, object_id)) = value.split_once('.') else {
        return false;
    };
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    valid_part(domain) && valid_part(object_id)
}

fn check_entity(id: &str) -> Result<(), ConfigError> {
    if is_entity_id(id) {
        Ok(())
    } else {
        Err(ConfigError::InvalidEntity(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_device() -> DeviceConfig {
        DeviceConfig {
            room_temp_sensor: "sensor.living_room".to_string(),
            weather_entity: Some("weather.home".to_string()),
            actuator: ActuatorConfig::Infrared {
                remote_entity: "remote.broadlink".to_string(),
                device: Some("heatpump".to_string()),
                power_on_command: "power_on".to_string(),
                power_off_command: "power_off".to_string(),
                temp_up_command: Some("temp_up".to_string()),
                temp_down_command: Some("temp_down".to_string()),
            },
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn accepts_minimal_valid_device() {
        assert_eq!(valid_device().validate(), Ok(()));
    }

    #[test]
    fn rejects_missing_outside_sources() {
        let mut device = valid_device();
        device.weather_entity = None;
        let err = device.validate().unwrap_err();
        assert_eq!(err.code(), "missing_outside_temp");
    }

    #[test]
    fn rejects_malformed_entity_ids() {
        let mut device = valid_device();
        device.room_temp_sensor = "Living Room".to_string();
        assert_eq!(device.validate().unwrap_err().code(), "invalid_entity");
        assert!(!is_entity_id("sensor."));
        assert!(is_entity_id("sensor.outside_2"));
    }

    #[test]
    fn rejects_broken_template() {
        let mut device = valid_device();
        device.schedule = Some(ScheduleConfig::Template {
            id: DEFAULT_SCHEDULE_ID.to_string(),
            template: Some("if room_temp < then".to_string()),
            variables: Map::new(),
        });
        assert_eq!(device.validate().unwrap_err().code(), "invalid_template");
    }

    #[test]
    fn sanitize_clamps_ranges() {
        let mut device = valid_device();
        device.control.initial_target_temp = 45.0;
        device.control.schedule_step_cap = 0;
        device.power.cop = 0.0;
        device.outside_temp_sensor = Some("  ".to_string());
        device.sanitize();

        assert_eq!(device.control.initial_target_temp, 30.0);
        assert_eq!(device.control.schedule_step_cap, 1);
        assert_eq!(device.power.cop, 0.5);
        assert_eq!(device.outside_temp_sensor, None);
    }

    #[test]
    fn parses_tagged_actuator_and_schedule() {
        let raw = r#"{
            "room_temp_sensor": "sensor.room",
            "outside_temp_sensor": "sensor.outside",
            "actuator": { "mode": "switch", "entity_id": "switch.heatpump" },
            "schedule": {
                "kind": "rules",
                "entries": [{ "from": "22:00", "to": "06:30", "weekdays": [1, 2] }],
                "attributes": { "target_temp": 19.0 }
            }
        }"#;
        let device: DeviceConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(
            device.actuator,
            ActuatorConfig::Switch {
                entity_id: "switch.heatpump".to_string()
            }
        );
        assert_eq!(device.schedule.as_ref().map(ScheduleConfig::id), Some("schedule"));
        assert_eq!(device.validate(), Ok(()));
    }
}
