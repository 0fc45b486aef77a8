use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State of one entity in the external state store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Numeric value of the state, `None` when unknown, unavailable or non-numeric.
    pub fn numeric_state(&self) -> Option<f32> {
        match self.state.trim() {
            "" | "unknown" | "unavailable" => None,
            raw => raw.parse::<f32>().ok().filter(|value| value.is_finite()),
        }
    }

    pub fn numeric_attribute(&self, key: &str) -> Option<f32> {
        self.attributes.get(key).and_then(numeric_value)
    }
}

pub(crate) fn numeric_value(value: &Value) -> Option<f32> {
    let parsed = match value {
        Value::Number(number) => number.as_f64().map(|n| n as f32),
        Value::String(raw) => raw.trim().parse::<f32>().ok(),
        _ => None,
    };
    parsed.filter(|value| value.is_finite())
}

/// Read access to the external state store.
pub trait StateSource {
    fn entity(&self, entity_id: &str) -> Option<EntityState>;
}

impl StateSource for HashMap<String, EntityState> {
    fn entity(&self, entity_id: &str) -> Option<EntityState> {
        self.get(entity_id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SensorReadings {
    #[serde(rename = "roomTemperature")]
    pub room_temperature: Option<f32>,
    #[serde(rename = "outsideTemperature")]
    pub outside_temperature: Option<f32>,
}

/// Pulls room and outside temperatures out of the state store. Never fails; a missing
/// reading is `None` for that tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorGateway {
    room_temp_sensor: String,
    weather_entity: Option<String>,
    outside_temp_sensor: Option<String>,
}

impl SensorGateway {
    pub fn new(
        room_temp_sensor: impl Into<String>,
        weather_entity: Option<String>,
        outside_temp_sensor: Option<String>,
    ) -> Self {
        Self {
            room_temp_sensor: room_temp_sensor.into(),
            weather_entity,
            outside_temp_sensor,
        }
    }

    pub fn read(&self, source: &dyn StateSource) -> SensorReadings {
        SensorReadings {
            room_temperature: self.room_temperature(source),
            outside_temperature: self.outside_temperature(source),
        }
    }

    pub fn room_temperature(&self, source: &dyn StateSource) -> Option<f32> {
        source
            .entity(&self.room_temp_sensor)
            .and_then(|entity| entity.numeric_state())
    }

    pub fn outside_temperature(&self, source: &dyn StateSource) -> Option<f32> {
        let from_weather = self
            .weather_entity
            .as_deref()
            .and_then(|id| source.entity(id))
            .and_then(|entity| entity.numeric_attribute("temperature"));

        from_weather.or_else(|| {
            self.outside_temp_sensor
                .as_deref()
                .and_then(|id| source.entity(id))
                .and_then(|entity| entity.numeric_state())
        })
    }
}
