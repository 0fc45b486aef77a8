use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use thiserror::Error;

use heatpump_common::{
    remote_send_topic, switch_set_topic, CommandTarget, CommandTransport, EntityState,
    TransportError, TOPIC_CMD_DEVICE_TEMP, TOPIC_CMD_FIX, TOPIC_CMD_POWER, TOPIC_CMD_SYSTEM,
    TOPIC_CMD_TARGET,
};

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;

/// A user write path, as carried by an MQTT command topic or an HTTP request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Target(f32),
    System(bool),
    Power(bool),
    DeviceTemp(f32),
    Fix,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("invalid temperature '{0}'")]
    InvalidTemperature(String),
    #[error("invalid switch value '{0}', expected on or off")]
    InvalidSwitch(String),
}

/// Maps a command topic and its payload to a [`ControlCommand`]. `Ok(None)` means the
/// topic is not a command topic.
pub fn parse_command(topic: &str, payload: &str) -> Result<Option<ControlCommand>, PayloadError> {
    let command = match topic {
        TOPIC_CMD_TARGET => ControlCommand::Target(parse_temperature(payload)?),
        TOPIC_CMD_SYSTEM => ControlCommand::System(parse_switch(payload)?),
        TOPIC_CMD_POWER => ControlCommand::Power(parse_switch(payload)?),
        TOPIC_CMD_DEVICE_TEMP => ControlCommand::DeviceTemp(parse_temperature(payload)?),
        TOPIC_CMD_FIX => ControlCommand::Fix,
        _ => return Ok(None),
    };
    Ok(Some(command))
}

pub fn parse_temperature(raw: &str) -> Result<f32, PayloadError> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| PayloadError::InvalidTemperature(raw.trim().to_string()))
}

pub fn parse_switch(raw: &str) -> Result<bool, PayloadError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "heat" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(PayloadError::InvalidSwitch(other.to_string())),
    }
}

/// Entity payloads are either `{"state": .., "attributes": {..}}` or the bare state text.
pub fn parse_entity_payload(payload: &str) -> EntityState {
    let trimmed = payload.trim();
    if trimmed.starts_with('{') {
        if let Ok(entity) = serde_json::from_str::<EntityState>(trimmed) {
            return entity;
        }
    }
    EntityState::new(trimmed)
}

#[derive(Debug, Serialize)]
struct RemoteSend<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<&'a str>,
}

/// Topic and payload a command target is published as.
pub fn encode_command(target: &CommandTarget) -> Result<(String, Vec<u8>), TransportError> {
    match target {
        CommandTarget::Switch { entity_id, on } => {
            let payload = if *on { "ON" } else { "OFF" };
            Ok((switch_set_topic(entity_id), payload.as_bytes().to_vec()))
        }
        CommandTarget::Remote {
            remote_entity,
            device,
            command,
        } => {
            let body = RemoteSend {
                command,
                device: device.as_deref(),
            };
            let payload = serde_json::to_vec(&body)
                .map_err(|err| TransportError::Other(err.to_string()))?;
            Ok((remote_send_topic(remote_entity), payload))
        }
    }
}

/// Publishes actuator commands without waiting on the event loop.
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl CommandTransport for MqttTransport {
    fn send(&mut self, target: &CommandTarget) -> Result<(), TransportError> {
        let (topic, payload) = encode_command(target)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| TransportError::Other(err.to_string()))
    }
}
