use serde::Serialize;
use tracing::{error, warn};

use crate::{config::ActuatorConfig, error::TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    PowerOn,
    PowerOff,
    TempUp,
    TempDown,
}

impl DeviceCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "power_on",
            Self::PowerOff => "power_off",
            Self::TempUp => "temp_up",
            Self::TempDown => "temp_down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Up,
    Down,
}

impl StepDirection {
    pub fn command(self) -> DeviceCommand {
        match self {
            Self::Up => DeviceCommand::TempUp,
            Self::Down => DeviceCommand::TempDown,
        }
    }

    pub fn sign(self) -> f32 {
        match self {
            Self::Up => 1.0,
            Self::Down => -1.0,
        }
    }
}

/// Fully resolved destination of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    Switch { entity_id: String, on: bool },
    Remote {
        remote_entity: String,
        device: Option<String>,
        command: String,
    },
}

/// The only seam that leaves the process when a command is issued.
pub trait CommandTransport {
    fn send(&mut self, target: &CommandTarget) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActuatorDiagnostics {
    pub mode: &'static str,
    #[serde(rename = "sentCommands")]
    pub sent_commands: u64,
    #[serde(rename = "failedCommands")]
    pub failed_commands: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

/// Turns abstract device commands into transport sends. It never checks the rate gate;
/// callers do that before invoking it.
pub struct ActuatorGateway<T> {
    config: ActuatorConfig,
    transport: T,
    sent_commands: u64,
    failed_commands: u64,
    last_error: Option<String>,
}

impl<T: CommandTransport> ActuatorGateway<T> {
    pub fn new(config: ActuatorConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            sent_commands: 0,
            failed_commands: 0,
            last_error: None,
        }
    }

    pub fn power_on(&mut self) -> bool {
        self.send(DeviceCommand::PowerOn)
    }

    pub fn power_off(&mut self) -> bool {
        self.send(DeviceCommand::PowerOff)
    }

    pub fn send_step(&mut self, direction: StepDirection) -> bool {
        self.send(direction.command())
    }

    pub fn supports_stepping(&self) -> bool {
        match &self.config {
            ActuatorConfig::Switch { .. } => false,
            ActuatorConfig::Infrared {
                temp_up_command,
                temp_down_command,
                ..
            } => has_command(temp_up_command) && has_command(temp_down_command),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn diagnostics(&self) -> ActuatorDiagnostics {
        ActuatorDiagnostics {
            mode: match self.config {
                ActuatorConfig::Switch { .. } => "switch",
                ActuatorConfig::Infrared { .. } => "infrared",
            },
            sent_commands: self.sent_commands,
            failed_commands: self.failed_commands,
            last_error: self.last_error.clone(),
        }
    }

    fn send(&mut self, command: DeviceCommand) -> bool {
        let Some(target) = self.resolve(command) else {
            warn!(command = command.as_str(), "no command configured for actuator");
            return false;
        };

        match self.transport.send(&target) {
            Ok(()) => {
                self.sent_commands = self.sent_commands.saturating_add(1);
                self.last_error = None;
                true
            }
            Err(err) => {
                error!(command = command.as_str(), %err, "actuator command failed");
                self.failed_commands = self.failed_commands.saturating_add(1);
                self.last_error = Some(format!("{}: {err}", command.as_str()));
                false
            }
        }
    }

    fn resolve(&self, command: DeviceCommand) -> Option<CommandTarget> {
        match &self.config {
            ActuatorConfig::Switch { entity_id } => {
                let on = match command {
                    DeviceCommand::PowerOn => true,
                    DeviceCommand::PowerOff => false,
                    DeviceCommand::TempUp | DeviceCommand::TempDown => return None,
                };
                Some(CommandTarget::Switch {
                    entity_id: entity_id.clone(),
                    on,
                })
            }
            ActuatorConfig::Infrared {
                remote_entity,
                device,
                power_on_command,
                power_off_command,
                temp_up_command,
                temp_down_command,
            } => {
                let name = match command {
                    DeviceCommand::PowerOn => Some(power_on_command),
                    DeviceCommand::PowerOff => Some(power_off_command),
                    DeviceCommand::TempUp => temp_up_command.as_ref(),
                    DeviceCommand::TempDown => temp_down_command.as_ref(),
                }?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(CommandTarget::Remote {
                    remote_entity: remote_entity.clone(),
                    device: device.clone().filter(|device| !device.trim().is_empty()),
                    command: name.to_string(),
                })
            }
        }
    }
}

fn has_command(command: &Option<String>) -> bool {
    command.as_deref().is_some_and(|name| !name.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<CommandTarget>,
        fail: bool,
    }

    impl CommandTransport for Recorder {
        fn send(&mut self, target: &CommandTarget) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected);
            }
            self.sent.push(target.clone());
            Ok(())
        }
    }

    fn infrared(temp_up: Option<&str>) -> ActuatorConfig {
        ActuatorConfig::Infrared {
            remote_entity: "remote.living_room".to_string(),
            device: Some("heatpump".to_string()),
            power_on_command: "on".to_string(),
            power_off_command: "off".to_string(),
            temp_up_command: temp_up.map(str::to_string),
            temp_down_command: Some("down".to_string()),
        }
    }

    #[test]
    fn infrared_sends_named_command_to_device() {
        let mut gateway = ActuatorGateway::new(infrared(Some("up")), Recorder::default());
        assert!(gateway.power_on());
        assert!(gateway.send_step(StepDirection::Up));

        assert_eq!(
            gateway.transport().sent,
            vec![
                CommandTarget::Remote {
                    remote_entity: "remote.living_room".to_string(),
                    device: Some("heatpump".to_string()),
                    command: "on".to_string(),
                },
                CommandTarget::Remote {
                    remote_entity: "remote.living_room".to_string(),
                    device: Some("heatpump".to_string()),
                    command: "up".to_string(),
                },
            ]
        );
        assert_eq!(gateway.diagnostics().sent_commands, 2);
    }

    #[test]
    fn missing_step_command_is_a_failed_send() {
        let mut gateway = ActuatorGateway::new(infrared(Some("  ")), Recorder::default());
        assert!(!gateway.supports_stepping());
        assert!(!gateway.send_step(StepDirection::Up));
        assert!(gateway.transport().sent.is_empty());
    }

    #[test]
    fn switch_mode_toggles_and_cannot_step() {
        let config = ActuatorConfig::Switch {
            entity_id: "switch.heatpump".to_string(),
        };
        let mut gateway = ActuatorGateway::new(config, Recorder::default());
        assert!(gateway.power_off());
        assert!(!gateway.send_step(StepDirection::Down));
        assert_eq!(
            gateway.transport().sent,
            vec![CommandTarget::Switch {
                entity_id: "switch.heatpump".to_string(),
                on: false,
            }]
        );
    }

    #[test]
    fn transport_errors_are_counted_not_raised() {
        let mut gateway = ActuatorGateway::new(infrared(Some("up")), Recorder::default());
        gateway.transport_mut().fail = true;
        assert!(!gateway.power_on());

        let diagnostics = gateway.diagnostics();
        assert_eq!(diagnostics.failed_commands, 1);
        assert_eq!(
            diagnostics.last_error.as_deref(),
            Some("power_on: transport is disconnected")
        );
    }
}
