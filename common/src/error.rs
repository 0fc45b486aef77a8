use thiserror::Error;

/// Rejection of a device configuration at setup time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("room temperature sensor is not configured")]
    MissingRoomSensor,
    #[error("neither a weather entity nor an outside temperature sensor is configured")]
    MissingOutsideTemperature,
    #[error("entity id '{0}' is not a valid entity reference")]
    InvalidEntity(String),
    #[error("actuator is not configured: {0}")]
    MissingActuator(&'static str),
    #[error("command '{0}' is not configured")]
    InvalidCommand(&'static str),
    #[error("schedule template is invalid: {0}")]
    InvalidTemplate(String),
    #[error("schedule is invalid: {0}")]
    InvalidSchedule(String),
    #[error("{0} is out of range")]
    InvalidRange(&'static str),
}

impl ConfigError {
    /// Stable reason code reported to the setup path.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingRoomSensor => "missing_room_sensor",
            Self::MissingOutsideTemperature => "missing_outside_temp",
            Self::InvalidEntity(_) => "invalid_entity",
            Self::MissingActuator(_) => "missing_actuator",
            Self::InvalidCommand(_) => "invalid_command",
            Self::InvalidTemplate(_) => "invalid_template",
            Self::InvalidSchedule(_) => "invalid_schedule",
            Self::InvalidRange(_) => "invalid_range",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport queue is full")]
    QueueFull,
    #[error("transport is disconnected")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid time '{0}', expected HH:MM")]
    Time(String),
    #[error("weekday {0} is outside 1..=7")]
    Weekday(u8),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{function}() expects {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
}

/// A refresh cycle that did not complete; the scheduler backs off and retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("update failed: {0}")]
pub struct UpdateFailed(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(
            ConfigError::MissingOutsideTemperature.code(),
            "missing_outside_temp"
        );
        assert_eq!(
            ConfigError::InvalidEntity("foo".to_string()).code(),
            "invalid_entity"
        );
        assert_eq!(
            ConfigError::InvalidTemplate("eof".to_string()).to_string(),
            "schedule template is invalid: eof"
        );
    }
}
