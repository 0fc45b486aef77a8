pub mod actuator;
pub mod arbiter;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod power;
pub mod schedule;
pub mod sensor;
pub mod state;
pub mod template;
pub mod topics;
pub mod types;

pub use actuator::{
    ActuatorDiagnostics, ActuatorGateway, CommandTarget, CommandTransport, DeviceCommand,
    StepDirection,
};
pub use arbiter::{infer_fix_from_climate, ControlArbiter, COMMAND_INTERVAL_SECS};
pub use config::{
    ActuatorConfig, ControlConfig, DeviceConfig, MqttConfig, PowerConfig, RuntimeConfig,
    ScheduleConfig,
};
pub use error::{ConfigError, RuleError, TemplateError, TransportError, UpdateFailed};
pub use schedule::{RuleEntry, Schedule, ScheduleAttributes, ScheduleResult};
pub use sensor::{EntityState, SensorGateway, SensorReadings, StateSource};
pub use state::{ControllerState, StateStore};
pub use template::Template;
pub use topics::*;
pub use types::{ChangeResult, ControllerSnapshot, HvacAction, HvacMode, TurnOnSource};
