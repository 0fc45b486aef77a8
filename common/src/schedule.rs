use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    config::{DeviceConfig, ScheduleConfig},
    error::{ConfigError, RuleError, TemplateError},
    sensor::{numeric_value, StateSource},
    template::{
        default_variables, interpret_output, is_truthy, render_value, Interpreted, Template,
        TemplateContext, DEFAULT_TEMPLATE,
    },
    types::HvacMode,
};

/// Named schedule attributes with typed fields; anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleAttributes {
    /// Device set-point, reached through stepped commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temp: Option<f32>,
    /// User intent, written without device commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hvac_mode: Option<HvacMode>,
    #[serde(alias = "preset", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_if: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_on: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScheduleAttributes {
    /// Loose conversion from a JSON object produced by a template or an operator.
    pub fn from_map(map: Map<String, Value>) -> Self {
        let mut attributes = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "active" | "error" => {}
                "target_temp" => attributes.target_temp = numeric_value(&value),
                "target_temperature" => attributes.target_temperature = numeric_value(&value),
                "hvac_mode" => {
                    attributes.hvac_mode = match &value {
                        Value::String(mode) => HvacMode::parse(mode),
                        Value::Bool(true) => Some(HvacMode::Heat),
                        Value::Bool(false) => Some(HvacMode::Off),
                        _ => None,
                    }
                }
                "mode" | "preset" => {
                    attributes.mode = value.as_str().map(str::to_string);
                }
                "run_if" => {
                    attributes.run_if = value
                        .as_str()
                        .map(str::trim)
                        .filter(|guard| !guard.is_empty())
                        .map(str::to_string);
                }
                "keep_on" => {
                    attributes.keep_on = Some(match &value {
                        Value::String(raw) => {
                            matches!(interpret_output(raw), Interpreted::Flag(true))
                        }
                        other => is_truthy(other),
                    });
                }
                _ => {
                    attributes.extra.insert(key, value);
                }
            }
        }
        attributes
    }

    /// Every field present in `reported` wins over `stored`.
    pub fn merge(stored: &Self, reported: &Self) -> Self {
        let mut extra = stored.extra.clone();
        extra.extend(reported.extra.clone());

        Self {
            target_temp: reported.target_temp.or(stored.target_temp),
            target_temperature: reported.target_temperature.or(stored.target_temperature),
            hvac_mode: reported.hvac_mode.or(stored.hvac_mode),
            mode: reported.mode.clone().or_else(|| stored.mode.clone()),
            run_if: reported.run_if.clone().or_else(|| stored.run_if.clone()),
            keep_on: reported.keep_on.or(stored.keep_on),
            extra,
        }
    }

    pub fn keeps_on(&self) -> bool {
        self.keep_on.unwrap_or(false)
    }
}

/// One weekly time window. `to < from` spans midnight and belongs to the weekday it
/// started on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEntry {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekdays: Option<Vec<u8>>,
}

impl RuleEntry {
    pub fn validate(&self) -> Result<(), RuleError> {
        self.window().map(|_| ())
    }

    fn window(&self) -> Result<RuleWindow, RuleError> {
        let from = parse_clock(&self.from)?;
        let to = parse_clock(&self.to)?;
        if let Some(day) = self
            .weekdays
            .iter()
            .flatten()
            .find(|day| !(1..=7).contains(*day))
        {
            return Err(RuleError::Weekday(*day));
        }
        Ok(RuleWindow {
            from,
            to,
            weekdays: self.weekdays.clone(),
        })
    }
}

/// Minutes since midnight for `HH:MM`.
pub fn parse_clock(raw: &str) -> Result<u16, RuleError> {
    let invalid = || RuleError::Time(raw.to_string());
    let (hour, minute) = raw.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u16 = hour.parse().map_err(|_| invalid())?;
    let minute: u16 = minute.parse().map_err(|_| invalid())?;
    if hour >= 24 || minute >= 60 {
        return Err(invalid());
    }
    Ok(hour * 60 + minute)
}

#[derive(Debug, Clone, PartialEq)]
struct RuleWindow {
    from: u16,
    to: u16,
    weekdays: Option<Vec<u8>>,
}

impl RuleWindow {
    fn allows(&self, weekday: u8) -> bool {
        self.weekdays
            .as_ref()
            .map_or(true, |days| days.contains(&weekday))
    }

    fn covers(&self, weekday: u8, minute: u16) -> bool {
        if self.from <= self.to {
            self.allows(weekday) && (self.from..self.to).contains(&minute)
        } else {
            (minute >= self.from && self.allows(weekday))
                || (minute < self.to && self.allows(previous_weekday(weekday)))
        }
    }

    fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

fn previous_weekday(weekday: u8) -> u8 {
    if weekday <= 1 {
        7
    } else {
        weekday - 1
    }
}

fn clock(now: DateTime<FixedOffset>) -> (u8, u16) {
    let weekday = now.weekday().number_from_monday() as u8;
    let minute = now.hour() as u16 * 60 + now.minute() as u16;
    (weekday, minute)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleResult {
    pub active: bool,
    pub attributes: ScheduleAttributes,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Strategy {
    Rules {
        windows: Vec<RuleWindow>,
        attributes: ScheduleAttributes,
    },
    Template(Template),
}

/// A configured schedule: a weekly rule table or a template program.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    id: String,
    strategy: Strategy,
    variables: Map<String, Value>,
    zone: Option<Tz>,
}

impl Schedule {
    pub fn from_device(device: &DeviceConfig) -> Result<Option<Self>, ConfigError> {
        let Some(config) = &device.schedule else {
            return Ok(None);
        };

        let mut variables = default_variables();
        let strategy = match config {
            ScheduleConfig::Rules {
                entries,
                attributes,
                ..
            } => {
                let windows = entries
                    .iter()
                    .map(RuleEntry::window)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| ConfigError::InvalidSchedule(err.to_string()))?;
                Strategy::Rules {
                    windows,
                    attributes: attributes.clone(),
                }
            }
            ScheduleConfig::Template {
                template,
                variables: operator,
                ..
            } => {
                variables.extend(operator.clone());
                let source = template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
                let compiled = Template::compile(source)
                    .map_err(|err| ConfigError::InvalidTemplate(err.to_string()))?;
                Strategy::Template(compiled)
            }
        };

        let entity = |id: &Option<String>| id.clone().map_or(Value::Null, Value::String);
        variables.insert(
            "room_temp_sensor".to_string(),
            Value::String(device.room_temp_sensor.clone()),
        );
        variables.insert("weather_entity".to_string(), entity(&device.weather_entity));
        variables.insert(
            "outside_temp_sensor".to_string(),
            entity(&device.outside_temp_sensor),
        );

        Ok(Some(Self {
            id: config.id().to_string(),
            strategy,
            variables,
            zone: None,
        }))
    }

    /// Rule windows on later days are resolved in `zone`, so a start across a DST
    /// change carries that day's offset. Without a zone the offset of `now` is reused.
    pub fn set_time_zone(&mut self, zone: Tz) {
        self.zone = Some(zone);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_template(&self) -> bool {
        matches!(self.strategy, Strategy::Template(_))
    }

    /// Never fails; template errors come back as an inactive result carrying the message.
    pub fn evaluate(&self, now: DateTime<FixedOffset>, states: &dyn StateSource) -> ScheduleResult {
        match &self.strategy {
            Strategy::Rules {
                windows,
                attributes,
            } => {
                let (weekday, minute) = clock(now);
                let active = windows.iter().any(|window| window.covers(weekday, minute));
                ScheduleResult {
                    active,
                    attributes: if active {
                        attributes.clone()
                    } else {
                        ScheduleAttributes::default()
                    },
                    error: None,
                }
            }
            Strategy::Template(template) => {
                let context = self.context(now, states);
                match template.render(&context) {
                    Ok(raw) => match interpret_output(&raw) {
                        Interpreted::Object(map) => ScheduleResult {
                            active: map.get("active").is_some_and(is_truthy),
                            attributes: ScheduleAttributes::from_map(map),
                            error: None,
                        },
                        Interpreted::Flag(active) => ScheduleResult {
                            active,
                            ..ScheduleResult::default()
                        },
                    },
                    Err(err) => {
                        warn!(schedule = %self.id, %err, "schedule template evaluation failed");
                        ScheduleResult {
                            active: false,
                            attributes: ScheduleAttributes::default(),
                            error: Some(err.to_string()),
                        }
                    }
                }
            }
        }
    }

    /// Evaluates a `run_if` guard in the same context the schedule sees.
    pub fn check_guard(
        &self,
        guard: &str,
        now: DateTime<FixedOffset>,
        states: &dyn StateSource,
    ) -> Result<bool, TemplateError> {
        let value = Template::compile(guard)?.evaluate(&self.context(now, states))?;
        Ok(match value {
            Value::String(raw) => match interpret_output(&raw) {
                Interpreted::Flag(flag) => flag,
                Interpreted::Object(map) => !map.is_empty(),
            },
            other => is_truthy(&other),
        })
    }

    /// Start of the next rule window strictly after `now`, within a week.
    pub fn next_start(&self, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let Strategy::Rules { windows, .. } = &self.strategy else {
            return None;
        };

        let (today, now_minute) = clock(now);
        let mut best: Option<DateTime<FixedOffset>> = None;

        for day_offset in 0..=7i64 {
            let weekday = ((i64::from(today) - 1 + day_offset) % 7 + 1) as u8;
            for window in windows
                .iter()
                .filter(|window| !window.is_empty() && window.allows(weekday))
            {
                if day_offset == 0 && window.from <= now_minute {
                    continue;
                }

                let date = now.date_naive() + Duration::days(day_offset);
                let Some(naive) =
                    date.and_hms_opt(u32::from(window.from / 60), u32::from(window.from % 60), 0)
                else {
                    continue;
                };
                let resolved = match self.zone {
                    Some(zone) => zone
                        .from_local_datetime(&naive)
                        .earliest()
                        .map(|at| at.fixed_offset()),
                    None => now.offset().from_local_datetime(&naive).single(),
                };
                let Some(candidate) = resolved else {
                    continue;
                };

                if best.map_or(true, |current| candidate < current) {
                    best = Some(candidate);
                }
            }
        }

        best
    }

    /// Whether a rule window begins in `(now, now + minutes]`. Templates have no
    /// enumerable windows and always answer `false`.
    pub fn starts_within(&self, now: DateTime<FixedOffset>, minutes: u32) -> bool {
        self.next_start(now)
            .is_some_and(|start| start - now <= Duration::minutes(i64::from(minutes)))
    }

    fn context<'a>(
        &self,
        now: DateTime<FixedOffset>,
        states: &'a dyn StateSource,
    ) -> TemplateContext<'a> {
        let mut variables = self.variables.clone();
        let (weekday, _) = clock(now);
        variables.insert(
            "now".to_string(),
            Value::String(now.format("%H:%M").to_string()),
        );
        variables.insert("hour".to_string(), Value::from(now.hour()));
        variables.insert("minute".to_string(), Value::from(now.minute()));
        variables.insert("weekday".to_string(), Value::from(weekday));
        TemplateContext { variables, states }
    }
}

/// Rendered form of a result for diagnostics and logs.
pub fn describe(result: &ScheduleResult) -> String {
    let mut map = match serde_json::to_value(&result.attributes) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert("active".to_string(), Value::Bool(result.active));
    if let Some(error) = &result.error {
        map.insert("error".to_string(), Value::String(error.clone()));
    }
    render_value(&Value::Object(map))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{config::ActuatorConfig, sensor::EntityState};
    use pretty_assertions::assert_eq;

    // Jan 5, 2026 is a Monday.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn entry(from: &str, to: &str, weekdays: Option<Vec<u8>>) -> RuleEntry {
        RuleEntry {
            from: from.to_string(),
            to: to.to_string(),
            weekdays,
        }
    }

    fn device(schedule: ScheduleConfig) -> DeviceConfig {
        DeviceConfig {
            room_temp_sensor: "sensor.room".to_string(),
            outside_temp_sensor: Some("sensor.outside".to_string()),
            actuator: ActuatorConfig::Switch {
                entity_id: "switch.heatpump".to_string(),
            },
            schedule: Some(schedule),
            ..DeviceConfig::default()
        }
    }

    fn rules(entries: Vec<RuleEntry>) -> Schedule {
        Schedule::from_device(&device(ScheduleConfig::Rules {
            id: "heating".to_string(),
            entries,
            attributes: ScheduleAttributes {
                target_temp: Some(21.0),
                ..ScheduleAttributes::default()
            },
        }))
        .unwrap()
        .unwrap()
    }

    fn template(source: &str) -> Schedule {
        Schedule::from_device(&device(ScheduleConfig::Template {
            id: "program".to_string(),
            template: Some(source.to_string()),
            variables: Map::new(),
        }))
        .unwrap()
        .unwrap()
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let schedule = rules(vec![entry("22:00", "06:30", None)]);
        let states = HashMap::new();

        assert!(schedule.evaluate(at(5, 23, 0), &states).active);
        assert!(schedule.evaluate(at(6, 5, 0), &states).active);
        assert!(!schedule.evaluate(at(6, 12, 0), &states).active);
        assert!(!schedule.evaluate(at(6, 6, 30), &states).active);
    }

    #[test]
    fn overnight_window_belongs_to_its_start_day() {
        // Friday night only.
        let schedule = rules(vec![entry("22:00", "06:30", Some(vec![5]))]);
        let states = HashMap::new();

        assert!(schedule.evaluate(at(9, 23, 0), &states).active);
        assert!(schedule.evaluate(at(10, 5, 0), &states).active);
        assert!(!schedule.evaluate(at(9, 5, 0), &states).active);
    }

    #[test]
    fn active_rule_reports_its_attributes() {
        let schedule = rules(vec![entry("07:00", "09:00", None)]);
        let result = schedule.evaluate(at(5, 8, 0), &HashMap::new());
        assert_eq!(result.attributes.target_temp, Some(21.0));

        let idle = schedule.evaluate(at(5, 10, 0), &HashMap::new());
        assert_eq!(idle.attributes, ScheduleAttributes::default());
    }

    #[test]
    fn looks_ahead_for_upcoming_windows() {
        let schedule = rules(vec![
            entry("07:00", "09:00", None),
            entry("09:20", "12:00", Some(vec![1])),
        ]);

        assert!(schedule.starts_within(at(5, 9, 0), 30));
        assert!(!schedule.starts_within(at(5, 9, 20), 30));
        // Tuesday has no 09:20 window.
        assert!(!schedule.starts_within(at(6, 9, 0), 30));
        assert_eq!(schedule.next_start(at(6, 9, 0)), Some(at(7, 7, 0)));
    }

    #[test]
    fn next_start_uses_the_offset_of_its_own_day() {
        let mut schedule = rules(vec![entry("07:00", "09:00", None)]);
        // Saturday before the March 2026 switch to summer time in Berlin.
        let saturday_noon = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 28, 12, 0, 0)
            .unwrap();
        let summer = FixedOffset::east_opt(7200).unwrap();

        assert_eq!(
            schedule.next_start(saturday_noon).map(|at| at.offset().local_minus_utc()),
            Some(3600)
        );

        schedule.set_time_zone(chrono_tz::Europe::Berlin);
        assert_eq!(
            schedule.next_start(saturday_noon),
            Some(summer.with_ymd_and_hms(2026, 3, 29, 7, 0, 0).unwrap())
        );
        // Same-day windows are unaffected.
        assert_eq!(schedule.next_start(at(5, 6, 0)), Some(at(5, 7, 0)));
    }

    #[test]
    fn look_ahead_crosses_midnight() {
        let schedule = rules(vec![entry("00:10", "02:00", Some(vec![2]))]);
        assert!(schedule.starts_within(at(5, 23, 50), 30));
        assert!(!schedule.starts_within(at(5, 23, 30), 30));
    }

    #[test]
    fn template_output_becomes_attributes() {
        let schedule = template(
            r#"{ "active": hour >= 6, "target_temp": "21.5", "hvac_mode": "heat", "preset": "comfort", "keep_on": "yes", "note": 1 }"#,
        );
        let result = schedule.evaluate(at(5, 7, 0), &HashMap::new());

        assert!(result.active);
        assert_eq!(result.attributes.target_temp, Some(21.5));
        assert_eq!(result.attributes.hvac_mode, Some(HvacMode::Heat));
        assert_eq!(result.attributes.mode.as_deref(), Some("comfort"));
        assert!(result.attributes.keeps_on());
        assert_eq!(result.attributes.extra.get("note"), Some(&Value::from(1.0)));
        assert!(!schedule.starts_within(at(5, 7, 0), 30));
    }

    #[test]
    fn template_flags_and_errors() {
        let states = HashMap::new();
        assert!(template("'on'").evaluate(at(5, 7, 0), &states).active);
        assert!(!template("'no'").evaluate(at(5, 7, 0), &states).active);

        let failing = template("states('sensor.room') / 2");
        let result = failing.evaluate(at(5, 7, 0), &states);
        assert!(!result.active);
        assert!(result.error.unwrap().contains("type error"));
    }

    #[test]
    fn default_template_is_used_when_none_given() {
        let schedule = Schedule::from_device(&device(ScheduleConfig::Template {
            id: "program".to_string(),
            template: None,
            variables: Map::new(),
        }))
        .unwrap()
        .unwrap();

        let mut states = HashMap::new();
        states.insert("sensor.room".to_string(), EntityState::new("17.0"));
        let result = schedule.evaluate(at(5, 13, 0), &states);

        assert!(result.active);
        assert_eq!(result.attributes.mode.as_deref(), Some("day_heating"));
        assert_eq!(result.attributes.target_temp, Some(20.0));
    }

    #[test]
    fn operator_variables_override_defaults() {
        let mut variables = Map::new();
        variables.insert("target_temp".to_string(), Value::from(22));
        let schedule = Schedule::from_device(&device(ScheduleConfig::Template {
            id: "program".to_string(),
            template: None,
            variables,
        }))
        .unwrap()
        .unwrap();

        let mut states = HashMap::new();
        states.insert("sensor.room".to_string(), EntityState::new("21.0"));
        let result = schedule.evaluate(at(5, 13, 0), &states);
        assert_eq!(result.attributes.target_temp, Some(22.0));
    }

    #[test]
    fn guards_use_schedule_context() {
        let schedule = rules(vec![entry("07:00", "09:00", None)]);
        let mut states = HashMap::new();
        states.insert("sensor.room".to_string(), EntityState::new("18.0"));

        let cold = "float(states(room_temp_sensor), 0) < 19";
        assert_eq!(schedule.check_guard(cold, at(5, 8, 0), &states), Ok(true));
        assert_eq!(schedule.check_guard("'off'", at(5, 8, 0), &states), Ok(false));
        assert!(schedule.check_guard("nope(", at(5, 8, 0), &states).is_err());
    }

    #[test]
    fn reported_attributes_win_on_merge() {
        let mut stored = ScheduleAttributes {
            target_temp: Some(19.0),
            keep_on: Some(true),
            ..ScheduleAttributes::default()
        };
        stored.extra.insert("room".to_string(), Value::from("living"));
        let reported = ScheduleAttributes {
            target_temp: Some(21.0),
            mode: Some("eco".to_string()),
            ..ScheduleAttributes::default()
        };

        let merged = ScheduleAttributes::merge(&stored, &reported);
        assert_eq!(merged.target_temp, Some(21.0));
        assert_eq!(merged.keep_on, Some(true));
        assert_eq!(merged.mode.as_deref(), Some("eco"));
        assert_eq!(merged.extra.get("room"), Some(&Value::from("living")));
    }

    #[test]
    fn rejects_bad_entries() {
        assert_eq!(
            entry("25:00", "06:00", None).validate(),
            Err(RuleError::Time("25:00".to_string()))
        );
        assert_eq!(
            entry("22:00", "06:00", Some(vec![0])).validate(),
            Err(RuleError::Weekday(0))
        );
        assert_eq!(parse_clock("06:30"), Ok(390));
    }
}
