use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use heatpump_common::{
    diagnostics, entity_from_topic, state_topic, ChangeResult, ControlArbiter, EntityState,
    HvacMode, RuntimeConfig, ScheduleAttributes, UpdateFailed, TOPIC_CMD_DEVICE_TEMP,
    TOPIC_CMD_FIX, TOPIC_CMD_POWER, TOPIC_CMD_SYSTEM, TOPIC_CMD_TARGET, TOPIC_ENTITY_WILDCARD,
};

use crate::mqtt::{
    parse_command, parse_entity_payload, parse_switch, parse_temperature, ControlCommand,
    MqttTransport, MAX_MQTT_PAYLOAD_BYTES,
};

const REFRESH_INTERVAL_SECS: u64 = 30;
const MAX_BACKOFF_SECS: u64 = 300;
const PUBLISH_HEARTBEAT: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct AppState {
    arbiter: Arc<Mutex<ControlArbiter<MqttTransport>>>,
    entities: Arc<Mutex<HashMap<String, EntityState>>>,
    refresh: Arc<Notify>,
    timezone: Tz,
    state_topic: Arc<String>,
    mqtt: AsyncClient,
}

impl AppState {
    fn now(&self) -> DateTime<FixedOffset> {
        now_in_timezone(self.timezone)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ScheduleAttributesView {
    #[serde(rename = "scheduleId")]
    schedule_id: String,
    kind: &'static str,
    stored: ScheduleAttributes,
    effective: ScheduleAttributes,
    active: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("HEATPUMP_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./heatpump.json"));
    let mut runtime = load_runtime_config(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    apply_env_overrides(&mut runtime);

    let timezone = runtime
        .timezone
        .parse::<Tz>()
        .ok()
        .with_context(|| format!("unknown timezone '{}'", runtime.timezone))?;

    let mut mqtt_options = MqttOptions::new(
        runtime.mqtt.client_id.clone(),
        runtime.mqtt.host.clone(),
        runtime.mqtt.port,
    );
    if !runtime.mqtt.user.is_empty() {
        mqtt_options.set_credentials(runtime.mqtt.user.clone(), runtime.mqtt.pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let state_topic = state_topic(&runtime.device.name);
    let mut arbiter =
        ControlArbiter::new(runtime.device.clone(), MqttTransport::new(mqtt.clone()))
            .map_err(|err| {
                anyhow::anyhow!("invalid device configuration ({}): {err}", err.code())
            })?;
    arbiter.set_time_zone(timezone);

    let app_state = AppState {
        arbiter: Arc::new(Mutex::new(arbiter)),
        entities: Arc::new(Mutex::new(HashMap::new())),
        refresh: Arc::new(Notify::new()),
        timezone,
        state_topic: Arc::new(state_topic),
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_refresh_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/target", post(handle_set_target))
        .route("/api/system", post(handle_set_system))
        .route("/api/power", post(handle_set_power))
        .route("/api/device-temp", post(handle_set_device_temp))
        .route("/api/fix", post(handle_fix))
        .route(
            "/api/schedule/attributes",
            get(handle_get_schedule_attributes).put(handle_put_schedule_attributes),
        )
        .route("/api/diagnostics", get(handle_get_diagnostics))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!(device = %runtime.device.name, "controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("no config file at {}, using defaults", path.display());
            Ok(RuntimeConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.mqtt.host = host;
    }
    if let Some(port) = env_parse::<u16>("MQTT_PORT") {
        runtime.mqtt.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.mqtt.user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.mqtt.pass = pass;
    }
    if let Some(port) = env_parse::<u16>("CONTROLLER_HTTP_PORT") {
        runtime.http_port = port;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse::<T>().ok())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_ENTITY_WILDCARD,
        TOPIC_CMD_TARGET,
        TOPIC_CMD_SYSTEM,
        TOPIC_CMD_POWER,
        TOPIC_CMD_DEVICE_TEMP,
        TOPIC_CMD_FIX,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;

    if let Some(entity_id) = entity_from_topic(topic) {
        let mut entities = app_state.entities.lock().await;
        if message.trim().is_empty() {
            entities.remove(entity_id);
        } else {
            entities.insert(entity_id.to_string(), parse_entity_payload(message));
        }
        return Ok(());
    }

    if let Some(command) = parse_command(topic, message)? {
        let change = apply_command(app_state, command).await;
        debug!(?command, changed = change.is_changed(), "mqtt command applied");
    }
    Ok(())
}

/// Runs one user write path and asks the refresh loop for an out-of-band pass.
async fn apply_command(app_state: &AppState, command: ControlCommand) -> ChangeResult {
    let now = app_state.now();
    let change = match command {
        ControlCommand::Target(value) => {
            app_state.arbiter.lock().await.set_user_target_temperature(value)
        }
        ControlCommand::System(on) => app_state.arbiter.lock().await.set_virtual_system_on(on, now),
        ControlCommand::Power(on) => app_state.arbiter.lock().await.set_physical_power_on(on, now),
        ControlCommand::DeviceTemp(value) => app_state
            .arbiter
            .lock()
            .await
            .set_device_set_temperature(value, now),
        ControlCommand::Fix => {
            let states = app_state.entities.lock().await.clone();
            app_state.arbiter.lock().await.fix(now, &states)
        }
    };
    app_state.refresh.notify_one();
    change
}

fn spawn_refresh_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        let mut last_publish: Option<Instant> = None;
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = app_state.refresh.notified() => {}
            }

            let heartbeat_due = last_publish.map_or(true, |at| at.elapsed() >= PUBLISH_HEARTBEAT);
            match refresh(&app_state, heartbeat_due).await {
                Ok(published) => {
                    if published {
                        last_publish = Some(Instant::now());
                    }
                    failures = 0;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        %err,
                        failures,
                        retry_in_secs = backoff(failures).as_secs(),
                        "refresh failed; backing off"
                    );
                }
            }
            delay = backoff(failures);
        }
    });
}

/// Regular interval with no failures, then doubling per consecutive failure up to the cap.
fn backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(8);
    let secs = REFRESH_INTERVAL_SECS.saturating_mul(1 << doublings);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

/// One refresh on its own task so a panic in the engine surfaces as [`UpdateFailed`]
/// instead of taking the loop down. Returns whether a snapshot was published.
async fn refresh(app_state: &AppState, heartbeat_due: bool) -> Result<bool, UpdateFailed> {
    let task_state = app_state.clone();
    let payload = tokio::spawn(async move { refresh_snapshot(&task_state, heartbeat_due).await })
        .await
        .map_err(|err| UpdateFailed(format!("refresh task aborted: {err}")))??;

    let Some(body) = payload else {
        return Ok(false);
    };

    if let Err(err) = app_state
        .mqtt
        .publish(app_state.state_topic.as_str(), QoS::AtLeastOnce, true, body)
        .await
    {
        warn!("controller state publish failed: {err}");
        return Ok(false);
    }
    Ok(true)
}

async fn refresh_snapshot(
    app_state: &AppState,
    heartbeat_due: bool,
) -> Result<Option<Vec<u8>>, UpdateFailed> {
    let now = app_state.now();
    let states = app_state.entities.lock().await.clone();

    let mut arbiter = app_state.arbiter.lock().await;
    let snapshot = arbiter.tick(now, &states);
    let changed = arbiter.take_publish_request();
    drop(arbiter);

    if !changed && !heartbeat_due {
        return Ok(None);
    }
    serde_json::to_vec(&snapshot)
        .map(Some)
        .map_err(|err| UpdateFailed(format!("snapshot serialization failed: {err}")))
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.now();
    let snapshot = state.arbiter.lock().await.snapshot(now);
    Json(snapshot)
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = parse_temperature(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    let _ = apply_command(&state, ControlCommand::Target(target)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_system(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(on) = parse_switch(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'");
    };

    let _ = apply_command(&state, ControlCommand::System(on)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_power(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(on) = parse_switch(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'");
    };

    let _ = apply_command(&state, ControlCommand::Power(on)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_device_temp(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(temp) = parse_temperature(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    let _ = apply_command(&state, ControlCommand::DeviceTemp(temp)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_fix(State(state): State<AppState>) -> impl IntoResponse {
    let _ = apply_command(&state, ControlCommand::Fix).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_schedule_attributes(State(state): State<AppState>) -> impl IntoResponse {
    let arbiter = state.arbiter.lock().await;
    match schedule_attributes_view(&arbiter) {
        Some(view) => Json(view).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No schedule configured"),
    }
}

async fn handle_put_schedule_attributes(
    State(state): State<AppState>,
    Json(update): Json<Map<String, Value>>,
) -> impl IntoResponse {
    let view = {
        let mut arbiter = state.arbiter.lock().await;
        let Some(schedule_id) = arbiter.schedule().map(|schedule| schedule.id().to_string()) else {
            return error_response(StatusCode::NOT_FOUND, "No schedule configured");
        };
        if let Some(Value::String(mode)) = update.get("hvac_mode") {
            if HvacMode::parse(mode).is_none() {
                return error_response_with_code(
                    StatusCode::BAD_REQUEST,
                    &format!("Invalid hvac_mode '{mode}'. Use 'heat' or 'off'"),
                    "invalid_schedule",
                );
            }
        }
        let attributes = ScheduleAttributes::from_map(update);
        let _ = arbiter.set_schedule_attributes(&schedule_id, attributes);
        schedule_attributes_view(&arbiter)
    };

    state.refresh.notify_one();
    match view {
        Some(view) => Json(view).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No schedule configured"),
    }
}

async fn handle_get_diagnostics(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.now();
    let arbiter = state.arbiter.lock().await;
    Json(diagnostics::export(&*arbiter, now))
}

fn schedule_attributes_view(
    arbiter: &ControlArbiter<MqttTransport>,
) -> Option<ScheduleAttributesView> {
    let schedule = arbiter.schedule()?;
    let schedule_id = schedule.id().to_string();
    Some(ScheduleAttributesView {
        kind: if schedule.is_template() { "template" } else { "rules" },
        stored: arbiter.schedule_overrides(&schedule_id),
        effective: arbiter.schedule_attributes().clone(),
        active: arbiter.schedule_active(),
        schedule_id,
    })
}

fn now_in_timezone(timezone: Tz) -> DateTime<FixedOffset> {
    let local = Utc::now().with_timezone(&timezone);
    local.with_timezone(&local.offset().fix())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            code: None,
        }),
    )
        .into_response()
}

fn error_response_with_code(
    status: StatusCode,
    message: &str,
    code: &'static str,
) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            code: Some(code),
        }),
    )
        .into_response()
}
