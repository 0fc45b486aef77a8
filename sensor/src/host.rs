use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use heatpump_common::{entity_topic, EntityState};

const ROOM_ENTITY: &str = "sensor.room_temperature";
const OUTSIDE_ENTITY: &str = "sensor.outside_temperature";
const WEATHER_ENTITY: &str = "weather.home";

/// One round of simulated readings.
#[derive(Debug, Clone, PartialEq)]
struct Readings {
    room: f32,
    outside: f32,
}

/// Slow sawtooth around a cool room and a cold day.
fn simulate(tick: u64) -> Readings {
    Readings {
        room: 18.5 + (tick % 12) as f32 * 0.25,
        outside: 2.0 + (tick % 20) as f32 * 0.5,
    }
}

fn weather_state(outside: f32) -> EntityState {
    let condition = if outside < 3.0 { "snowy" } else { "cloudy" };
    EntityState::new(condition).with_attribute("temperature", f64::from(outside))
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let interval_secs = std::env::var("SENSOR_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(30);

    let mut mqtt_options = MqttOptions::new("heatpump-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!(interval_secs, "simulated sensor publisher started");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);
        let readings = simulate(tick);

        mqtt.publish(
            entity_topic(ROOM_ENTITY),
            QoS::AtLeastOnce,
            true,
            format!("{:.2}", readings.room),
        )
        .await
        .context("failed to publish room temperature")?;
        mqtt.publish(
            entity_topic(OUTSIDE_ENTITY),
            QoS::AtLeastOnce,
            true,
            format!("{:.1}", readings.outside),
        )
        .await
        .context("failed to publish outside temperature")?;

        let weather = serde_json::to_vec(&weather_state(readings.outside))
            .context("failed to serialize weather state")?;
        mqtt.publish(entity_topic(WEATHER_ENTITY), QoS::AtLeastOnce, true, weather)
            .await
            .context("failed to publish weather state")?;
    }
}
