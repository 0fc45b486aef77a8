pub const TOPIC_ENTITY_PREFIX: &str = "heatpump/entity/";
pub const TOPIC_ENTITY_WILDCARD: &str = "heatpump/entity/#";

pub const TOPIC_CMD_TARGET: &str = "heatpump/cmnd/target";
pub const TOPIC_CMD_SYSTEM: &str = "heatpump/cmnd/system";
pub const TOPIC_CMD_POWER: &str = "heatpump/cmnd/power";
pub const TOPIC_CMD_DEVICE_TEMP: &str = "heatpump/cmnd/device_temp";
pub const TOPIC_CMD_FIX: &str = "heatpump/cmnd/fix";

pub fn entity_topic(entity_id: &str) -> String {
    format!("{TOPIC_ENTITY_PREFIX}{entity_id}")
}

/// Entity id carried by an entity-state topic.
pub fn entity_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_ENTITY_PREFIX)
        .filter(|entity_id| !entity_id.is_empty() && !entity_id.contains('/'))
}

pub fn state_topic(device: &str) -> String {
    format!("heatpump/{}/state", slug(device))
}

pub fn remote_send_topic(remote_entity: &str) -> String {
    format!("heatpump/remote/{remote_entity}/send")
}

pub fn switch_set_topic(entity_id: &str) -> String {
    format!("heatpump/switch/{entity_id}/set")
}

/// Lowercase, `_` for anything that is not alphanumeric.
pub fn slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "heatpump".to_string()
    } else {
        slug
    }
}
