use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic_prefix: String,
    pub retention_days: u32,
    pub store_queue_capacity: usize,
    pub store_batch_size: usize,
    pub store_flush_interval_ms: u64,
    pub fanout_capacity: usize,
    pub retention_poll_interval_seconds: u64,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("SEWER_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("SEWER_DATABASE_URL must be set for the monitoring runtime")?;

        let mqtt_host = env_string("SEWER_MQTT_HOST", "127.0.0.1");
        let mqtt_port = env_u16("SEWER_MQTT_PORT", 1883);
        let mqtt_username = env_optional_string("SEWER_MQTT_USERNAME");
        let mqtt_password = env_optional_string("SEWER_MQTT_PASSWORD");
        let mqtt_client_id = env_string("SEWER_MQTT_CLIENT_ID", "sewerwatch-core");
        let mqtt_topic_prefix = env_string("SEWER_MQTT_TOPIC_PREFIX", "sewers");

        let retention_days = env_u32("SEWER_RETENTION_DAYS", 90).max(1);
        let store_queue_capacity =
            env_u64("SEWER_STORE_QUEUE_CAPACITY", 8192).clamp(64, 262_144) as usize;
        let store_batch_size = env_u64("SEWER_STORE_BATCH_SIZE", 256).clamp(1, 4096) as usize;
        let store_flush_interval_ms =
            env_u64("SEWER_STORE_FLUSH_INTERVAL_MS", 1000).clamp(50, 60_000);
        let fanout_capacity = env_u64("SEWER_FANOUT_CAPACITY", 512).clamp(16, 65_536) as usize;
        let retention_poll_interval_seconds =
            env_u64("SEWER_RETENTION_POLL_INTERVAL_SECONDS", 3600).clamp(60, 24 * 3600);

        Ok(Self {
            database_url,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic_prefix,
            retention_days,
            store_queue_capacity,
            store_batch_size,
            store_flush_interval_ms,
            fanout_capacity,
            retention_poll_interval_seconds,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
