use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::db;
use crate::services::alerts::AlertManager;
use crate::services::fanout::RealtimeFanout;
use crate::services::readings::{IngestStats, ReadingStore};
use crate::services::thresholds::ThresholdCatalog;
use crate::state::AppState;

pub fn test_config() -> CoreConfig {
    CoreConfig {
        // Lazy pool; nothing listens on this port, so database-backed paths
        // fail fast instead of hanging.
        database_url: "postgresql://postgres@127.0.0.1:9/postgres".to_string(),
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_client_id: "sewerwatch-core-tests".to_string(),
        mqtt_topic_prefix: "sewers".to_string(),
        retention_days: 90,
        store_queue_capacity: 64,
        store_batch_size: 16,
        store_flush_interval_ms: 3_600_000,
        fanout_capacity: 32,
        retention_poll_interval_seconds: 3600,
    }
}

pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    let stats = Arc::new(IngestStats::new());
    let store = ReadingStore::new(
        pool.clone(),
        stats.clone(),
        config.store_queue_capacity,
        config.store_batch_size,
        Duration::from_millis(config.store_flush_interval_ms),
    );
    let alerts = Arc::new(AlertManager::new(pool.clone()));
    let thresholds = Arc::new(ThresholdCatalog::new(pool.clone()));
    let fanout = Arc::new(RealtimeFanout::new(config.fanout_capacity));

    AppState {
        config,
        db: pool,
        stats,
        store,
        alerts,
        thresholds,
        fanout,
        shutdown: CancellationToken::new(),
    }
}

/// A pool whose backend accepts TCP connections and then never speaks, so
/// any acquire waits out the full timeout. `None` where the sandbox forbids
/// binding a local listener.
pub async fn hung_pool() -> Option<sqlx::PgPool> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .connect_lazy(&format!("postgresql://postgres@{addr}/none"))
        .ok()
}
