use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::evaluator::EvaluatedReading;

/// Operational counters shared between the MQTT listener, the pipeline and
/// the health endpoint.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }
}

/// Natural key of a stored sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingKey {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
}

/// Flattened row shape for the batched insert.
#[derive(Debug, Clone)]
pub struct ReadingRow {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub sewage_level: f64,
    pub methane_level: f64,
    pub flow_rate: f64,
    pub battery_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: String,
}

impl From<&EvaluatedReading> for ReadingRow {
    fn from(reading: &EvaluatedReading) -> Self {
        let m = &reading.sample.measurements;
        Self {
            device_id: reading.sample.device_id.clone(),
            observed_at: reading.sample.observed_at,
            sewage_level: m.sewage_level,
            methane_level: m.methane_level,
            flow_rate: m.flow_rate,
            battery_level: m.battery_level,
            temperature: m.temperature,
            humidity: m.humidity,
            status: reading.status.as_str().to_string(),
        }
    }
}

/// A persisted sample as read back from Postgres. `alert_types` is derived
/// state and is not stored; only the binary status survives the round trip.
#[derive(Debug, Clone, FromRow, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub sewage_level: f64,
    pub methane_level: f64,
    pub flow_rate: f64,
    pub battery_level: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: String,
}

#[derive(Debug)]
pub enum StoreCommand {
    Reading(ReadingRow),
    Flush(oneshot::Sender<()>),
}

/// Most recent evaluated reading per device, kept in memory for the
/// initial websocket snapshot and the live dashboard read path.
#[derive(Debug, Default)]
pub struct LatestCache {
    inner: Mutex<HashMap<String, EvaluatedReading>>,
}

impl LatestCache {
    /// Keeps the newest reading per device; an out-of-order late sample
    /// never rolls the cache backwards.
    pub fn update(&self, reading: &EvaluatedReading) {
        let mut inner = self.inner.lock().expect("latest cache lock poisoned");
        match inner.get(&reading.sample.device_id) {
            Some(existing) if existing.sample.observed_at > reading.sample.observed_at => {}
            _ => {
                inner.insert(reading.sample.device_id.clone(), reading.clone());
            }
        }
    }

    pub fn latest(&self, device_id: &str) -> Option<EvaluatedReading> {
        let inner = self.inner.lock().expect("latest cache lock poisoned");
        inner.get(device_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<EvaluatedReading> {
        let inner = self.inner.lock().expect("latest cache lock poisoned");
        let mut readings: Vec<EvaluatedReading> = inner.values().cloned().collect();
        readings.sort_by(|a, b| a.sample.device_id.cmp(&b.sample.device_id));
        readings
    }
}

/// Append-only persistence for normalized samples. Appends update the
/// in-memory latest cache synchronously and hand the row to a write-behind
/// batch writer, so the live broadcast never waits on Postgres.
pub struct ReadingStore {
    pool: PgPool,
    tx: mpsc::Sender<StoreCommand>,
    latest: LatestCache,
    stats: Arc<IngestStats>,
    _writer: JoinHandle<()>,
}

impl ReadingStore {
    pub fn new(
        pool: PgPool,
        stats: Arc<IngestStats>,
        queue_capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let writer = spawn_writer(pool.clone(), rx, stats.clone(), batch_size, flush_interval);
        Arc::new(Self {
            pool,
            tx,
            latest: LatestCache::default(),
            stats,
            _writer: writer,
        })
    }

    /// Durability is write-behind: a full writer queue drops the row with a
    /// warning rather than stalling ingestion, since dashboard freshness
    /// outranks guaranteed persistence of every sample.
    pub fn append(&self, reading: &EvaluatedReading) -> ReadingKey {
        self.latest.update(reading);
        let row = ReadingRow::from(reading);
        let key = ReadingKey {
            device_id: row.device_id.clone(),
            observed_at: row.observed_at,
        };
        match self.tx.try_send(StoreCommand::Reading(row)) {
            Ok(()) => {
                self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(device = %key.device_id, error = %err, "reading writer queue full; sample dropped");
            }
        }
        key
    }

    pub fn latest(&self, device_id: &str) -> Option<EvaluatedReading> {
        self.latest.latest(device_id)
    }

    pub fn snapshot(&self) -> Vec<EvaluatedReading> {
        self.latest.snapshot()
    }

    /// Drains the writer buffer; used on shutdown.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stored samples for one device, ascending by `observed_at`. Pass the
    /// last seen timestamp as `from` to restart a scan.
    pub async fn query_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT device_id, observed_at, sewage_level, methane_level, flow_rate,
                   battery_level, temperature, humidity, status
            FROM readings
            WHERE device_id = $1 AND observed_at >= $2 AND observed_at <= $3
            ORDER BY observed_at ASC
            LIMIT $4
            "#,
        )
        .bind(device_id)
        .bind(from)
        .bind(to)
        .bind(limit.clamp(1, 10_000))
        .fetch_all(&self.pool)
        .await
    }

}

/// Upper bound on rows held across failed flushes. Past this the oldest
/// rows are discarded so a long Postgres outage cannot grow memory
/// without bound.
const MAX_RETRY_BUFFER: usize = 50_000;

fn spawn_writer(
    pool: PgPool,
    mut rx: mpsc::Receiver<StoreCommand>,
    stats: Arc<IngestStats>,
    batch_size: usize,
    flush_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let batch_size = batch_size.max(1);
        let mut buffer: Vec<ReadingRow> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                        tracing::warn!(error = %err, "reading flush on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(StoreCommand::Reading(row)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(row);
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                                    tracing::warn!(error = %err, "reading flush on batch size failed");
                                }
                            }
                        }
                        Some(StoreCommand::Flush(done)) => {
                            if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                                tracing::warn!(error = %err, "reading flush on demand failed");
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flush(&pool, &mut buffer, &stats).await {
                                tracing::warn!(error = %err, "reading flush during shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn flush(
    pool: &PgPool,
    buffer: &mut Vec<ReadingRow>,
    stats: &Arc<IngestStats>,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let inserted_at = Utc::now();
    let items = std::mem::take(buffer);
    let len = items.len();

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO readings (device_id, observed_at, sewage_level, methane_level, \
         flow_rate, battery_level, temperature, humidity, status, inserted_at) ",
    );
    builder.push_values(items.iter(), |mut b, row| {
        b.push_bind(&row.device_id)
            .push_bind(row.observed_at)
            .push_bind(row.sewage_level)
            .push_bind(row.methane_level)
            .push_bind(row.flow_rate)
            .push_bind(row.battery_level)
            .push_bind(row.temperature)
            .push_bind(row.humidity)
            .push_bind(&row.status)
            .push_bind(inserted_at);
    });
    builder.push(" ON CONFLICT DO NOTHING");

    match builder.build().execute(pool).await {
        Ok(_) => {
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            stats
                .last_flush_unix_ms
                .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, "flushed readings batch");
            Ok(())
        }
        Err(err) => {
            stats.record_error(err.to_string());
            // Re-buffer for the next tick; the cap bounds the retry window.
            buffer.extend(items);
            if buffer.len() > MAX_RETRY_BUFFER {
                let excess = buffer.len() - MAX_RETRY_BUFFER;
                buffer.drain(..excess);
                tracing::warn!(excess, "reading retry buffer full; dropped oldest rows");
            }
            Err(err.into())
        }
    }
}

/// Time-windowed retention replaces the unbounded in-memory telemetry
/// array of older revisions: rows older than the configured window are
/// purged on an interval tick.
pub struct ReadingRetentionService {
    pool: PgPool,
    retention_days: u32,
    poll_interval: Duration,
}

impl ReadingRetentionService {
    pub fn new(pool: PgPool, retention_days: u32, poll_interval_seconds: u64) -> Self {
        Self {
            pool,
            retention_days: retention_days.max(1),
            poll_interval: Duration::from_secs(poll_interval_seconds.max(60)),
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match purge_expired(&self.pool, self.retention_days).await {
                            Ok(purged) if purged > 0 => {
                                tracing::info!(purged, "purged expired readings");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "reading retention tick failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

async fn purge_expired(pool: &PgPool, retention_days: u32) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let result = sqlx::query("DELETE FROM readings WHERE observed_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::evaluator::{
        evaluate, Measurements, SensorSample, Thresholds,
    };
    use chrono::TimeZone;

    fn reading_at(device_id: &str, observed_at: DateTime<Utc>, sewage: f64) -> EvaluatedReading {
        let sample = SensorSample {
            device_id: device_id.to_string(),
            observed_at,
            measurements: Measurements {
                sewage_level: sewage,
                methane_level: 100.0,
                flow_rate: 10.0,
                battery_level: 90.0,
                temperature: Some(18.0),
                humidity: None,
            },
        };
        evaluate(&sample, &Thresholds::default())
    }

    #[test]
    fn latest_cache_tracks_newest_reading_per_device() {
        let cache = LatestCache::default();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::minutes(1);

        cache.update(&reading_at("MH001", t0, 50.0));
        cache.update(&reading_at("MH001", t1, 95.0));

        let latest = cache.latest("MH001").expect("cached reading");
        assert_eq!(latest.sample.observed_at, t1);
        assert_eq!(latest.sample.measurements.sewage_level, 95.0);
    }

    #[test]
    fn late_out_of_order_sample_does_not_roll_cache_backwards() {
        let cache = LatestCache::default();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::minutes(1);

        cache.update(&reading_at("MH001", t1, 95.0));
        cache.update(&reading_at("MH001", t0, 50.0));

        let latest = cache.latest("MH001").expect("cached reading");
        assert_eq!(latest.sample.observed_at, t1);
    }

    #[test]
    fn snapshot_returns_one_entry_per_device_in_stable_order() {
        let cache = LatestCache::default();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        cache.update(&reading_at("MH002", t0, 50.0));
        cache.update(&reading_at("MH001", t0, 60.0));
        cache.update(&reading_at("MH001", t0 + chrono::Duration::minutes(1), 70.0));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].sample.device_id, "MH001");
        assert_eq!(snapshot[1].sample.device_id, "MH002");
        assert_eq!(snapshot[0].sample.measurements.sewage_level, 70.0);
    }

    #[test]
    fn reading_row_carries_the_derived_status() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let row = ReadingRow::from(&reading_at("MH001", t0, 95.0));
        assert_eq!(row.status, "critical");
        assert_eq!(row.temperature, Some(18.0));
        assert_eq!(row.humidity, None);
    }
}
