use chrono::{DateTime, TimeZone, Utc};
use rumqttc::mqttbytes::v4::ConnectReturnCode;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::services::alerts::AlertManager;
use crate::services::evaluator::{evaluate, Measurements, SensorSample};
use crate::services::fanout::{RealtimeFanout, StreamEvent};
use crate::services::readings::{IngestStats, ReadingStore};
use crate::services::thresholds::ThresholdCatalog;

/// Rejection reasons at the parse/validate boundary. Everything past this
/// boundary operates on validated data and is failure-free apart from the
/// external storage and transport dependencies.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("missing device id")]
    MissingDeviceId,
    #[error("missing sensors block")]
    MissingSensors,
    #[error("measurement `{field}` is missing or not a finite number")]
    InvalidMeasurement { field: &'static str },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> WireTimestamp<'a> {
    fn to_datetime(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WireTimestamp::Str(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(received_at),
            WireTimestamp::Int(ms) => millis_to_dt(*ms).unwrap_or(received_at),
            WireTimestamp::Float(secs) => {
                millis_to_dt((*secs * 1000.0) as i64).unwrap_or(received_at)
            }
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    let secs = ms / 1000;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

#[derive(Debug, Deserialize)]
struct WireSensors {
    #[serde(rename = "sewageLevel")]
    sewage_level: Option<f64>,
    #[serde(rename = "methaneLevel")]
    methane_level: Option<f64>,
    #[serde(rename = "flowRate")]
    flow_rate: Option<f64>,
    #[serde(rename = "batteryLevel")]
    battery_level: Option<f64>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireTelemetry<'a> {
    #[serde(default, rename = "deviceId", borrow)]
    device_id: Option<&'a str>,
    #[serde(default, borrow)]
    timestamp: Option<WireTimestamp<'a>>,
    #[serde(default)]
    sensors: Option<WireSensors>,
}

fn required(value: Option<f64>, field: &'static str) -> Result<f64, ValidationError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(ValidationError::InvalidMeasurement { field }),
    }
}

fn optional(value: Option<f64>, field: &'static str) -> Result<Option<f64>, ValidationError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() => Ok(Some(v)),
        Some(_) => Err(ValidationError::InvalidMeasurement { field }),
    }
}

/// Parses and validates one telemetry payload into a normalized sample.
/// The device id comes from the topic when present, falling back to the
/// payload's `deviceId`; `observedAt` is stamped with the receipt time
/// when the source omits or garbles the timestamp.
pub fn parse_telemetry_payload(
    topic_device: Option<&str>,
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<SensorSample, ValidationError> {
    let telemetry: WireTelemetry = simd_json::from_slice(payload)
        .map_err(|err| ValidationError::Malformed(err.to_string()))?;

    let device_id = topic_device
        .or(telemetry.device_id)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ValidationError::MissingDeviceId)?
        .to_string();

    let sensors = telemetry.sensors.ok_or(ValidationError::MissingSensors)?;
    let measurements = Measurements {
        sewage_level: required(sensors.sewage_level, "sewageLevel")?,
        methane_level: required(sensors.methane_level, "methaneLevel")?,
        flow_rate: required(sensors.flow_rate, "flowRate")?,
        battery_level: required(sensors.battery_level, "batteryLevel")?,
        temperature: optional(sensors.temperature, "temperature")?,
        humidity: optional(sensors.humidity, "humidity")?,
    };

    let observed_at = telemetry
        .timestamp
        .as_ref()
        .map(|ts| ts.to_datetime(received_at))
        .unwrap_or(received_at);

    Ok(SensorSample {
        device_id,
        observed_at,
        measurements,
    })
}

/// Extracts the device id from `{prefix}/{deviceId}/telemetry`.
pub fn device_from_topic<'a>(topic_prefix: &str, topic: &'a str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == topic_prefix && parts[2] == "telemetry" {
        Some(parts[1]).filter(|value| !value.is_empty())
    } else {
        None
    }
}

/// Parse → validate → evaluate → persist → broadcast, one message at a
/// time. The whole sequence is one non-interruptible unit per message;
/// cancellation is only observed between messages.
pub struct IngestPipeline {
    thresholds: Arc<ThresholdCatalog>,
    store: Arc<ReadingStore>,
    alerts: Arc<AlertManager>,
    fanout: Arc<RealtimeFanout>,
    stats: Arc<IngestStats>,
}

impl IngestPipeline {
    pub fn new(
        thresholds: Arc<ThresholdCatalog>,
        store: Arc<ReadingStore>,
        alerts: Arc<AlertManager>,
        fanout: Arc<RealtimeFanout>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            thresholds,
            store,
            alerts,
            fanout,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Never propagates an error past the transport boundary: malformed
    /// messages are counted, logged to the data-quality log and dropped
    /// without a store write or a broadcast.
    pub async fn handle_message(
        &self,
        topic_device: Option<&str>,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) {
        let sample = match parse_telemetry_payload(topic_device, payload, received_at) {
            Ok(sample) => sample,
            Err(err) => {
                self.stats.record_invalid();
                tracing::warn!(
                    device = topic_device.unwrap_or("unknown"),
                    error = %err,
                    "dropped malformed telemetry payload"
                );
                return;
            }
        };

        // Nothing past this point awaits storage: thresholds come from the
        // cache, the append is write-behind, and alert transitions are
        // decided in memory and queued for their own writer.
        let thresholds = self.thresholds.effective(&sample.device_id);
        let reading = evaluate(&sample, &thresholds);

        self.store.append(&reading);
        let alert_events = self.alerts.on_reading(&reading).await;

        self.fanout.broadcast(StreamEvent::SensorData(reading));
        for event in alert_events {
            self.fanout.broadcast(event.into());
        }
    }
}

/// MQTT subscriber loop. Reconnects with backoff on transport errors and
/// exposes connectivity through the shared stats; stops ingesting as soon
/// as the cancellation token fires so shutdown can close subscriber
/// connections afterwards.
pub async fn run_listener(
    config: CoreConfig,
    pipeline: Arc<IngestPipeline>,
    cancel: CancellationToken,
) {
    let telemetry_filter = format!("{}/+/telemetry", config.mqtt_topic_prefix);
    let stats = pipeline.stats();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(10));
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        match client.subscribe(&telemetry_filter, QoS::AtLeastOnce).await {
            Ok(_) => {
                tracing::info!(topic = %telemetry_filter, "telemetry subscription requested");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to request telemetry subscription; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stats.set_mqtt_connected(false);
                    tracing::info!("telemetry subscription closed");
                    return;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(event) => {
                            note_transport_event(&stats, &event);
                            if let Event::Incoming(Incoming::Publish(publish)) = event {
                                let received_at = Utc::now();
                                let mut payload = publish.payload.to_vec();
                                let topic_device =
                                    device_from_topic(&config.mqtt_topic_prefix, &publish.topic);
                                pipeline
                                    .handle_message(topic_device, &mut payload, received_at)
                                    .await;
                            }
                        }
                        Err(err) => {
                            stats.set_mqtt_connected(false);
                            tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

/// Connectivity is reported only once the broker has accepted the session;
/// an enqueued subscribe request proves nothing.
fn note_transport_event(stats: &IngestStats, event: &Event) {
    if let Event::Incoming(Incoming::ConnAck(ack)) = event {
        if ack.code == ConnectReturnCode::Success {
            stats.set_mqtt_connected(true);
        }
    }
}
