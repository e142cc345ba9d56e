use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide fallback thresholds, used whenever a device has no
/// per-device override for a given bound.
pub const DEFAULT_MAX_DISTANCE_CM: f64 = 90.0;
pub const DEFAULT_MAX_GAS_PPM: f64 = 1000.0;
pub const DEFAULT_MIN_FLOW_LPS: f64 = 3.0;
pub const DEFAULT_MIN_BATTERY_PERCENT: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SewageHigh,
    GasLeak,
    Blockage,
    LowBattery,
}

impl AlertType {
    pub const ALL: [AlertType; 4] = [
        AlertType::SewageHigh,
        AlertType::GasLeak,
        AlertType::Blockage,
        AlertType::LowBattery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SewageHigh => "sewage_high",
            Self::GasLeak => "gas_leak",
            Self::Blockage => "blockage",
            Self::LowBattery => "low_battery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "sewage_high" => Some(Self::SewageHigh),
            "gas_leak" => Some(Self::GasLeak),
            "blockage" => Some(Self::Blockage),
            "low_battery" => Some(Self::LowBattery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    Normal,
    Critical,
}

impl ReadingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Critical => "critical",
        }
    }
}

/// One normalized telemetry observation. Measurement values are always
/// finite; the ingest boundary rejects anything else before a sample is
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Measurements {
    pub sewage_level: f64,
    pub methane_level: f64,
    pub flow_rate: f64,
    pub battery_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub measurements: Measurements,
}

/// Per-device threshold snapshot in effect at receipt time. Each bound
/// falls back to the system default when the device row leaves it null.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub max_distance: f64,
    pub max_gas: f64,
    pub min_flow: f64,
    pub min_battery: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE_CM,
            max_gas: DEFAULT_MAX_GAS_PPM,
            min_flow: DEFAULT_MIN_FLOW_LPS,
            min_battery: DEFAULT_MIN_BATTERY_PERCENT,
        }
    }
}

impl Thresholds {
    /// Builds a snapshot from nullable per-device columns, defaulting any
    /// missing or non-finite bound.
    pub fn from_partial(
        max_distance: Option<f64>,
        max_gas: Option<f64>,
        min_flow: Option<f64>,
        min_battery: Option<f64>,
    ) -> Self {
        let defaults = Self::default();
        let pick = |value: Option<f64>, fallback: f64| match value {
            Some(v) if v.is_finite() => v,
            _ => fallback,
        };
        Self {
            max_distance: pick(max_distance, defaults.max_distance),
            max_gas: pick(max_gas, defaults.max_gas),
            min_flow: pick(min_flow, defaults.min_flow),
            min_battery: pick(min_battery, defaults.min_battery),
        }
    }
}

/// A sample annotated with its derived classification. Never persisted on
/// its own; recomputable from the sample plus the thresholds in effect.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedReading {
    #[serde(flatten)]
    pub sample: SensorSample,
    pub status: ReadingStatus,
    pub alert_types: Vec<AlertType>,
}

/// Classifies a sample against a threshold snapshot. Pure and total: every
/// well-typed input evaluates, rules fire independently, and `status` is
/// `critical` exactly when at least one rule fired.
pub fn evaluate(sample: &SensorSample, thresholds: &Thresholds) -> EvaluatedReading {
    let m = &sample.measurements;
    let mut alert_types = Vec::new();

    if m.sewage_level > thresholds.max_distance {
        alert_types.push(AlertType::SewageHigh);
    }
    if m.methane_level > thresholds.max_gas {
        alert_types.push(AlertType::GasLeak);
    }
    if m.flow_rate < thresholds.min_flow {
        alert_types.push(AlertType::Blockage);
    }
    if m.battery_level < thresholds.min_battery {
        alert_types.push(AlertType::LowBattery);
    }

    let status = if alert_types.is_empty() {
        ReadingStatus::Normal
    } else {
        ReadingStatus::Critical
    };

    EvaluatedReading {
        sample: sample.clone(),
        status,
        alert_types,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(sewage: f64, methane: f64, flow: f64, battery: f64) -> SensorSample {
        SensorSample {
            device_id: "MH001".to_string(),
            observed_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap(),
            measurements: Measurements {
                sewage_level: sewage,
                methane_level: methane,
                flow_rate: flow,
                battery_level: battery,
                temperature: None,
                humidity: None,
            },
        }
    }

    #[test]
    fn sewage_over_ceiling_is_critical_with_single_type() {
        let thresholds = Thresholds {
            max_distance: 90.0,
            max_gas: 1000.0,
            min_flow: 3.0,
            min_battery: 70.0,
        };
        let reading = evaluate(&sample(95.0, 200.0, 5.0, 80.0), &thresholds);
        assert_eq!(reading.status, ReadingStatus::Critical);
        assert_eq!(reading.alert_types, vec![AlertType::SewageHigh]);
    }

    #[test]
    fn low_battery_fires_regardless_of_other_measurements() {
        let reading = evaluate(&sample(10.0, 10.0, 50.0, 65.0), &Thresholds::default());
        assert!(reading.alert_types.contains(&AlertType::LowBattery));
        assert_eq!(reading.status, ReadingStatus::Critical);
    }

    #[test]
    fn rules_fire_independently_and_may_stack() {
        let reading = evaluate(&sample(120.0, 1500.0, 1.0, 10.0), &Thresholds::default());
        assert_eq!(reading.alert_types.len(), 4);
        assert_eq!(reading.status, ReadingStatus::Critical);
    }

    #[test]
    fn status_is_critical_iff_alert_types_nonempty() {
        let cases = [
            sample(10.0, 10.0, 50.0, 90.0),
            sample(95.0, 10.0, 50.0, 90.0),
            sample(10.0, 2000.0, 50.0, 90.0),
            sample(10.0, 10.0, 1.0, 90.0),
            sample(10.0, 10.0, 50.0, 5.0),
        ];
        for s in &cases {
            let reading = evaluate(s, &Thresholds::default());
            assert_eq!(
                reading.status == ReadingStatus::Critical,
                !reading.alert_types.is_empty()
            );
        }
    }

    #[test]
    fn evaluation_is_deterministic() {
        let s = sample(95.0, 1100.0, 2.0, 50.0);
        let thresholds = Thresholds::default();
        let first = evaluate(&s, &thresholds);
        let second = evaluate(&s, &thresholds);
        assert_eq!(first.status, second.status);
        assert_eq!(first.alert_types, second.alert_types);
    }

    #[test]
    fn partial_thresholds_fall_back_to_defaults() {
        let thresholds = Thresholds::from_partial(Some(120.0), None, Some(f64::NAN), None);
        assert_eq!(thresholds.max_distance, 120.0);
        assert_eq!(thresholds.max_gas, DEFAULT_MAX_GAS_PPM);
        assert_eq!(thresholds.min_flow, DEFAULT_MIN_FLOW_LPS);
        assert_eq!(thresholds.min_battery, DEFAULT_MIN_BATTERY_PERCENT);
    }

    #[test]
    fn boundary_values_do_not_trigger() {
        let thresholds = Thresholds::default();
        let reading = evaluate(&sample(90.0, 1000.0, 3.0, 70.0), &thresholds);
        assert!(reading.alert_types.is_empty());
        assert_eq!(reading.status, ReadingStatus::Normal);
    }
}
