//! Data models for the alert automation pipeline.
//!
//! Readings arrive as loosely typed [`RawReading`] payloads from feeds and the
//! HTTP surface, and are converted into validated [`Reading`] values before
//! they reach the evaluator. Rules, fired alerts and automation log entries
//! mirror the rows persisted by the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InvalidReadingError;

// ---

/// The kind of measurement carried by a reading and matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    RainfallMm,
    TemperatureC,
    WindKmh,
    EarthquakeMagnitude,
}

impl MetricType {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::RainfallMm => "rainfall_mm",
            MetricType::TemperatureC => "temperature_c",
            MetricType::WindKmh => "wind_kmh",
            MetricType::EarthquakeMagnitude => "earthquake_magnitude",
        }
    }

    /// Physically plausible `[min, max]` range for a reading of this metric.
    pub fn valid_range(&self) -> (f64, f64) {
        match self {
            MetricType::RainfallMm => (0.0, 2000.0),
            MetricType::TemperatureC => (-90.0, 60.0),
            MetricType::WindKmh => (0.0, 500.0),
            MetricType::EarthquakeMagnitude => (0.0, 10.0),
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricType::RainfallMm => "mm",
            MetricType::TemperatureC => "°C",
            MetricType::WindKmh => "km/h",
            MetricType::EarthquakeMagnitude => "M",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rainfall_mm" => Ok(MetricType::RainfallMm),
            "temperature_c" => Ok(MetricType::TemperatureC),
            "wind_kmh" => Ok(MetricType::WindKmh),
            "earthquake_magnitude" => Ok(MetricType::EarthquakeMagnitude),
            _ => Err(format!("unknown metric type: {s}")),
        }
    }
}

/// How a rule compares a reading value against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => "gt",
            Comparator::Gte => "gte",
            Comparator::Lt => "lt",
            Comparator::Lte => "lte",
            Comparator::Between => "between",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gt" | "greater_than" => Ok(Comparator::Gt),
            "gte" | "greater_equal" => Ok(Comparator::Gte),
            "lt" | "less_than" => Ok(Comparator::Lt),
            "lte" | "less_equal" => Ok(Comparator::Lte),
            "between" => Ok(Comparator::Between),
            _ => Err(format!("unknown comparator: {s}")),
        }
    }
}

/// A single threshold value, or a half-open band `[low, high)`.
///
/// A band without `high` is unbounded above, e.g. magnitude `[7.0, +inf)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Value(f64),
    Band { low: f64, high: Option<f64> },
}

impl Threshold {
    /// Lower edge used to order rules of the same metric.
    pub fn sort_key(&self) -> f64 {
        match self {
            Threshold::Value(v) => *v,
            Threshold::Band { low, .. } => *low,
        }
    }

    pub fn is_band(&self) -> bool {
        matches!(self, Threshold::Band { .. })
    }

    pub fn contains(&self, value: f64) -> bool {
        match self {
            Threshold::Band { low, high } => value >= *low && high.map_or(true, |h| value < h),
            Threshold::Value(_) => false,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Value(v) => write!(f, "{v}"),
            Threshold::Band {
                low,
                high: Some(high),
            } => write!(f, "[{low}, {high})"),
            Threshold::Band { low, high: None } => write!(f, "[{low}, +inf)"),
        }
    }
}

/// Alert severity, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "moderate" => Ok(Severity::Moderate),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// A configured alert rule as stored in `alert_rules`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    // ---
    pub id: i64,
    pub metric_type: MetricType,
    pub comparator: Comparator,
    pub threshold: Threshold,
    pub severity: Severity,
    /// Title template; see [`render_title`] for the supported placeholders.
    pub title: String,
    pub is_active: bool,
    /// Per-rule cooldown override; falls back to the global default.
    pub cooldown_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    // ---
    /// Whether `value` satisfies this rule's condition.
    ///
    /// Rules whose comparator and threshold shape disagree never match; the
    /// store rejects such definitions on upsert.
    pub fn matches(&self, value: f64) -> bool {
        // ---
        match (self.comparator, self.threshold) {
            (Comparator::Gt, Threshold::Value(t)) => value > t,
            (Comparator::Gte, Threshold::Value(t)) => value >= t,
            (Comparator::Lt, Threshold::Value(t)) => value < t,
            (Comparator::Lte, Threshold::Value(t)) => value <= t,
            (Comparator::Between, band @ Threshold::Band { .. }) => band.contains(value),
            _ => false,
        }
    }

    pub fn is_band(&self) -> bool {
        self.comparator == Comparator::Between
    }
}

fn default_active() -> bool {
    true
}

/// Rule definition submitted by an administrator.
///
/// Without an `id` the draft creates a new rule; with one it replaces the
/// definition of that rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    // ---
    #[serde(default)]
    pub id: Option<i64>,
    pub metric_type: MetricType,
    pub comparator: Comparator,
    pub threshold: Threshold,
    pub severity: Severity,
    pub title: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
}

/// Geographic position of a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
}

/// Reading as received from a feed or the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReading {
    // ---
    pub metric_type: String,
    pub value: f64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Validated reading handed to the evaluator. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    // ---
    pub metric_type: MetricType,
    pub value: f64,
    pub location: Location,
    pub observed_at: DateTime<Utc>,
}

impl RawReading {
    // ---
    /// Validate and normalize into a [`Reading`].
    ///
    /// `observed_at` defaults to the current time when the feed omits it.
    pub fn to_reading(&self) -> Result<Reading, InvalidReadingError> {
        // ---
        let metric_type: MetricType = self
            .metric_type
            .parse()
            .map_err(|_| InvalidReadingError::UnknownMetric(self.metric_type.clone()))?;

        if !self.value.is_finite() {
            return Err(InvalidReadingError::NonFinite {
                metric: metric_type,
            });
        }

        let (min, max) = metric_type.valid_range();
        if self.value < min || self.value > max {
            return Err(InvalidReadingError::OutOfRange {
                metric: metric_type,
                value: self.value,
                min,
                max,
            });
        }

        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if !lat_ok || !lon_ok {
            return Err(InvalidReadingError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }

        let area = self
            .area
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from);

        Ok(Reading {
            metric_type,
            value: self.value,
            location: Location {
                latitude: self.latitude,
                longitude: self.longitude,
                area,
            },
            observed_at: self.observed_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Outcome recorded for every evaluation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Fired,
    Suppressed,
    NoMatch,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Fired => "fired",
            Decision::Suppressed => "suppressed",
            Decision::NoMatch => "no_match",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fired" => Ok(Decision::Fired),
            "suppressed" => Ok(Decision::Suppressed),
            "no_match" => Ok(Decision::NoMatch),
            _ => Err(format!("unknown decision: {s}")),
        }
    }
}

/// An alert produced by a non-suppressed rule match. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredAlert {
    // ---
    pub id: Uuid,
    pub rule_id: i64,
    pub location: Location,
    pub severity: Severity,
    pub title: String,
    pub value: f64,
    pub fired_at: DateTime<Utc>,
    pub suppressed_until: DateTime<Utc>,
}

/// Audit record written once per evaluation attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationLogEntry {
    // ---
    pub id: Uuid,
    pub rule_id: Option<i64>,
    pub alert_id: Option<Uuid>,
    pub reading_snapshot: serde_json::Value,
    pub decision: Decision,
    pub created_at: DateTime<Utc>,
}

/// Result of matching one reading against the active rules.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub matched_rule: Option<Rule>,
    pub severity: Option<Severity>,
}

impl EvaluationResult {
    pub fn no_match() -> Self {
        Self {
            matched_rule: None,
            severity: None,
        }
    }

    pub fn matched(rule: Rule) -> Self {
        Self {
            severity: Some(rule.severity),
            matched_rule: Some(rule),
        }
    }
}

/// Render a rule title template for a reading.
///
/// Supported placeholders: `{value}`, `{metric}`, `{area}`, `{severity}`.
/// `{area}` falls back to the coordinates when the reading has no named area.
pub fn render_title(template: &str, rule: &Rule, reading: &Reading) -> String {
    // ---
    let area = match &reading.location.area {
        Some(area) => area.clone(),
        None => format!(
            "{:.3}, {:.3}",
            reading.location.latitude, reading.location.longitude
        ),
    };

    template
        .replace(
            "{value}",
            &format!("{}{}", reading.value, reading.metric_type.unit()),
        )
        .replace("{metric}", reading.metric_type.as_str())
        .replace("{area}", &area)
        .replace("{severity}", rule.severity.as_str())
}
