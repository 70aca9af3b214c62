use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metric kind, which decides how a stored value evolves.
///
/// # Examples
///
/// ```
/// use observer_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("histogram".parse::<MetricKind>().is_err());
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last written value wins.
    Gauge,
    /// Every delta is added to the running total.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric type '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for MetricKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// A metric as it travels on the wire.
///
/// Exactly one of `value`/`delta` is set, selected by `kind`. The absent one
/// is omitted from JSON rather than written as `null` or zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Metric {
    /// Metric name.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Counter increment (or cumulative total in server responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    /// Gauge reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// The validated payload of a [`Metric`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricPayload {
    Gauge(f64),
    Counter(i64),
}

/// A metric that breaks the one-payload-per-kind rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidMetric {
    #[error("metric name is empty")]
    EmptyName,
    #[error("{kind} metric '{id}' must carry exactly one {expected} field")]
    Payload {
        id: String,
        kind: MetricKind,
        expected: &'static str,
    },
    #[error("gauge metric '{id}' has a non-finite value")]
    NonFinite { id: String },
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    /// Builds a metric from a kind and payload, e.g. after a storage fold.
    pub fn from_payload(id: impl Into<String>, payload: MetricPayload) -> Self {
        match payload {
            MetricPayload::Gauge(v) => Self::gauge(id, v),
            MetricPayload::Counter(d) => Self::counter(id, d),
        }
    }

    /// Validates the payload against the kind.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMetric`] when the name is empty, when the field that
    /// matches the kind is missing, when the other field is also present, or
    /// when a gauge value is NaN or infinite.
    pub fn payload(&self) -> Result<MetricPayload, InvalidMetric> {
        if self.id.is_empty() {
            return Err(InvalidMetric::EmptyName);
        }
        match (self.kind, self.value, self.delta) {
            (MetricKind::Gauge, Some(v), None) if v.is_finite() => Ok(MetricPayload::Gauge(v)),
            (MetricKind::Gauge, Some(_), None) => Err(InvalidMetric::NonFinite {
                id: self.id.clone(),
            }),
            (MetricKind::Counter, None, Some(d)) => Ok(MetricPayload::Counter(d)),
            (kind, _, _) => Err(InvalidMetric::Payload {
                id: self.id.clone(),
                kind,
                expected: match kind {
                    MetricKind::Gauge => "value",
                    MetricKind::Counter => "delta",
                },
            }),
        }
    }

    /// Plain-text rendering of the payload, as served by `GET /value/...`.
    pub fn value_text(&self) -> Option<String> {
        match self.kind {
            MetricKind::Gauge => self.value.map(|v| v.to_string()),
            MetricKind::Counter => self.delta.map(|d| d.to_string()),
        }
    }
}

/// Lookup request body for `POST /value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MetricQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}
