//! Counter and gauge types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two metric shapes the storage engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Accumulating metric written via increments.
    Counter,
    /// Point-in-time metric written via overwrites.
    Gauge,
}

impl MetricKind {
    /// Returns all metric kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Counter, Self::Gauge]
    }

    /// Returns the kind as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }

    /// Parses a kind from a string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monotonic counter: the running sum of every delta applied under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Metric name.
    pub name: String,
    /// Accumulated value.
    pub value: i64,
}

impl Counter {
    /// Creates a new counter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A gauge: the most recently written value under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    /// Metric name.
    pub name: String,
    /// Last written value.
    pub value: f64,
}

impl Gauge {
    /// Creates a new gauge.
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in MetricKind::all() {
            assert_eq!(MetricKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(MetricKind::parse("GAUGE"), Some(MetricKind::Gauge));
        assert_eq!(MetricKind::parse("histogram"), None);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&MetricKind::Counter).unwrap_or_default();
        assert_eq!(json, "\"counter\"");
    }
}
