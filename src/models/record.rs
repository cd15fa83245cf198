//! Dump-log record format.
//!
//! One JSON object per line:
//!
//! ```text
//! {"type":"counter","name":"requests_total","value":5}
//! {"type":"gauge","name":"cpu_load","value":0.42}
//! ```
//!
//! Counter records carry the applied delta, not the running total, so replaying a log
//! re-accumulates the counter. Gauge records carry the written value.
//!
//! JSON numbers are untyped, so decoding goes through [`serde_json::Value`] and
//! coerces explicitly: a counter value must be an integer that fits `i64`, a gauge value
//! may be any finite number.

use super::MetricKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest `f64` magnitude that still converts losslessly into the `i64` range.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// A single write projected into the dump log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PersistedRecord {
    /// A counter increment.
    Counter {
        /// Metric name.
        name: String,
        /// Applied delta.
        value: i64,
    },
    /// A gauge write.
    Gauge {
        /// Metric name.
        name: String,
        /// Written value.
        value: f64,
    },
}

/// Wire shape used while decoding, before the value is coerced.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    value: Value,
}

impl PersistedRecord {
    /// Creates a counter record.
    #[must_use]
    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self::Counter {
            name: name.into(),
            value: delta,
        }
    }

    /// Creates a gauge record.
    #[must_use]
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::Gauge {
            name: name.into(),
            value,
        }
    }

    /// Returns the metric kind.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Gauge { .. } => MetricKind::Gauge,
        }
    }

    /// Returns the metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Counter { name, .. } | Self::Gauge { name, .. } => name,
        }
    }

    /// Appends the record and a trailing newline to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailure`] if the record cannot be encoded (for
    /// example a non-finite gauge value).
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        if let Self::Gauge { value, .. } = self {
            if !value.is_finite() {
                return Err(Error::SerializationFailure {
                    operation: "encode_record".to_string(),
                    cause: format!("gauge '{}' has non-finite value {value}", self.name()),
                });
            }
        }
        serde_json::to_writer(&mut *buf, self).map_err(|e| Error::SerializationFailure {
            operation: "encode_record".to_string(),
            cause: e.to_string(),
        })?;
        buf.push(b'\n');
        Ok(())
    }

    /// Decodes a single log line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailure`] for malformed JSON, an unknown `type`,
    /// or a value that does not coerce to the record's numeric type.
    pub fn decode_line(line: &str) -> Result<Self> {
        let raw: RawRecord =
            serde_json::from_str(line).map_err(|e| Error::SerializationFailure {
                operation: "decode_record".to_string(),
                cause: e.to_string(),
            })?;

        match MetricKind::parse(&raw.kind) {
            Some(MetricKind::Counter) => Ok(Self::Counter {
                value: coerce_counter_value(&raw.value)?,
                name: raw.name,
            }),
            Some(MetricKind::Gauge) => Ok(Self::Gauge {
                value: coerce_gauge_value(&raw.value)?,
                name: raw.name,
            }),
            None => Err(Error::SerializationFailure {
                operation: "decode_record".to_string(),
                cause: format!("unknown metric type '{}'", raw.kind),
            }),
        }
    }
}

/// Coerces an untyped JSON number into a counter delta.
///
/// Accepts integers in the `i64` range and floats with no fractional part inside that
/// range. Everything else is rejected rather than truncated.
///
/// # Errors
///
/// Returns [`Error::SerializationFailure`] if the value is not an integral number that
/// fits in `i64`.
#[allow(clippy::cast_possible_truncation)]
pub fn coerce_counter_value(value: &Value) -> Result<i64> {
    if let Some(v) = value.as_i64() {
        return Ok(v);
    }
    let fail = |cause: String| Error::SerializationFailure {
        operation: "coerce_counter_value".to_string(),
        cause,
    };
    if value.is_u64() {
        return Err(fail(format!("counter value {value} overflows i64")));
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f) => {
            Ok(f as i64)
        },
        Some(f) => Err(fail(format!("counter value {f} is not an i64 integer"))),
        None => Err(fail(format!("counter value {value} is not a number"))),
    }
}

/// Coerces an untyped JSON number into a gauge value.
///
/// # Errors
///
/// Returns [`Error::SerializationFailure`] if the value is not a number.
pub fn coerce_gauge_value(value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| Error::SerializationFailure {
        operation: "coerce_gauge_value".to_string(),
        cause: format!("gauge value {value} is not a number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn test_encode_counter_line() {
        let mut buf = Vec::new();
        PersistedRecord::counter("requests_total", 5)
            .encode_into(&mut buf)
            .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"type\":\"counter\",\"name\":\"requests_total\",\"value\":5}\n"
        );
    }

    #[test]
    fn test_encode_rejects_nan_gauge() {
        let mut buf = Vec::new();
        let err = PersistedRecord::gauge("x", f64::NAN)
            .encode_into(&mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::SerializationFailure { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_counter_stays_integral() {
        let record =
            PersistedRecord::decode_line(r#"{"type":"counter","name":"hits","value":3}"#).unwrap();
        assert_eq!(record, PersistedRecord::counter("hits", 3));
    }

    #[test]
    fn test_decode_gauge_from_integer_literal() {
        let record =
            PersistedRecord::decode_line(r#"{"type":"gauge","name":"load","value":2}"#).unwrap();
        assert_eq!(record, PersistedRecord::gauge("load", 2.0));
    }

    #[test_case(13_909_224_690_751_716_107 ; "last digit sensitive")]
    #[test_case(0x3FB9_9999_9999_999A ; "one tenth")]
    #[test_case(0x0000_0000_0000_0001 ; "smallest subnormal")]
    #[test_case(0x7FEF_FFFF_FFFF_FFFF ; "largest finite")]
    fn test_gauge_line_keeps_exact_bits(bits: u64) {
        let value = f64::from_bits(bits);
        let mut buf = Vec::new();
        PersistedRecord::gauge("a", value).encode_into(&mut buf).unwrap();
        let line = String::from_utf8(buf).unwrap();

        let decoded = PersistedRecord::decode_line(line.trim_end()).unwrap();
        assert!(
            matches!(decoded, PersistedRecord::Gauge { value, .. } if value.to_bits() == bits),
            "line: {line}, decoded: {decoded:?}"
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = PersistedRecord::decode_line(r#"{"type":"histogram","name":"h","value":1}"#)
            .unwrap_err();
        assert!(err.to_string().contains("histogram"));
    }

    #[test]
    fn test_decode_missing_field() {
        let err = PersistedRecord::decode_line(r#"{"type":"gauge","value":1}"#).unwrap_err();
        assert!(matches!(err, Error::SerializationFailure { .. }));
    }

    #[test_case(json!(7), Some(7) ; "plain integer")]
    #[test_case(json!(-12), Some(-12) ; "negative integer")]
    #[test_case(json!(4.0), Some(4) ; "integral float")]
    #[test_case(json!(4.5), None ; "fractional float")]
    #[test_case(json!(1e300), None ; "float out of range")]
    #[test_case(json!(u64::MAX), None ; "u64 overflow")]
    #[test_case(json!("5"), None ; "string")]
    #[test_case(json!(null), None ; "null")]
    fn test_coerce_counter_value(value: Value, expected: Option<i64>) {
        assert_eq!(coerce_counter_value(&value).ok(), expected);
    }

    #[test_case(json!(0.5), Some(0.5) ; "float")]
    #[test_case(json!(3), Some(3.0) ; "integer")]
    #[test_case(json!(true), None ; "bool")]
    #[test_case(json!([1]), None ; "array")]
    fn test_coerce_gauge_value(value: Value, expected: Option<f64>) {
        assert_eq!(coerce_gauge_value(&value).ok(), expected);
    }
}
