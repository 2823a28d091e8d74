// ── Sample value coercion ──

use serde::Serialize;
use serde_json::Value;

use telemux_api::telemetry::AggregationType;

/// A sample after coercion.
///
/// Aggregated series always hold numbers. Series with no aggregation keep
/// non-numeric values (status strings, booleans) in their raw form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Raw(Value),
}

impl SampleValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Raw(_) => None,
        }
    }

    /// JSON form of the value. Non-finite numbers become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Raw(v) => v.clone(),
        }
    }
}

/// `true` if `s` holds a finite decimal number, ignoring surrounding
/// whitespace. `"1e5"` and `" 3 "` qualify; `"Infinity"` and `"NaN"` do not.
pub fn is_numeric_str(s: &str) -> bool {
    let trimmed = s.trim();
    !trimmed.is_empty() && trimmed.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Numeric view of an arbitrary JSON value, used for aggregated series.
fn to_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Null => 0.0,
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Coerce a wire value for the given aggregation.
pub fn coerce(value: &Value, agg: AggregationType) -> SampleValue {
    if agg != AggregationType::None {
        return SampleValue::Number(to_number(value));
    }
    match value {
        Value::Number(n) => n
            .as_f64()
            .map_or_else(|| SampleValue::Raw(value.clone()), SampleValue::Number),
        Value::String(s) if is_numeric_str(s) => SampleValue::Number(to_number(value)),
        _ => SampleValue::Raw(value.clone()),
    }
}
