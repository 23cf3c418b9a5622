//! Pure validation rules applied to every incoming sample.
//!
//! The composite [`validate`] runs the checks in a fixed order and
//! short-circuits on the first failure: active tag, declared type,
//! enumerated values, numeric range, then quality. Enumerated values and
//! ranges are mutually exclusive by data shape; quality is checked last so
//! a bad-quality sample that is also invalid reports the more specific
//! reason.

use thiserror::Error;

use crate::model::{LogicalType, OpcQuality, Tag, Value};

/// Reason a sample was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    /// The tag is flagged inactive in the metadata store.
    #[error("tag is inactive")]
    InactiveTag,

    /// The runtime value does not match the declared logical type.
    #[error("type mismatch: declared {declared}, received {received}")]
    TypeMismatch {
        declared: LogicalType,
        received: &'static str,
    },

    /// The rendered value is not in the enumerated allowed list.
    #[error("value {0:?} is not in the allowed list")]
    NotAllowed(String),

    /// The numeric value falls outside the inclusive min/max bounds.
    #[error("value {value} outside range [{min:?}, {max:?}]")]
    OutOfRange {
        value: String,
        min: Option<f64>,
        max: Option<f64>,
    },

    /// The sample quality is not Good.
    #[error("bad quality: {0}")]
    BadQuality(OpcQuality),
}

/// Validate a sample's value and quality against its tag definition.
pub fn validate(tag: &Tag, value: &Value, quality: OpcQuality) -> Result<(), Rejection> {
    if !tag.is_active {
        return Err(Rejection::InactiveTag);
    }

    check_type(tag.logical_type(), value)?;

    if let Some(allowed) = tag.allowed_values_list() {
        check_allowed(&allowed, value)?;
    } else if tag.min_value.is_some() || tag.max_value.is_some() {
        check_range(tag.min_value, tag.max_value, value)?;
    }

    if !quality.is_good() {
        return Err(Rejection::BadQuality(quality));
    }

    Ok(())
}

/// Declared-type check.
///
/// Signed and unsigned integer tags accept values of matching or narrower
/// width: the carried 64-bit value must fit the declared width. Unknown
/// declared types accept anything.
fn check_type(declared: LogicalType, value: &Value) -> Result<(), Rejection> {
    let ok = match (declared, value) {
        (LogicalType::Int16, Value::Int64(v)) => i16::try_from(*v).is_ok(),
        (LogicalType::Int32, Value::Int64(v)) => i32::try_from(*v).is_ok(),
        (LogicalType::Int64, Value::Int64(_)) => true,
        (LogicalType::UInt16, Value::UInt64(v)) => u16::try_from(*v).is_ok(),
        (LogicalType::UInt32, Value::UInt64(v)) => u32::try_from(*v).is_ok(),
        (LogicalType::UInt64, Value::UInt64(_)) => true,
        (LogicalType::Float, Value::Float64(v)) => {
            // Narrower float: the value must survive the f32 round trip.
            v.is_nan() || (*v as f32).is_finite() == v.is_finite()
        }
        (LogicalType::Double, Value::Float64(_)) => true,
        (LogicalType::Boolean, Value::Bool(_)) => true,
        (LogicalType::String, Value::Text(_)) => true,
        (LogicalType::Unknown, _) => true,
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(Rejection::TypeMismatch {
            declared,
            received: value.type_name(),
        })
    }
}

/// Enumerated-values check: rendered value compared case-insensitively.
fn check_allowed(allowed: &[&str], value: &Value) -> Result<(), Rejection> {
    let rendered = value.render();
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&rendered)) {
        Ok(())
    } else {
        Err(Rejection::NotAllowed(rendered))
    }
}

/// Inclusive range check; non-numeric values cannot satisfy a bound.
fn check_range(min: Option<f64>, max: Option<f64>, value: &Value) -> Result<(), Rejection> {
    let out_of_range = || Rejection::OutOfRange {
        value: value.render(),
        min,
        max,
    };

    match value.as_f64() {
        Some(v) if min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m) => Err(out_of_range()),
        Some(_) => Ok(()),
        None => Err(out_of_range()),
    }
}
