//! Typed trigger parameters.
//!
//! Parameters carry an explicit type tag both in memory and on the wire, so
//! dispatch is a match over a closed enum rather than runtime type
//! inspection.

use serde::{Deserialize, Serialize};

/// A typed parameter value. The closed set of types supported by the
/// replication wire format: 32-bit int, 32/64-bit float, UTF-8 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int32(i32),
    Float32(f32),
    Float64(f64),
    Str(String),
}

impl ParamValue {
    /// Best-effort numeric view, used by DSP code that treats every
    /// parameter as a scalar.
    pub fn to_f32(&self) -> f32 {
        match self {
            ParamValue::Int32(v) => *v as f32,
            ParamValue::Float32(v) => *v,
            ParamValue::Float64(v) => *v as f32,
            ParamValue::Str(_) => 0.0,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int32(_) => "int32",
            ParamValue::Float32(_) => "float32",
            ParamValue::Float64(_) => "float64",
            ParamValue::Str(_) => "string",
        }
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int32(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float32(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float64(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// A named trigger parameter. The address is stable per voice type and is
/// used verbatim as the trailing segment of per-voice parameter messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerParam {
    pub addr: String,
    pub value: ParamValue,
}

impl TriggerParam {
    pub fn new(addr: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            addr: addr.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_f32_covers_all_variants() {
        assert_eq!(ParamValue::Int32(3).to_f32(), 3.0);
        assert_eq!(ParamValue::Float32(1.5).to_f32(), 1.5);
        assert_eq!(ParamValue::Float64(2.5).to_f32(), 2.5);
        assert_eq!(ParamValue::Str("x".into()).to_f32(), 0.0);
    }
}
