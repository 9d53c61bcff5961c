//! Tier-1 response: a tagged union of the value kinds the engine can return, plus an error code.
//!
//! A response with a non-zero `error_code` is an engine failure; the value then usually holds the
//! engine's message as a string. A void call answers with `ResponseValue::Object(None)`.
//! [`FromResponse`] turns a response into the typed value the caller asked for.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Arg;
use crate::error::BridgeError;
use crate::result::Result;

/// One bar of price history as produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MqlRates {
    /// Period start time, engine seconds.
    pub time: i64,
    /// Open price.
    pub open: f64,
    /// The highest price of the period.
    pub high: f64,
    /// The lowest price of the period.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Tick volume.
    pub tick_volume: i64,
    /// Spread.
    pub spread: i32,
    /// Trade volume.
    pub real_volume: i64,
}

/// Value carried by a [`Response`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ResponseValue {
    Object(Option<serde_json::Value>),
    Int(i32),
    Long(i64),
    ULong(u64),
    Double(f64),
    String(String),
    Bool(bool),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    List(Vec<Arg>),
    RatesArray(Vec<MqlRates>),
}

impl ResponseValue {
    fn kind(&self) -> &'static str {
        match self {
            ResponseValue::Object(_) => "object",
            ResponseValue::Int(_) => "int",
            ResponseValue::Long(_) => "long",
            ResponseValue::ULong(_) => "ulong",
            ResponseValue::Double(_) => "double",
            ResponseValue::String(_) => "string",
            ResponseValue::Bool(_) => "bool",
            ResponseValue::DoubleArray(_) => "double[]",
            ResponseValue::IntArray(_) => "int[]",
            ResponseValue::LongArray(_) => "long[]",
            ResponseValue::List(_) => "list",
            ResponseValue::RatesArray(_) => "rates[]",
        }
    }

    /// False when a double inside the value is NaN or infinite. JSON has no encoding for those.
    pub fn is_finite(&self) -> bool {
        match self {
            ResponseValue::Double(v) => v.is_finite(),
            ResponseValue::DoubleArray(values) => values.iter().all(|v| v.is_finite()),
            ResponseValue::RatesArray(rates) => rates
                .iter()
                .all(|r| [r.open, r.high, r.low, r.close].iter().all(|v| v.is_finite())),
            ResponseValue::List(args) => args.iter().all(|arg| match arg {
                Arg::Double(v) => v.is_finite(),
                Arg::DoubleArray(values) => values.iter().all(|v| v.is_finite()),
                _ => true,
            }),
            _ => true,
        }
    }
}

/// Engine answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// 0 on success, engine error code otherwise.
    pub error_code: i32,
    /// Returned value.
    pub value: ResponseValue,
}

impl Response {
    /// Successful response carrying `value`.
    pub fn ok(value: ResponseValue) -> Self {
        Response {
            error_code: 0,
            value,
        }
    }

    /// Successful response of a void call.
    pub fn void() -> Self {
        Response::ok(ResponseValue::Object(None))
    }

    /// Failed response; the message travels as the string value.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Response {
            error_code: code,
            value: ResponseValue::String(message.into()),
        }
    }

    /// Whether the engine reported success.
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    /// Rejects a response that cannot be encoded as JSON.
    pub fn ensure_finite(self) -> Result<Self> {
        if self.value.is_finite() {
            Ok(self)
        } else {
            Err(BridgeError::Protocol(format!(
                "{} response carries a non-finite double",
                self.value.kind()
            )))
        }
    }

    /// Converts into `T`, mapping a non-zero error code to [`BridgeError::Engine`].
    pub fn into_result<T: FromResponse>(self) -> Result<T> {
        if self.error_code != 0 {
            let message = match self.value {
                ResponseValue::String(message) => message,
                other => format!("{other:?}"),
            };
            return Err(BridgeError::Engine {
                code: self.error_code,
                message,
            });
        }
        T::from_value(self.value)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode = {}; {}", self.error_code, self.value.kind())
    }
}

/// Typed extraction from a response value.
pub trait FromResponse: Sized {
    /// Converts the value or reports a protocol error when the kind does not match.
    fn from_value(value: ResponseValue) -> Result<Self>;
}

fn mismatch<T>(expected: &str, got: &ResponseValue) -> Result<T> {
    Err(BridgeError::Protocol(format!(
        "expected {expected} response, got {}",
        got.kind()
    )))
}

impl FromResponse for () {
    fn from_value(_value: ResponseValue) -> Result<Self> {
        Ok(())
    }
}

impl FromResponse for ResponseValue {
    fn from_value(value: ResponseValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromResponse for i32 {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::Int(v) => Ok(v),
            ResponseValue::Object(None) => {
                Err(BridgeError::Protocol("null response for int".into()))
            }
            other => mismatch("int", &other),
        }
    }
}

impl FromResponse for i64 {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::Long(v) => Ok(v),
            ResponseValue::Int(v) => Ok(i64::from(v)),
            other => mismatch("long", &other),
        }
    }
}

impl FromResponse for u64 {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::ULong(v) => Ok(v),
            other => mismatch("ulong", &other),
        }
    }
}

impl FromResponse for f64 {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::Double(v) => Ok(v),
            other => mismatch("double", &other),
        }
    }
}

impl FromResponse for bool {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::Bool(v) => Ok(v),
            ResponseValue::Int(v) => Ok(v != 0),
            other => mismatch("bool", &other),
        }
    }
}

impl FromResponse for String {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::String(v) => Ok(v),
            ResponseValue::Object(None) => {
                Err(BridgeError::Protocol("null response for string".into()))
            }
            other => mismatch("string", &other),
        }
    }
}

impl FromResponse for Vec<f64> {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::DoubleArray(v) => Ok(v),
            other => mismatch("double[]", &other),
        }
    }
}

impl FromResponse for Vec<i32> {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::IntArray(v) => Ok(v),
            other => mismatch("int[]", &other),
        }
    }
}

impl FromResponse for Vec<i64> {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::LongArray(v) => Ok(v),
            other => mismatch("long[]", &other),
        }
    }
}

impl FromResponse for Vec<MqlRates> {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::RatesArray(v) => Ok(v),
            other => mismatch("rates[]", &other),
        }
    }
}

impl FromResponse for Vec<Arg> {
    fn from_value(value: ResponseValue) -> Result<Self> {
        match value {
            ResponseValue::List(v) => Ok(v),
            other => mismatch("list", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_doubles_are_rejected() {
        assert!(Response::ok(ResponseValue::Double(1.5)).ensure_finite().is_ok());
        let err = Response::ok(ResponseValue::Double(f64::NAN))
            .ensure_finite()
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(!ResponseValue::DoubleArray(vec![1.0, f64::INFINITY]).is_finite());
        assert!(!ResponseValue::List(vec![Arg::Double(f64::NEG_INFINITY)]).is_finite());
    }

    #[test]
    fn non_zero_code_becomes_engine_error() {
        let err = Response::error(4109, "trade is not allowed")
            .into_result::<f64>()
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(4109));
        assert!(err.to_string().contains("trade is not allowed"));
    }

    #[test]
    fn kind_mismatch_is_a_protocol_error() {
        let err = Response::ok(ResponseValue::String("x".into()))
            .into_result::<f64>()
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn null_value_for_string_is_a_protocol_error() {
        let err = Response::void().into_result::<String>().unwrap_err();
        assert!(err.is_protocol());
        Response::void().into_result::<()>().unwrap();
    }

    #[test]
    fn tagged_json_keeps_the_kind() {
        let response = Response::ok(ResponseValue::Long(7));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"type\":\"Long\""));
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_result::<i64>().unwrap(), 7);
    }
}
