//! Tier-2 structured requests.
//!
//! Operations whose parameters are too rich or too sparse for a flat [`Command`] are sent as a
//! self-describing JSON document: a `RequestType` discriminator plus kind-specific fields, with
//! absent optional fields omitted. The document is the single string argument of a command with
//! the reserved code [`MT_REQUEST`]; the engine answers with a serialized
//! [`StructuredResponse`] in a string response.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::{Arg, Command, MT_REQUEST, SessionHandle};
use crate::error::BridgeError;
use crate::result::Result;

/// Open a market or pending order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderSendRequest {
    /// Instrument name.
    pub symbol: String,
    /// Trade operation code.
    pub cmd: i32,
    /// Lots.
    pub volume: f64,
    /// Price; market price when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Maximum deviation in points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage: Option<i32>,
    /// Stop loss level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    /// Take profit level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    /// Order comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Expert magic number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<i32>,
    /// Pending order expiration, engine seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i32>,
    /// Arrow color, engine encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow_color: Option<i32>,
}

/// Close an order, fully or partially.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderCloseRequest {
    /// Order ticket.
    pub ticket: i32,
    /// Lots to close; everything when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lots: Option<f64>,
    /// Close price; market price when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Maximum deviation in points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slippage: Option<i32>,
    /// Arrow color, engine encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow_color: Option<i32>,
}

/// Close an order by an opposite one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderCloseByRequest {
    /// Order ticket.
    pub ticket: i32,
    /// Opposite order ticket.
    pub opposite: i32,
    /// Arrow color, engine encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow_color: Option<i32>,
}

/// Delete a pending order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderDeleteRequest {
    /// Order ticket.
    pub ticket: i32,
    /// Arrow color, engine encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow_color: Option<i32>,
}

/// Modify an open or pending order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderModifyRequest {
    /// Order ticket.
    pub ticket: i32,
    /// New open price (pending orders).
    pub price: f64,
    /// New stop loss level.
    pub stop_loss: f64,
    /// New take profit level.
    pub take_profit: f64,
    /// New expiration, engine seconds.
    pub expiration: i32,
    /// Arrow color, engine encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow_color: Option<i32>,
}

/// Read a double property of an instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SymbolInfoRequest {
    /// Instrument name.
    pub symbol_name: String,
    /// Property identifier.
    #[serde(rename = "PropID")]
    pub prop_id: i32,
}

/// Read an integer property of a price series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeriesInfoIntegerRequest {
    /// Instrument name.
    pub symbol_name: String,
    /// Timeframe in minutes.
    pub timeframe: i32,
    /// Property identifier.
    #[serde(rename = "PropID")]
    pub prop_id: i32,
}

/// Which slice of history a [`CopyRatesRequest`] selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyRatesType {
    /// `StartPos` + `Count`.
    #[default]
    FromPosition,
    /// `StartTime` + `Count`.
    FromTime,
    /// `StartTime` .. `StopTime`.
    TimeRange,
}

/// Copy price history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CopyRatesRequest {
    /// Instrument name.
    pub symbol_name: String,
    /// Timeframe in minutes.
    pub timeframe: i32,
    /// Selection mode.
    pub copy_rates_type: CopyRatesType,
    /// First bar index (0 = current bar).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_pos: Option<i32>,
    /// First bar time, engine seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i32>,
    /// Last bar time, engine seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<i32>,
    /// Number of bars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

impl CopyRatesRequest {
    /// `count` bars starting at bar index `start_pos`.
    pub fn from_position(symbol: &str, timeframe: i32, start_pos: i32, count: i32) -> Self {
        CopyRatesRequest {
            symbol_name: symbol.to_string(),
            timeframe,
            copy_rates_type: CopyRatesType::FromPosition,
            start_pos: Some(start_pos),
            count: Some(count),
            ..Default::default()
        }
    }

    /// `count` bars starting at `start_time`.
    pub fn from_time(symbol: &str, timeframe: i32, start_time: i32, count: i32) -> Self {
        CopyRatesRequest {
            symbol_name: symbol.to_string(),
            timeframe,
            copy_rates_type: CopyRatesType::FromTime,
            start_time: Some(start_time),
            count: Some(count),
            ..Default::default()
        }
    }

    /// Every bar between `start_time` and `stop_time`.
    pub fn time_range(symbol: &str, timeframe: i32, start_time: i32, stop_time: i32) -> Self {
        CopyRatesRequest {
            symbol_name: symbol.to_string(),
            timeframe,
            copy_rates_type: CopyRatesType::TimeRange,
            start_time: Some(start_time),
            stop_time: Some(stop_time),
            ..Default::default()
        }
    }
}

/// Read the depth of market of an instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarketBookGetRequest {
    /// Instrument name.
    pub symbol: String,
}

/// Open a position (netting/hedging accounts).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PositionOpenRequest {
    /// Instrument name.
    pub symbol: String,
    /// Order type code.
    pub order_type: i32,
    /// Lots.
    pub volume: f64,
    /// Price.
    pub price: f64,
    /// Stop loss level.
    pub sl: f64,
    /// Take profit level.
    pub tp: f64,
    /// Comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Close a position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PositionCloseRequest {
    /// Position ticket.
    pub ticket: u64,
    /// Maximum deviation in points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<u64>,
}

/// Discriminated Tier-2 request document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "RequestType")]
pub enum StructuredRequest {
    OrderSend(OrderSendRequest),
    OrderClose(OrderCloseRequest),
    OrderCloseBy(OrderCloseByRequest),
    OrderDelete(OrderDeleteRequest),
    OrderModify(OrderModifyRequest),
    SymbolInfoDouble(SymbolInfoRequest),
    SymbolInfoString(SymbolInfoRequest),
    SeriesInfoInteger(SeriesInfoIntegerRequest),
    CopyRates(CopyRatesRequest),
    MarketBookGet(MarketBookGetRequest),
    PositionOpen(PositionOpenRequest),
    PositionClose(PositionCloseRequest),
}

impl StructuredRequest {
    /// Name of the request kind, as written in the `RequestType` field.
    pub fn kind(&self) -> &'static str {
        match self {
            StructuredRequest::OrderSend(_) => "OrderSend",
            StructuredRequest::OrderClose(_) => "OrderClose",
            StructuredRequest::OrderCloseBy(_) => "OrderCloseBy",
            StructuredRequest::OrderDelete(_) => "OrderDelete",
            StructuredRequest::OrderModify(_) => "OrderModify",
            StructuredRequest::SymbolInfoDouble(_) => "SymbolInfoDouble",
            StructuredRequest::SymbolInfoString(_) => "SymbolInfoString",
            StructuredRequest::SeriesInfoInteger(_) => "SeriesInfoInteger",
            StructuredRequest::CopyRates(_) => "CopyRates",
            StructuredRequest::MarketBookGet(_) => "MarketBookGet",
            StructuredRequest::PositionOpen(_) => "PositionOpen",
            StructuredRequest::PositionClose(_) => "PositionClose",
        }
    }

    /// Serialized document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a document produced by [`Self::to_json`].
    pub fn from_json(doc: &str) -> Result<Self> {
        serde_json::from_str(doc).map_err(|e| {
            BridgeError::Protocol(format!(
                "structured request of {} bytes failed to parse: {e}",
                doc.len()
            ))
        })
    }

    /// Wraps the document as the sole argument of an `MT_REQUEST` command.
    pub fn into_command(&self, handle: SessionHandle) -> Result<Command> {
        Ok(Command::new(
            MT_REQUEST,
            vec![Arg::String(self.to_json()?)],
            handle,
        ))
    }

    /// Extracts the request from an `MT_REQUEST` command, engine side.
    pub fn from_command(command: &Command) -> Result<Self> {
        if command.command_type != MT_REQUEST {
            return Err(BridgeError::Protocol(format!(
                "command {} is not a structured request",
                command.command_type
            )));
        }
        let doc = command.param(0).and_then(Arg::as_str).ok_or_else(|| {
            BridgeError::Protocol("structured request document is missing".into())
        })?;
        Self::from_json(doc)
    }
}

/// Tier-2 answer: its own error code/message plus the typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct StructuredResponse<T> {
    /// 0 on success.
    pub error_code: i32,
    /// Engine message when `error_code` is non-zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> StructuredResponse<T> {
    /// Successful answer.
    pub fn ok(value: T) -> Self {
        StructuredResponse {
            error_code: 0,
            error_message: None,
            value: Some(value),
        }
    }

    /// Failed answer.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        StructuredResponse {
            error_code: code,
            error_message: Some(message.into()),
            value: None,
        }
    }
}

impl<T: Serialize> StructuredResponse<T> {
    /// Serialized document, engine side.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> StructuredResponse<T> {
    /// Parses an engine answer, reporting the payload size on failure.
    pub fn from_json(doc: &str) -> Result<Self> {
        serde_json::from_str(doc).map_err(|e| {
            BridgeError::Protocol(format!(
                "structured response of {} bytes failed to parse: {e}",
                doc.len()
            ))
        })
    }

    /// Maps a non-zero code to [`BridgeError::Engine`] and a missing value to a protocol error.
    ///
    /// A value that serializes as `null`, such as `()`, reads back as absent; it is rebuilt from
    /// `null` before the value is declared missing.
    pub fn into_value(self) -> Result<T> {
        if self.error_code != 0 {
            return Err(BridgeError::Engine {
                code: self.error_code,
                message: self.error_message.unwrap_or_default(),
            });
        }
        match self.value {
            Some(value) => Ok(value),
            None => serde_json::from_value(serde_json::Value::Null).map_err(|_| {
                BridgeError::Protocol("structured response carries no value".into())
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let request = StructuredRequest::OrderSend(OrderSendRequest {
            symbol: "EURUSD".into(),
            cmd: 0,
            volume: 0.1,
            ..Default::default()
        });
        let doc = request.to_json().unwrap();
        assert!(doc.contains("\"RequestType\":\"OrderSend\""));
        assert!(doc.contains("\"Symbol\":\"EURUSD\""));
        assert!(!doc.contains("StopLoss"));
        assert!(!doc.contains("Comment"));
        assert_eq!(StructuredRequest::from_json(&doc).unwrap(), request);
    }

    #[test]
    fn request_and_response_preserve_values_exactly() {
        let comment = "grid #3 · λ ✓".to_string();
        let request = StructuredRequest::OrderSend(OrderSendRequest {
            symbol: "GBPJPY".into(),
            cmd: 2,
            volume: 0.07,
            price: Some(187.123_456_789_012_3),
            stop_loss: Some(f64::MIN_POSITIVE),
            comment: Some(comment.clone()),
            magic: Some(i32::MAX),
            ..Default::default()
        });
        let command = request.into_command(7).unwrap();
        assert_eq!(command.command_type, MT_REQUEST);

        let wire = serde_json::to_string(&command).unwrap();
        let received: Command = serde_json::from_str(&wire).unwrap();
        let decoded = StructuredRequest::from_command(&received).unwrap();
        assert_eq!(decoded, request);

        let StructuredRequest::OrderSend(order) = decoded else {
            panic!("wrong kind");
        };
        let answer = StructuredResponse::ok((order.price.unwrap(), order.comment.unwrap()));
        let doc = answer.to_json().unwrap();
        let (price, text) = StructuredResponse::<(f64, String)>::from_json(&doc)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(price.to_bits(), 187.123_456_789_012_3_f64.to_bits());
        assert_eq!(text.as_bytes(), comment.as_bytes());
    }

    #[test]
    fn void_answer_round_trips() {
        let doc = StructuredResponse::ok(()).to_json().unwrap();
        StructuredResponse::<()>::from_json(&doc)
            .unwrap()
            .into_value()
            .unwrap();

        let err = StructuredResponse::<f64>::from_json(r#"{"ErrorCode":0}"#)
            .unwrap()
            .into_value()
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn error_code_maps_to_engine_error() {
        let doc = StructuredResponse::<i32>::error(130, "invalid stops")
            .to_json()
            .unwrap();
        let err = StructuredResponse::<i32>::from_json(&doc)
            .unwrap()
            .into_value()
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(130));
        assert!(err.to_string().contains("invalid stops"));
    }

    #[test]
    fn garbage_document_is_a_protocol_error() {
        let err = StructuredResponse::<i32>::from_json("{not json").unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("9 bytes"));
    }

    #[test]
    fn plain_command_is_not_a_structured_request() {
        let err = StructuredRequest::from_command(&Command::new(17, vec![], 1)).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn copy_rates_modes_keep_their_fields() {
        let request = StructuredRequest::CopyRates(CopyRatesRequest::time_range(
            "EURUSD", 60, 1_700_000_000, 1_700_086_400,
        ));
        let doc = request.to_json().unwrap();
        assert!(doc.contains("\"CopyRatesType\":\"TimeRange\""));
        assert!(!doc.contains("StartPos"));
        assert_eq!(StructuredRequest::from_json(&doc).unwrap(), request);
    }
}
