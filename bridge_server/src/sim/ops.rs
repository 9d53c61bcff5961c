//! Command table of the simulated engine.
use chrono::Utc;
use log::info;
use mtbridge_common::command::MT_REQUEST;
use mtbridge_common::error::CUSTOM_ERROR_CODE;
use mtbridge_common::request::{CopyRatesType, StructuredRequest, StructuredResponse};
use mtbridge_common::response::MqlRates;
use mtbridge_common::{Arg, Command, Response, ResponseValue};
use serde::Serialize;

use crate::sim::market::Market;

pub const ACCOUNT_BALANCE: i32 = 1;
pub const TIME_CURRENT: i32 = 2;
pub const PRINT: i32 = 3;
pub const IS_TESTING: i32 = 4;
pub const COPY_CLOSE: i32 = 5;
pub const MARKET_INFO: i32 = 17;

pub const MODE_BID: i32 = 1;
pub const MODE_ASK: i32 = 2;
pub const SYMBOL_BID: i32 = 1;
pub const SYMBOL_ASK: i32 = 4;

const ERR_INVALID_TRADE_VOLUME: i32 = 131;
const ERR_UNKNOWN_COMMAND: i32 = 4014;
const ERR_INVALID_PARAMETER: i32 = 4051;
const ERR_UNKNOWN_SYMBOL: i32 = 4106;

/// Engine-side state one simulated session executes against.
pub struct SimSession {
    pub handle: i32,
    pub test_mode: bool,
    pub market: Market,
    pub balance: f64,
    pub next_ticket: i32,
}

impl SimSession {
    pub fn new(handle: i32, test_mode: bool, market: Market) -> Self {
        SimSession {
            handle,
            test_mode,
            market,
            balance: 10_000.0,
            next_ticket: 1,
        }
    }
}

/// Executes one command and produces the engine's answer.
pub fn execute(command: &Command, session: &mut SimSession) -> Response {
    match command.command_type {
        ACCOUNT_BALANCE => Response::ok(ResponseValue::Double(session.balance)),
        TIME_CURRENT => Response::ok(ResponseValue::Long(Utc::now().timestamp())),
        PRINT => {
            let text = command.param(0).and_then(Arg::as_str).unwrap_or_default();
            info!("Session {} prints: {}", session.handle, text);
            Response::void()
        }
        IS_TESTING => Response::ok(ResponseValue::Bool(session.test_mode)),
        COPY_CLOSE => {
            let count = command.param(0).and_then(Arg::as_i32).unwrap_or(10).max(0) as usize;
            let closes = session
                .market
                .rates_from_position(0, count)
                .iter()
                .map(|r| r.close)
                .collect();
            Response::ok(ResponseValue::DoubleArray(closes))
        }
        MARKET_INFO => market_info(command, &session.market),
        MT_REQUEST => structured(command, session),
        other => Response::error(ERR_UNKNOWN_COMMAND, format!("unknown command {other}")),
    }
}

fn market_info(command: &Command, market: &Market) -> Response {
    let symbol = command.param(0).and_then(Arg::as_str);
    let mode = command.param(1).and_then(Arg::as_i32);
    match (symbol, mode) {
        (Some(s), _) if s != market.symbol => {
            Response::error(ERR_UNKNOWN_SYMBOL, format!("unknown symbol {s}"))
        }
        (Some(_), Some(MODE_BID)) => Response::ok(ResponseValue::Double(market.bid)),
        (Some(_), Some(MODE_ASK)) => Response::ok(ResponseValue::Double(market.ask())),
        _ => Response::error(ERR_INVALID_PARAMETER, "expected (symbol, mode)"),
    }
}

fn structured(command: &Command, session: &mut SimSession) -> Response {
    let request = match StructuredRequest::from_command(command) {
        Ok(request) => request,
        Err(e) => return Response::error(ERR_INVALID_PARAMETER, e.to_string()),
    };
    match request {
        StructuredRequest::OrderSend(r) => {
            if r.symbol != session.market.symbol {
                return encode(StructuredResponse::<i32>::error(
                    ERR_UNKNOWN_SYMBOL,
                    format!("unknown symbol {}", r.symbol),
                ));
            }
            if r.volume <= 0.0 {
                return encode(StructuredResponse::<i32>::error(
                    ERR_INVALID_TRADE_VOLUME,
                    "invalid trade volume",
                ));
            }
            let ticket = session.next_ticket;
            session.next_ticket += 1;
            info!(
                "Session {}: order #{} {} {} lots of {}",
                session.handle, ticket, r.cmd, r.volume, r.symbol
            );
            encode(StructuredResponse::ok(ticket))
        }
        StructuredRequest::SymbolInfoDouble(r) => {
            if r.symbol_name != session.market.symbol {
                return encode(StructuredResponse::<f64>::error(
                    ERR_UNKNOWN_SYMBOL,
                    format!("unknown symbol {}", r.symbol_name),
                ));
            }
            match r.prop_id {
                SYMBOL_BID => encode(StructuredResponse::ok(session.market.bid)),
                SYMBOL_ASK => encode(StructuredResponse::ok(session.market.ask())),
                other => encode(StructuredResponse::<f64>::error(
                    ERR_INVALID_PARAMETER,
                    format!("property {other} is not simulated"),
                )),
            }
        }
        StructuredRequest::CopyRates(r) => {
            let count = r.count.unwrap_or(0).max(0) as usize;
            let rates: Vec<MqlRates> = match r.copy_rates_type {
                CopyRatesType::FromPosition => session
                    .market
                    .rates_from_position(r.start_pos.unwrap_or(0).max(0) as usize, count),
                CopyRatesType::FromTime => session
                    .market
                    .rates_between(r.start_time.unwrap_or(0) as i64, i64::MAX)
                    .into_iter()
                    .take(count)
                    .collect(),
                CopyRatesType::TimeRange => session.market.rates_between(
                    r.start_time.unwrap_or(0) as i64,
                    r.stop_time.unwrap_or(i32::MAX) as i64,
                ),
            };
            encode(StructuredResponse::ok(rates))
        }
        other => encode(StructuredResponse::<()>::error(
            ERR_UNKNOWN_COMMAND,
            format!("{} is not simulated", other.kind()),
        )),
    }
}

fn encode<T: Serialize>(response: StructuredResponse<T>) -> Response {
    match response.to_json() {
        Ok(doc) => Response::ok(ResponseValue::String(doc)),
        Err(e) => Response::error(CUSTOM_ERROR_CODE, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtbridge_common::request::{OrderSendRequest, SymbolInfoRequest};

    fn session() -> SimSession {
        SimSession::new(7, false, Market::new("EURUSD", 1.2345, 0.0002, 100))
    }

    #[test]
    fn market_info_returns_bid() {
        let mut session = session();
        let command = Command::new(MARKET_INFO, vec!["EURUSD".into(), Arg::Int(MODE_BID)], 7);
        let response = execute(&command, &mut session);
        assert_eq!(response.into_result::<f64>().unwrap(), 1.2345);
    }

    #[test]
    fn unknown_command_is_an_engine_error() {
        let mut session = session();
        let response = execute(&Command::new(999, vec![], 7), &mut session);
        assert_eq!(response.error_code, ERR_UNKNOWN_COMMAND);
    }

    #[test]
    fn order_send_hands_out_increasing_tickets() {
        let mut session = session();
        let request = StructuredRequest::OrderSend(OrderSendRequest {
            symbol: "EURUSD".into(),
            volume: 0.1,
            ..Default::default()
        });
        for expected in 1..=2 {
            let doc: String = execute(&request.into_command(7).unwrap(), &mut session)
                .into_result()
                .unwrap();
            let ticket = StructuredResponse::<i32>::from_json(&doc)
                .unwrap()
                .into_value()
                .unwrap();
            assert_eq!(ticket, expected);
        }
    }

    #[test]
    fn symbol_info_of_other_symbol_fails_inside_the_envelope() {
        let mut session = session();
        let request = StructuredRequest::SymbolInfoDouble(SymbolInfoRequest {
            symbol_name: "GBPUSD".into(),
            prop_id: SYMBOL_BID,
        });
        let response = execute(&request.into_command(7).unwrap(), &mut session);
        assert!(response.is_ok());
        let doc: String = response.into_result().unwrap();
        let err = StructuredResponse::<f64>::from_json(&doc)
            .unwrap()
            .into_value()
            .unwrap_err();
        assert_eq!(err.engine_code(), Some(ERR_UNKNOWN_SYMBOL));
    }
}
