//! Bridge client: connects to a bridge server, lists the registered sessions, optionally sends one
//! command and then prints quotes and engine events until Ctrl+C.
//!
//! Usage example (CLI):
//! ```bash
//! mtbridge-client --host 127.0.0.1 --port 8222 --handle 1 --market-info EURUSD
//! mtbridge-client --local --handle 1 --buy EURUSD --volume 0.2
//! ```
use std::collections::BTreeMap;

use clap::Parser;
use crossbeam_channel::{bounded, select};
use log::{error, info, warn};
use mtbridge_client::{BridgeClient, ClientConfig, ClientEvent, ConnectionState};
use mtbridge_common::event::DecodedEvent;
use mtbridge_common::net::{Endpoint, local_channel_path};
use mtbridge_common::request::OrderSendRequest;
use mtbridge_common::{Arg, BridgeError, Result, StructuredRequest};

use crate::args::Args;

mod args;

const MARKET_INFO: i32 = 17;
const MODE_BID: i32 = 1;
const OP_BUY: i32 = 0;

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let endpoint = if args.local {
        match &args.runtime_dir {
            Some(dir) => Endpoint::Local {
                path: local_channel_path(dir, args.port),
            },
            None => Endpoint::local(args.port),
        }
    } else {
        Endpoint::tcp(&args.host, args.port)
    };

    let client = BridgeClient::new(ClientConfig::new(endpoint));
    if let Some(handle) = args.handle {
        client.set_executor_handle(handle)?;
    }
    let events = client.subscribe()?;

    let (interrupt_tx, interrupt_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        if interrupt_tx.try_send(()).is_err() {
            error!("Shutdown already requested");
        }
    })
    .map_err(|e| BridgeError::Connection(format!("Ctrl+C handler not installed: {e}")))?;

    client.connect()?;
    for quote in client.get_quotes()? {
        info!("Session: {}", quote);
    }

    if let Some(symbol) = &args.market_info {
        match client.send_command::<f64>(
            MARKET_INFO,
            vec![Arg::from(symbol.as_str()), Arg::Int(MODE_BID)],
            BTreeMap::new(),
        ) {
            Ok(bid) => info!("MarketInfo {} bid = {}", symbol, bid),
            Err(e) => error!("MarketInfo {} failed: {}", symbol, e),
        }
    }
    if let Some(symbol) = &args.buy {
        let request = StructuredRequest::OrderSend(OrderSendRequest {
            symbol: symbol.clone(),
            cmd: OP_BUY,
            volume: args.volume,
            comment: Some("mtbridge-client".into()),
            ..Default::default()
        });
        match client.send_request::<i32>(request) {
            Ok(ticket) => info!("Order placed on {}: ticket {}", symbol, ticket),
            Err(e) => error!("Order on {} failed: {}", symbol, e),
        }
    }

    loop {
        select! {
            recv(interrupt_rx) -> _ => {
                info!("Interrupted, disconnecting");
                break;
            }
            recv(events) -> event => match event {
                Ok(event) => {
                    if !print_event(event) {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
    client.disconnect()
}

/// Prints one event; returns false once the connection is over.
fn print_event(event: ClientEvent) -> bool {
    match event {
        ClientEvent::QuoteUpdate(quote) => info!("{}", quote),
        ClientEvent::QuoteAdded(quote) => info!("Session added: {}", quote),
        ClientEvent::QuoteRemoved(quote) => info!("Session removed: {}", quote),
        ClientEvent::EngineEvent { raw, decoded } => match decoded {
            Some(DecodedEvent::LastTimeBar(bar)) => info!(
                "Bar {} {} .. {}: O {} H {} L {} C {}",
                bar.symbol,
                format_time(bar.open_time),
                format_time(bar.close_time),
                bar.open,
                bar.high,
                bar.low,
                bar.close
            ),
            Some(decoded) => info!("Event from session {}: {:?}", raw.expert_handle, decoded),
            None => warn!("Undecodable event: {}", raw),
        },
        ClientEvent::ConnectionStateChanged { state, message } => {
            info!(
                "Connection {}{}",
                state,
                message.map(|m| format!(": {m}")).unwrap_or_default()
            );
            return !matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Failed
            );
        }
    }
    true
}

fn format_time(engine_seconds: i32) -> String {
    chrono::DateTime::from_timestamp(i64::from(engine_seconds), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| engine_seconds.to_string())
}

fn init_logger() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}
