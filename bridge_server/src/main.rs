//! Bridge server with a simulated engine.
//!
//! This binary stands in for the trading platform: it starts a number of simulated engine
//! sessions that register through the `EngineAdapter`, publish random-walk quotes, emit a
//! `LastTimeBar` event for every closed bar and answer the commands remote clients send them.
//!
//! Wiring:
//! - `EngineAdapter`: owns the server of the configured port; each session registers on it.
//! - `SessionWaker`: routes "work pending" wake-ups to the thread of the addressed session.
//! - Session threads: `select!` over their wake-up channel, a tick timer and the shutdown
//!   channel; after each wake-up they drain their command queue one command at a time.
//!
//! Shutdown: Ctrl+C drops the shutdown sender, every session thread deinitialises itself and the
//! adapter stops the server, which notifies connected clients with `ServerStopped`.
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, select, unbounded};
use log::{error, info};
use mtbridge_common::net::DEFAULT_PORT;
use mtbridge_common::{BridgeError, Result};
use mtbridge_server::model::executor::EngineWaker;
use mtbridge_server::{EngineAdapter, ServerConfig};

use crate::sim::engine::{SessionSpec, SessionWaker, run_session};

mod sim;

const STARTUP_POLLS: u32 = 100;
const STARTUP_POLL: Duration = Duration::from_millis(20);

/// Command-line arguments of the bridge server.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Port of the network listeners; also names the local channel.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Instruments to simulate, one session each (comma separated).
    #[clap(long, value_delimiter = ',', default_value = "EURUSD,GBPUSD")]
    symbols: Vec<String>,

    /// Handle of the first session; the following sessions count up from it.
    #[clap(long, default_value_t = 1)]
    first_handle: i32,

    /// Milliseconds between simulated ticks.
    #[clap(long, default_value_t = 500)]
    tick_ms: u64,

    /// Ticks per simulated bar.
    #[clap(long, default_value_t = 10)]
    bar_ticks: u32,

    /// Run the sessions in tester mode.
    #[clap(long)]
    test_mode: bool,

    /// Directory of the local channel socket (system temp dir by default).
    #[clap(long)]
    runtime_dir: Option<PathBuf>,

    /// Do not open the local channel.
    #[clap(long)]
    no_local: bool,

    /// Listen on loopback only.
    #[clap(long)]
    loopback_only: bool,

    /// Seconds a remote command waits for the engine.
    #[clap(long, default_value_t = 40)]
    command_timeout: u64,
}

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let mut config = ServerConfig::with_port(args.port);
    config.command_timeout = Duration::from_secs(args.command_timeout);
    config.local_channel = !args.no_local;
    config.network_interfaces = !args.loopback_only;
    if let Some(dir) = args.runtime_dir.clone() {
        config.runtime_dir = dir;
    }

    let waker = Arc::new(SessionWaker::default());
    let engine_waker: Arc<dyn EngineWaker> = waker.clone();
    let adapter = Arc::new(EngineAdapter::new(config, engine_waker));

    let (interrupt_tx, interrupt_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        if interrupt_tx.try_send(()).is_err() {
            error!("Shutdown already requested");
        }
    })
    .map_err(|e| BridgeError::Connection(format!("Ctrl+C handler not installed: {e}")))?;

    let (stop_tx, stop_rx) = unbounded::<()>();
    let mut sessions = Vec::new();
    for (i, symbol) in args.symbols.iter().enumerate() {
        let spec = SessionSpec {
            handle: args.first_handle + i as i32,
            port: args.port,
            symbol: symbol.clone(),
            bid: 1.0 + 0.1 * (i as f64 + 1.0),
            spread: 0.0002,
            test_mode: args.test_mode,
            tick_interval: Duration::from_millis(args.tick_ms),
            bar_ticks: args.bar_ticks,
        };
        let wake_rx = waker.route(spec.handle)?;
        let adapter = Arc::clone(&adapter);
        let stop_rx = stop_rx.clone();
        let handle = spec.handle;
        sessions.push(thread::spawn(move || {
            if let Err(e) = run_session(adapter, spec, wake_rx, stop_rx) {
                error!("Session {} failed: {}", handle, e);
            }
        }));
    }

    let mut server = None;
    for _ in 0..STARTUP_POLLS {
        server = adapter.server(args.port)?;
        if server.is_some() {
            break;
        }
        thread::sleep(STARTUP_POLL);
    }
    match server {
        Some(server) => {
            info!("Bridge ready on {}", server.addresses()?.join(", "));
            let stopped = server.stopped();
            select! {
                recv(interrupt_rx) -> _ => info!("Interrupted, shutting down"),
                recv(stopped) -> _ => info!("Server stopped"),
            }
        }
        None => error!("No session could start a server on port {}", args.port),
    }

    drop(stop_tx);
    for session in sessions {
        if session.join().is_err() {
            error!("A session thread panicked");
        }
    }
    adapter.shutdown()
}

fn init_logger() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}
