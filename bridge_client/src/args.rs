//! Command-line arguments of the bridge client.
use std::path::PathBuf;

use clap::Parser;
use mtbridge_common::net::DEFAULT_PORT;

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server host name or IP address.
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port; also names the local channel.
    #[clap(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Connect through the local channel instead of TCP.
    #[clap(long)]
    pub local: bool,

    /// Directory of the local channel socket (system temp dir by default).
    #[clap(long)]
    pub runtime_dir: Option<PathBuf>,

    /// Session to send commands to and receive events from.
    #[clap(long)]
    pub handle: Option<i32>,

    /// Ask the session for the bid of this instrument.
    #[clap(long)]
    pub market_info: Option<String>,

    /// Place a buy order on this instrument.
    #[clap(long)]
    pub buy: Option<String>,

    /// Lots of the order placed with `--buy`.
    #[clap(long, default_value_t = 0.1)]
    pub volume: f64,
}
