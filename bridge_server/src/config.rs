//! Server tuning knobs.
use std::path::PathBuf;
use std::time::Duration;

use mtbridge_common::net::DEFAULT_PORT;

/// How long a remote `SendCommand` waits for the engine.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(40);
/// Delay between the last session leaving and the server shutting down.
pub const IDLE_TEARDOWN: Duration = Duration::from_secs(1);
/// Read/write timeout of client connections.
pub const IO_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);
/// Grace period for connections to flush before they are aborted.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Silence after which a tester session is considered stuck.
pub const TESTER_STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration of one bridge server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port; also names the local channel. `0` lets the OS pick (tests).
    pub port: u16,
    /// Wait bound of a remote command.
    pub command_timeout: Duration,
    /// Idle teardown delay.
    pub idle_teardown: Duration,
    /// Connection read/write timeout.
    pub io_timeout: Duration,
    /// Graceful close budget.
    pub close_timeout: Duration,
    /// Tester stall timeout.
    pub tester_stall_timeout: Duration,
    /// Directory holding the local channel socket.
    pub runtime_dir: PathBuf,
    /// Open the local channel.
    pub local_channel: bool,
    /// Listen on `127.0.0.1`.
    pub loopback: bool,
    /// Listen on every IPv4 address of the host name.
    pub network_interfaces: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            command_timeout: COMMAND_TIMEOUT,
            idle_teardown: IDLE_TEARDOWN,
            io_timeout: IO_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
            tester_stall_timeout: TESTER_STALL_TIMEOUT,
            runtime_dir: std::env::temp_dir(),
            local_channel: true,
            loopback: true,
            network_interfaces: true,
        }
    }
}

impl ServerConfig {
    /// Default configuration on `port`.
    pub fn with_port(port: u16) -> Self {
        ServerConfig {
            port,
            ..ServerConfig::default()
        }
    }
}
